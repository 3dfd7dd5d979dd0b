//! Positional file I/O through the disk engine, awaited from async code.

use plexio_core::buffer::Buffer;
use plexio_core::channel::FileChannel;
use plexio_core::disk::{DiskConfig, DiskEngine};
use plexio_core::error::DiskError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let path = "/tmp/plexio_example_async_file";
    let _ = std::fs::remove_file(path);
    let file = FileChannel::create(path)?;
    let engine = DiskEngine::start(DiskConfig::default())?;

    // Step 1: write two records at fixed offsets
    let (_, first) = engine
        .write_at(&file, Buffer::wrap(b"first record".to_vec()), 0)
        .await?;
    let (_, second) = engine
        .write_at(&file, Buffer::wrap(b"second record".to_vec()), 64)
        .await?;
    engine.sync(&file, true).await?;
    println!("Wrote {} + {} bytes", first, second);

    // Step 2: read the second record back
    let (mut buffer, status) = engine.read_at(&file, Buffer::allocate(32), 64).await?;
    buffer.flip();
    println!(
        "Read {:?}: {:?}",
        status,
        String::from_utf8_lossy(&buffer.to_vec()?)
    );

    // Step 3: a cancelled operation resolves to Cancelled
    let mut pending = engine.write_at(&file, Buffer::wrap(b"maybe".to_vec()), 128);
    let prevented = pending.cancel();
    match pending.await {
        Err(DiskError::Cancelled) => println!("Cancelled write (effect prevented: {})", prevented),
        other => println!("Unexpected result: {:?}", other.map(|(_, n)| n)),
    }

    engine.shutdown();
    file.close();
    std::fs::remove_file(path)?;
    Ok(())
}
