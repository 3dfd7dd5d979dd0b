//! Copies a file by mapping it and writing the mapped view out.
//!
//! Usage: `cargo run --example mapped_copy <source> <destination>`

use anyhow::{bail, Context};
use plexio_core::channel::FileChannel;
use plexio_core::mmap::MapMode;
use std::fs::OpenOptions;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        bail!("usage: {} <source> <destination>", args[0]);
    }

    let source = FileChannel::open(&args[1], OpenOptions::new().read(true))
        .with_context(|| format!("Failed to open {}", args[1]))?;
    let destination = FileChannel::create(&args[2])
        .with_context(|| format!("Failed to create {}", args[2]))?;

    let len = source.size()?;
    if len == 0 {
        println!("Source is empty, nothing to copy");
        return Ok(());
    }
    let len = usize::try_from(len).context("Source too large to map")?;

    let region = source.map(MapMode::ReadOnly, 0, len)?;
    let mut view = region.buffer();
    while view.has_remaining() {
        destination.write(&mut view)?;
    }
    destination.force(true)?;

    println!("Copied {} bytes from {} to {}", len, args[1], args[2]);

    // Closing the source releases the mapping; the view is unusable after
    source.close();
    assert!(!view.is_valid());
    Ok(())
}
