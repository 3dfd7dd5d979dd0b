//! Echo server spread over one event loop per core.
//!
//! The main thread accepts connections and hands each one to the next loop
//! of a [`LoopGroup`].
//!
//! Usage: `cargo run --example sharded_echo [addr]` (default 127.0.0.1:7879)

use anyhow::Context as _;
use plexio_core::buffer::Buffer;
use plexio_core::channel::{ReadStatus, ServerSocketChannel, SocketChannel};
use plexio_core::event_loop::{handler, EventLoop, Handler, LoopConfig};
use plexio_core::select::Ops;
use plexio_core::shard::{GroupConfig, LoopGroup};
use std::net::SocketAddr;

fn echo(stream: SocketChannel) -> impl Handler {
    let mut buf = Buffer::allocate(16 * 1024);
    handler(move |_cx, _key| {
        if let ReadStatus::EndOfStream = stream.read(&mut buf)? {
            stream.close();
            return Ok(());
        }
        buf.flip();
        while buf.has_remaining() {
            stream.write(&mut buf)?;
        }
        buf.clear();
        Ok(())
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7879".to_string())
        .parse()
        .context("Invalid listen address")?;

    let group = LoopGroup::start(GroupConfig {
        pin_threads: true,
        name_prefix: "echo-shard".to_string(),
        ..GroupConfig::default()
    })
    .context("Failed to start loop group")?;
    println!("Started {} echo shard(s)", group.len());

    let listener = ServerSocketChannel::bind(addr, 1024).context("Failed to bind")?;
    listener.configure_blocking(false)?;
    println!("Sharded echo server listening on {}", listener.local_addr()?);

    let mut acceptor = EventLoop::new(LoopConfig {
        name: "acceptor".to_string(),
        ..LoopConfig::default()
    })?;

    let shards = group.handles().to_vec();
    let mut next = 0;
    let incoming = listener.clone();
    acceptor.register(
        &listener,
        Ops::ACCEPT,
        handler(move |_cx, _key| {
            while let Some(stream) = incoming.accept()? {
                stream.configure_blocking(false)?;
                let shard = &shards[next % shards.len()];
                next += 1;
                shard.register(&stream, Ops::READ, echo(stream.clone()))?;
                tracing::debug!("Connection handed to {}", shard.name());
            }
            Ok(())
        }),
    )?;

    let result = acceptor.run();
    for (index, result) in group.shutdown().into_iter().enumerate() {
        if let Err(e) = result {
            eprintln!("Shard {} failed: {}", index, e);
        }
    }
    result.context("Acceptor loop failed")
}
