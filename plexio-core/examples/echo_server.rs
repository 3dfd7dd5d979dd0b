//! Single-threaded echo server.
//!
//! Usage: `cargo run --example echo_server [addr]` (default 127.0.0.1:7878),
//! then `nc 127.0.0.1 7878`.

use anyhow::Context as _;
use plexio_core::buffer::Buffer;
use plexio_core::channel::{ReadStatus, ServerSocketChannel, SocketChannel};
use plexio_core::event_loop::{handler, EventLoop, Handler, LoopConfig};
use plexio_core::select::{Ops, SelectionKey};
use std::net::SocketAddr;

/// Echo state for one connection: bytes read but not yet written back.
fn connection(stream: SocketChannel) -> impl Handler {
    let mut pending = Buffer::allocate(16 * 1024);
    handler(move |_cx, key: &SelectionKey| {
        if key.is_readable() {
            if let ReadStatus::EndOfStream = stream.read(&mut pending)? {
                tracing::info!("{} disconnected", stream.peer_addr()?);
                stream.close();
                return Ok(());
            }
        }

        pending.flip();
        stream.write(&mut pending)?;
        let backlog = pending.has_remaining();
        pending.compact();

        // Watch for writability only while output is queued
        let ops = if backlog { Ops::READ | Ops::WRITE } else { Ops::READ };
        if key.interest_ops() != ops {
            key.set_interest_ops(ops)?;
        }
        Ok(())
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .context("Invalid listen address")?;

    let listener = ServerSocketChannel::bind(addr, 128).context("Failed to bind")?;
    listener.configure_blocking(false)?;
    println!("Echo server listening on {}", listener.local_addr()?);

    let mut event_loop = EventLoop::new(LoopConfig {
        name: "echo".to_string(),
        ..LoopConfig::default()
    })?;

    let acceptor = listener.clone();
    event_loop.register(
        &listener,
        Ops::ACCEPT,
        handler(move |cx, _key| {
            while let Some(stream) = acceptor.accept()? {
                tracing::info!("Accepted {}", stream.peer_addr()?);
                stream.configure_blocking(false)?;
                stream.set_nodelay(true)?;
                cx.register(&stream, Ops::READ, connection(stream.clone()))?;
            }
            Ok(())
        }),
    )?;

    event_loop.run().context("Event loop failed")?;
    Ok(())
}
