//! Event loops over a selector.
//!
//! An [`EventLoop`] owns a [`Selector`](crate::select::Selector) and a
//! handler per registration. Each cycle it polls, then calls the handler of
//! every ready key once. A failing handler is reported to an [`ErrorSink`]
//! and never takes the loop or other handlers down with it.

mod handler;
mod looper;

pub use handler::{handler, Context, ErrorSink, Handler, HandlerFailure, LogSink};
pub use looper::{EventLoop, LoopHandle};

use std::time::Duration;

use crate::select::SelectorConfig;

/// Event loop settings.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub selector: SelectorConfig,

    /// Longest single poll; `None` waits until readiness or a wake-up.
    pub poll_timeout: Option<Duration>,

    /// Used in log lines.
    pub name: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            selector: SelectorConfig::default(),
            poll_timeout: None,
            name: "plexio-loop".to_string(),
        }
    }
}

/// Lifecycle of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Between cycles, or not started.
    Idle,
    /// Waiting in the selector.
    Polling,
    /// Calling handlers.
    Dispatching,
    /// Terminal. The selector is closed.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::channel::{ReadStatus, ServerSocketChannel, SocketChannel};
    use crate::error::SelectorError;
    use crate::select::{Ops, SelectionKey, Token};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::Instant;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn listener() -> (ServerSocketChannel, SocketAddr) {
        let listener = ServerSocketChannel::bind("127.0.0.1:0".parse().unwrap(), 64).unwrap();
        listener.configure_blocking(false).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// A connected non-blocking pair: (our channel, the peer's std stream).
    fn stream_pair() -> (SocketChannel, TcpStream) {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let channel = SocketChannel::connect_to(std_listener.local_addr().unwrap()).unwrap();
        let (peer, _) = std_listener.accept().unwrap();
        channel.configure_blocking(false).unwrap();
        (channel, peer)
    }

    fn wait_for_state(handle: &LoopHandle, state: LoopState) -> bool {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            if handle.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Echoes everything read back to the peer; closes on end of stream.
    fn echo(stream: SocketChannel) -> impl Handler {
        let mut buf = Buffer::allocate(1024);
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

    /// Sets a flag when dropped.
    struct DropFlag {
        dropped: Arc<AtomicBool>,
        cancel_on_ready: bool,
    }

    impl Handler for DropFlag {
        fn ready(&mut self, _cx: &mut Context, key: &SelectionKey) -> anyhow::Result<()> {
            if self.cancel_on_ready {
                key.cancel();
            }
            Ok(())
        }
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_config() {
        let config = LoopConfig::default();
        assert_eq!(config.poll_timeout, None);
        assert_eq!(config.name, "plexio-loop");

        let event_loop = EventLoop::new(config).unwrap();
        assert_eq!(event_loop.state(), LoopState::Idle);
        assert_eq!(event_loop.name(), "plexio-loop");
    }

    #[test]
    fn test_echo_on_loop_thread() {
        let (listener, addr) = listener();
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let handle = event_loop.handle();

        event_loop
            .register(
                &listener.clone(),
                Ops::ACCEPT,
                handler(move |cx, _key| {
                    while let Some(stream) = listener.accept()? {
                        stream.configure_blocking(false)?;
                        cx.register(&stream, Ops::READ, echo(stream.clone()))?;
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let worker = thread::spawn(move || event_loop.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(DEADLINE)).unwrap();
        for message in [&b"hello"[..], b"event loop"] {
            client.write_all(message).unwrap();
            let mut echoed = vec![0u8; message.len()];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, message);
        }

        handle.stop();
        worker.join().unwrap().unwrap();
        assert_eq!(handle.state(), LoopState::Stopped);
    }

    #[test]
    fn test_handler_failures_are_isolated() {
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let failures = Arc::new(Mutex::new(Vec::<Token>::new()));
        let sink_failures = failures.clone();
        event_loop.set_error_sink(move |failure: HandlerFailure| {
            sink_failures.lock().unwrap().push(failure.token);
        });

        // Peers write without the handlers reading, so every key stays ready
        let (failing, mut failing_peer) = stream_pair();
        let (panicking, mut panicking_peer) = stream_pair();
        let (healthy, mut healthy_peer) = stream_pair();
        for peer in [&mut failing_peer, &mut panicking_peer, &mut healthy_peer] {
            peer.write_all(b"x").unwrap();
        }

        let failing_key = event_loop
            .register(&failing, Ops::READ, handler(|_cx, _key| Err(anyhow::anyhow!("boom"))))
            .unwrap();
        let panicking_key = event_loop
            .register(&panicking, Ops::READ, handler(|_cx, _key| panic!("handler panic")))
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let healthy_calls = calls.clone();
        event_loop
            .register(
                &healthy,
                Ops::READ,
                handler(move |_cx, _key| {
                    healthy_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let deadline = Instant::now() + DEADLINE;
        while calls.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            event_loop.run_once(Some(Duration::from_millis(50))).unwrap();
        }

        assert!(calls.load(Ordering::SeqCst) >= 2);
        let failures = failures.lock().unwrap();
        assert!(failures.contains(&failing_key.token()));
        assert!(failures.contains(&panicking_key.token()));
        // Failure does not cancel the registration
        assert!(failing_key.is_valid());
        assert!(panicking_key.is_valid());
        assert_eq!(event_loop.state(), LoopState::Idle);
    }

    #[test]
    fn test_handler_cancelling_its_key_is_dropped() {
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let (stream, mut peer) = stream_pair();
        peer.write_all(b"x").unwrap();

        let dropped = Arc::new(AtomicBool::new(false));
        let key = event_loop
            .register(
                &stream,
                Ops::READ,
                DropFlag {
                    dropped: dropped.clone(),
                    cancel_on_ready: true,
                },
            )
            .unwrap();

        let deadline = Instant::now() + DEADLINE;
        while !dropped.load(Ordering::SeqCst) && Instant::now() < deadline {
            event_loop.run_once(Some(Duration::from_millis(50))).unwrap();
        }
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!key.is_valid());

        // Never dispatched again
        assert_eq!(event_loop.run_once(Some(Duration::from_millis(20))).unwrap(), 0);
    }

    #[test]
    fn test_external_cancel_drops_handler() {
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let (stream, _peer) = stream_pair();

        let dropped = Arc::new(AtomicBool::new(false));
        let key = event_loop
            .register(
                &stream,
                Ops::READ,
                DropFlag {
                    dropped: dropped.clone(),
                    cancel_on_ready: false,
                },
            )
            .unwrap();
        event_loop.run_once(Some(Duration::ZERO)).unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        key.cancel();
        event_loop.run_once(Some(Duration::ZERO)).unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_from_other_thread_during_poll() {
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let handle = event_loop.handle();
        let worker = thread::spawn(move || event_loop.run());

        assert!(wait_for_state(&handle, LoopState::Polling));
        handle.stop();
        worker.join().unwrap().unwrap();
        assert_eq!(handle.state(), LoopState::Stopped);
        assert!(handle.wake().is_err());
    }

    #[test]
    fn test_register_through_handle_from_other_thread() {
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let handle = event_loop.handle();
        let worker = thread::spawn(move || event_loop.run());
        assert!(wait_for_state(&handle, LoopState::Polling));

        let (listener, addr) = listener();
        let (accepted_tx, accepted_rx) = mpsc::channel();
        handle
            .register(
                &listener.clone(),
                Ops::ACCEPT,
                handler(move |_cx, _key| {
                    while let Some(stream) = listener.accept()? {
                        let _ = accepted_tx.send(stream.peer_addr()?);
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let peer = accepted_rx.recv_timeout(DEADLINE).unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        handle.stop();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_stop_from_handler() {
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let (stream, mut peer) = stream_pair();
        peer.write_all(b"x").unwrap();
        event_loop
            .register(
                &stream,
                Ops::READ,
                handler(|cx, _key| {
                    cx.stop();
                    Ok(())
                }),
            )
            .unwrap();

        event_loop.run().unwrap();
        assert_eq!(event_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn test_stopped_loop_is_terminal() {
        let mut event_loop = EventLoop::new(LoopConfig::default()).unwrap();
        let handle = event_loop.handle();
        handle.stop();

        assert_eq!(event_loop.run_once(Some(Duration::ZERO)).unwrap(), 0);
        assert_eq!(event_loop.state(), LoopState::Stopped);
        assert!(event_loop.run().is_ok());

        let (listener, _) = listener();
        let result = handle.register(&listener, Ops::ACCEPT, handler(|_cx, _key| Ok(())));
        assert!(matches!(result, Err(SelectorError::Closed)));
    }
}
