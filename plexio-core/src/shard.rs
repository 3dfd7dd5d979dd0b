//! Groups of event loops, one per thread.
//!
//! A [`LoopGroup`] runs several [`EventLoop`]s side by side and hands out
//! their [`LoopHandle`]s round-robin, so accepted connections can be spread
//! over cores while each channel stays on a single loop.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::arch::{CpuInfo, ThreadBuilder, WorkerThread};
use crate::error::SelectorError;
use crate::event_loop::{EventLoop, LoopConfig, LoopHandle};

/// Loop group settings.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Number of loops; 0 starts one per logical core.
    pub loops: usize,

    /// Pin each loop thread to its own core.
    pub pin_threads: bool,

    /// Template for every loop. Its name is replaced per loop.
    pub loop_config: LoopConfig,

    /// Loop `i` and its thread are named `{name_prefix}-{i}`.
    pub name_prefix: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            loops: 0,
            pin_threads: false,
            loop_config: LoopConfig::default(),
            name_prefix: "plexio".to_string(),
        }
    }
}

/// Running event loops on their own threads.
pub struct LoopGroup {
    handles: Vec<LoopHandle>,
    workers: Mutex<Vec<WorkerThread<Result<(), SelectorError>>>>,
    next: AtomicUsize,
}

impl LoopGroup {
    /// Creates the loops and starts each on a named thread.
    ///
    /// If any loop fails to start, the ones already running are stopped and
    /// joined before the error is returned.
    pub fn start(config: GroupConfig) -> Result<Self, SelectorError> {
        let cpu_info = CpuInfo::detect();
        let count = match config.loops {
            0 => cpu_info.logical_cores(),
            n => n,
        };
        let mut builder = ThreadBuilder::new(config.pin_threads, &cpu_info);

        let mut group = Self {
            handles: Vec::with_capacity(count),
            workers: Mutex::new(Vec::with_capacity(count)),
            next: AtomicUsize::new(0),
        };
        for index in 0..count {
            let name = format!("{}-{}", config.name_prefix, index);
            let mut event_loop = EventLoop::new(LoopConfig {
                name: name.clone(),
                ..config.loop_config.clone()
            })?;

            let handle = event_loop.handle();
            let worker = builder
                .spawn(&name, move || event_loop.run())
                .map_err(SelectorError::Platform)?;
            group.handles.push(handle);
            group.workers_mut().push(worker);
        }

        tracing::info!("Started {} event loop(s)", count);
        Ok(group)
    }

    /// The next loop in round-robin order.
    pub fn next(&self) -> &LoopHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[index]
    }

    pub fn handles(&self) -> &[LoopHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops every loop and waits for its thread. Returns each loop's
    /// [`EventLoop::run`] result in start order.
    pub fn shutdown(mut self) -> Vec<Result<(), SelectorError>> {
        self.stop_and_join()
    }

    fn workers_mut(&mut self) -> &mut Vec<WorkerThread<Result<(), SelectorError>>> {
        self.workers.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_and_join(&mut self) -> Vec<Result<(), SelectorError>> {
        for handle in &self.handles {
            handle.stop();
        }

        mem::take(self.workers_mut())
            .into_iter()
            .map(|worker| {
                let name = worker.name().unwrap_or("event loop").to_string();
                worker.join().unwrap_or_else(|_| {
                    tracing::error!("Thread of {} panicked", name);
                    Err(SelectorError::Platform(io::Error::new(
                        io::ErrorKind::Other,
                        format!("{} panicked", name),
                    )))
                })
            })
            .collect()
    }
}

impl Drop for LoopGroup {
    fn drop(&mut self) {
        if !self.workers_mut().is_empty() {
            self.stop_and_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ServerSocketChannel;
    use crate::event_loop::{handler, LoopState};
    use crate::select::Ops;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::Duration;

    fn config(loops: usize) -> GroupConfig {
        GroupConfig {
            loops,
            name_prefix: "test-group".to_string(),
            ..GroupConfig::default()
        }
    }

    #[test]
    fn test_round_robin_over_loops() {
        let group = LoopGroup::start(config(3)).unwrap();
        assert_eq!(group.len(), 3);

        let names: Vec<String> = (0..4).map(|_| group.next().name().to_string()).collect();
        assert_eq!(
            names,
            vec!["test-group-0", "test-group-1", "test-group-2", "test-group-0"]
        );

        let results = group.shutdown();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|result| result.is_ok()));
    }

    #[test]
    fn test_zero_loops_means_one_per_core() {
        let group = LoopGroup::start(config(0)).unwrap();
        assert_eq!(group.len(), CpuInfo::detect().logical_cores());
    }

    #[test]
    fn test_registered_channel_served_by_group() {
        let group = LoopGroup::start(config(2)).unwrap();
        let listener = ServerSocketChannel::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        listener.configure_blocking(false).unwrap();
        let addr = listener.local_addr().unwrap();

        let (accepted_tx, accepted_rx) = mpsc::channel();
        group
            .next()
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
        let peer = accepted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        let handles = group.handles().to_vec();
        drop(group);
        assert!(handles.iter().all(|h| h.state() == LoopState::Stopped));
    }
}
