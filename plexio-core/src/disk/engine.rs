//! The disk engine and its worker pool.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::arch::{CpuInfo, ThreadBuilder, WorkerThread};
use crate::buffer::Buffer;
use crate::channel::{FileChannel, ReadStatus};
use crate::disk::completion::OpState;
use crate::disk::{Completion, DiskConfig};
use crate::error::DiskError;

/// A queued operation. Runs at most once, on whichever worker takes it.
type Job = Box<dyn FnOnce() + Send>;

/// Runs file operations on worker threads.
///
/// Workers share one unbounded queue. Dropping the engine (or calling
/// [`shutdown`](Self::shutdown)) stops accepting work, lets the workers
/// finish what is queued, and joins them.
pub struct DiskEngine {
    config: DiskConfig,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<WorkerThread<()>>>,
}

impl DiskEngine {
    /// Starts the worker threads.
    pub fn start(config: DiskConfig) -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let count = config.worker_threads.max(1);
        let mut builder = ThreadBuilder::new(config.pin_threads, &CpuInfo::detect());
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let rx = rx.clone();
            workers.push(builder.spawn(&format!("plexio-disk-{}", index), move || {
                worker_loop(&rx)
            })?);
        }

        tracing::info!("Disk engine started with {} worker(s)", count);
        Ok(Self {
            config,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Reads into `[position, limit)` of `buffer` at `offset` of `file`.
    /// The buffer is handed back with the result.
    pub fn read_at(
        &self,
        file: &FileChannel,
        mut buffer: Buffer,
        offset: u64,
    ) -> Completion<(Buffer, ReadStatus)> {
        let file = file.clone();
        self.submit(move || {
            let status = file.read_at(&mut buffer, offset)?;
            Ok((buffer, status))
        })
    }

    /// Writes `[position, limit)` of `buffer` at `offset` of `file`. The
    /// buffer is handed back with the byte count.
    pub fn write_at(
        &self,
        file: &FileChannel,
        mut buffer: Buffer,
        offset: u64,
    ) -> Completion<(Buffer, usize)> {
        let file = file.clone();
        self.submit(move || {
            let written = file.write_at(&mut buffer, offset)?;
            Ok((buffer, written))
        })
    }

    /// Flushes `file` to storage, including metadata if asked.
    pub fn sync(&self, file: &FileChannel, metadata: bool) -> Completion<()> {
        let file = file.clone();
        self.submit(move || Ok(file.force(metadata)?))
    }

    /// Queues `op` and returns its completion. After shutdown the
    /// completion resolves to [`DiskError::EngineStopped`].
    pub(crate) fn submit<T, F>(&self, op: F) -> Completion<T>
    where
        F: FnOnce() -> Result<T, DiskError> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let state = OpState::new();
        let completion = Completion::new(result_rx, state.clone());

        let job_state = state.clone();
        let job: Job = Box::new(move || {
            if !job_state.start() {
                let _ = result_tx.send(Err(DiskError::Cancelled));
                return;
            }
            let result = op();
            let _ = result_tx.send(result);
            job_state.finish();
        });

        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let rejected = match tx.as_ref() {
            Some(tx) => tx.send(job).is_err(),
            None => true,
        };
        if rejected {
            // The dropped job drops its sender, resolving the completion
            tracing::debug!("Disk operation submitted after shutdown");
            state.finish();
        }
        completion
    }

    /// Stops accepting work, runs what is queued and joins the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Disk worker panicked");
            }
        }
        tracing::info!("Disk engine stopped");
    }
}

/// Runs jobs until the queue is closed and empty.
fn worker_loop(rx: &Mutex<mpsc::UnboundedReceiver<Job>>) {
    loop {
        let job = rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocking_recv();
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

impl Drop for DiskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DiskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskEngine")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn scratch(name: &str) -> String {
        let path = format!("/tmp/plexio_disk_{}", name);
        let _ = fs::remove_file(&path);
        path
    }

    /// An engine with one worker held busy until the returned sender fires.
    fn blocked_engine() -> (DiskEngine, std_mpsc::Sender<()>) {
        let engine = DiskEngine::start(DiskConfig {
            worker_threads: 1,
            pin_threads: false,
        })
        .unwrap();
        let (release, gate) = std_mpsc::channel::<()>();
        let _busy = engine.submit(move || {
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(())
        });
        (engine, release)
    }

    #[test]
    fn test_write_then_read_at() {
        let path = scratch("roundtrip");
        let file = FileChannel::create(&path).unwrap();
        let engine = DiskEngine::start(DiskConfig::default()).unwrap();

        let (buffer, written) = engine
            .write_at(&file, Buffer::wrap(b"completion".to_vec()), 4)
            .wait()
            .unwrap();
        assert_eq!(written, 10);
        assert!(!buffer.has_remaining());
        engine.sync(&file, true).wait().unwrap();

        let (mut buffer, status) = engine.read_at(&file, Buffer::allocate(16), 4).wait().unwrap();
        assert_eq!(status, ReadStatus::Bytes(10));
        buffer.flip();
        assert_eq!(buffer.to_vec().unwrap(), b"completion");
        assert_eq!(file.size().unwrap(), 14);

        let (_, status) = engine.read_at(&file, Buffer::allocate(4), 14).wait().unwrap();
        assert_eq!(status, ReadStatus::EndOfStream);

        drop(engine);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_cancel_queued_write_prevents_it() {
        let path = scratch("cancel_queued");
        let file = FileChannel::create(&path).unwrap();
        let (engine, release) = blocked_engine();

        let mut write = engine.write_at(&file, Buffer::wrap(b"never".to_vec()), 0);
        assert!(write.cancel());
        release.send(()).unwrap();

        assert!(matches!(write.wait(), Err(DiskError::Cancelled)));
        engine.shutdown();
        assert_eq!(file.size().unwrap(), 0);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_try_take_polls_without_blocking() {
        let path = scratch("try_take");
        let file = FileChannel::create(&path).unwrap();
        let (engine, release) = blocked_engine();

        let mut write = engine.write_at(&file, Buffer::wrap(b"later".to_vec()), 0);
        assert!(write.try_take().is_none());
        assert!(!write.is_finished());
        release.send(()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let result = loop {
            if let Some(result) = write.try_take() {
                break result;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(result.unwrap().1, 5);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_submit_after_shutdown() {
        let path = scratch("after_shutdown");
        let file = FileChannel::create(&path).unwrap();
        let engine = DiskEngine::start(DiskConfig::default()).unwrap();
        engine.shutdown();
        engine.shutdown();

        let completion = engine.sync(&file, false);
        assert!(completion.is_finished());
        let result = completion.wait();
        assert!(matches!(result, Err(DiskError::EngineStopped)));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_failed_operation_reports_channel_error() {
        let path = scratch("closed_file");
        let file = FileChannel::create(&path).unwrap();
        file.close();
        let engine = DiskEngine::start(DiskConfig::default()).unwrap();

        let result = engine.read_at(&file, Buffer::allocate(4), 0).wait();
        assert!(matches!(result, Err(DiskError::Channel(_))));
        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_await_write_and_read() {
        let path = scratch("async");
        let file = FileChannel::create(&path).unwrap();
        let engine = DiskEngine::start(DiskConfig::default()).unwrap();

        let (_, written) = engine
            .write_at(&file, Buffer::wrap(b"awaited".to_vec()), 0)
            .await
            .unwrap();
        assert_eq!(written, 7);

        let (mut buffer, _) = engine.read_at(&file, Buffer::allocate(7), 0).await.unwrap();
        buffer.flip();
        assert_eq!(buffer.to_vec().unwrap(), b"awaited");

        // Joins worker threads; fine outside the workers themselves
        drop(engine);
        fs::remove_file(&path).unwrap();
    }
}
