//! Dedicated single-thread worker queue for camera callbacks

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::error::{CameraError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Runs submitted jobs one at a time, in submission order, on one thread.
///
/// `shutdown` stops accepting work, lets every job submitted before it run,
/// then joins the thread.
pub struct CameraExecutor {
    handle: ExecutorHandle,
    worker: Option<JoinHandle<()>>,
}

/// Cloneable submission side of a [`CameraExecutor`].
#[derive(Clone)]
pub struct ExecutorHandle {
    sender: Sender<Message>,
    shutdown: Arc<AtomicBool>,
}

impl CameraExecutor {
    pub fn single_thread(name: &str) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(receiver))
            .map_err(|e| CameraError::unavailable(format!("failed to spawn {}: {}", name, e)))?;

        debug!("Started executor thread {}", name);

        Ok(Self {
            handle: ExecutorHandle {
                sender,
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.handle.execute(job)
    }

    pub fn is_shutdown(&self) -> bool {
        self.handle.is_shutdown()
    }

    pub fn shutdown(&mut self) {
        if self.handle.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.handle.sender.send(Message::Shutdown);

        if let Some(worker) = self.worker.take() {
            // Joining from the worker itself would deadlock; it exits on its own.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            let name = worker.thread().name().unwrap_or("executor").to_string();
            if worker.join().is_err() {
                error!("Executor thread {} terminated abnormally", name);
            } else {
                info!("Executor thread {} shut down", name);
            }
        }
    }
}

impl Drop for CameraExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ExecutorHandle {
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.is_shutdown() {
            return Err(CameraError::ExecutorShutdown);
        }
        self.sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| CameraError::ExecutorShutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn run_worker(receiver: Receiver<Message>) {
    for message in receiver.iter() {
        match message {
            Message::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Camera callback panicked; continuing with next job");
                }
            }
            Message::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn jobs_run_serially_in_order() {
        let mut executor = CameraExecutor::single_thread("test-serial").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let threads = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let seen = seen.clone();
            let threads = threads.clone();
            executor
                .execute(move || {
                    threads.lock().unwrap().push(thread::current().id());
                    seen.lock().unwrap().push(i);
                })
                .unwrap();
        }
        executor.shutdown();

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        let threads = threads.lock().unwrap();
        assert!(threads.iter().all(|id| *id == threads[0]));
        assert_ne!(threads[0], thread::current().id());
    }

    #[test]
    fn shutdown_drains_queued_jobs_then_rejects() {
        let mut executor = CameraExecutor::single_thread("test-drain").unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        executor
            .execute(move || {
                thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        let handle = executor.handle();
        executor.shutdown();

        assert!(done.load(Ordering::SeqCst));
        assert!(executor.is_shutdown());
        assert_eq!(handle.execute(|| {}), Err(CameraError::ExecutorShutdown));
    }

    #[test]
    fn panicking_job_does_not_stop_worker() {
        let mut executor = CameraExecutor::single_thread("test-panic").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        executor.execute(|| panic!("bad frame")).unwrap();
        executor
            .execute(move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        executor.shutdown();
        assert!(ran.load(Ordering::SeqCst));
    }
}
