//! Cooperative tasklet pool for chunk I/O.
//!
//! Handlers submit one tasklet per chunk so the disk write of chunk `i`
//! overlaps the bulk transfer of chunk `i+1`: transfers run on the async
//! reactor while tasklets execute on a bounded pool of blocking I/O
//! workers. Completion is signalled through an [`Eventual`], a one-shot
//! value slot the submitter joins on.
//!
//! In-flight tasklets are never cancelled; a failed request marks its
//! accumulator and the remaining tasklets run to completion.

use std::sync::Arc;
use tokio::sync::{Semaphore, oneshot};

/// Outcome of one tasklet: errno (0 on success) and the bytes it moved.
/// Failed tasklets report the bytes of any partial progress they made.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskResult {
    pub errno: i32,
    pub bytes: u64,
}

impl TaskResult {
    pub fn ok(bytes: u64) -> Self {
        Self { errno: 0, bytes }
    }

    pub fn err(errno: i32) -> Self {
        Self { errno, bytes: 0 }
    }
}

/// Completion handle holding the tasklet's value once set.
pub struct Eventual<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Eventual<T> {
    /// Wait for the value. `None` means the tasklet died before setting
    /// it, which callers account as an I/O failure.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}

/// Bounded pool of blocking I/O workers. Submission never blocks the
/// caller; tasklets queue on the pool semaphore and run on the blocking
/// thread pool as permits free up.
#[derive(Clone)]
pub struct IoPool {
    permits: Arc<Semaphore>,
}

impl IoPool {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "I/O pool needs at least one worker");
        Self {
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn spawn<T, F>(&self, work: F) -> Eventual<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // the pool semaphore is never closed
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Ok(value) = tokio::task::spawn_blocking(work).await {
                let _ = tx.send(value);
            }
        });
        Eventual { rx }
    }
}

/// Wait for every tasklet; fold into the first non-zero errno observed and
/// the byte sum across all tasklets, failed ones included.
pub async fn join_all(tasks: Vec<Eventual<TaskResult>>) -> (i32, u64) {
    let mut first_errno = 0;
    let mut total_bytes = 0u64;
    for task in tasks {
        match task.wait().await {
            Some(result) => {
                if first_errno == 0 && result.errno != 0 {
                    first_errno = result.errno;
                }
                total_bytes += result.bytes;
            }
            // a vanished tasklet counts as an I/O failure
            None => {
                if first_errno == 0 {
                    first_errno = libc::EIO;
                }
            }
        }
    }
    (first_errno, total_bytes)
}
