//! Fixed-size worker pools with bounded queues
//!
//! Notification and event fan-out run on these pools instead of a task
//! per send, which caps concurrency and keeps one slow session from
//! blocking the rest. Submission is non-blocking: a full queue is an
//! error the caller logs. Panics inside jobs are recovered and counted.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::core::error::{HubError, HubResult};
use crate::core::metrics::global_metrics;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A fixed pool of workers draining one bounded queue
pub struct WorkerPool {
    name: &'static str,
    tx: StdMutex<Option<mpsc::Sender<Job>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("name", &self.name).finish()
    }
}

impl WorkerPool {
    /// Start `workers` tasks sharing a queue of `capacity` jobs
    pub fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(job) = job else { return };

                        if std::panic::AssertUnwindSafe(job)
                            .catch_unwind()
                            .await
                            .is_err()
                        {
                            global_metrics().record_recovered_panic();
                            error!(pool = name, worker, "recovered panic in worker job");
                        }
                    }
                })
            })
            .collect();

        Self {
            name,
            tx: StdMutex::new(Some(tx)),
            workers: StdMutex::new(handles),
        }
    }

    /// Enqueue a job without blocking; a full queue is surfaced to the
    /// caller, who logs rather than propagates it.
    pub fn submit<F>(&self, job: F) -> HubResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock().expect("pool sender lock");
        let Some(tx) = tx.as_ref() else {
            return Err(HubError::queue_full(format!("{} pool stopped", self.name)));
        };
        tx.try_send(Box::pin(job)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                HubError::queue_full(format!("{} pool queue full", self.name))
            }
            mpsc::error::TrySendError::Closed(_) => {
                HubError::queue_full(format!("{} pool stopped", self.name))
            }
        })
    }

    /// Close the queue and wait up to `grace` for workers to drain;
    /// stragglers are aborted.
    pub async fn stop(&self, grace: Duration) {
        self.tx.lock().expect("pool sender lock").take();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("pool workers lock")
            .drain(..)
            .collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let drain = async move {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            debug!(pool = self.name, "grace expired, aborting workers");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(handles) = self.workers.lock() {
            for handle in handles.iter() {
                handle.abort();
            }
        }
    }
}
