//! Worker pool draining a controller's work queue

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::Reconcile;

/// Runs reconciles for keys taken from one [`WorkQueue`].
///
/// The queue never hands the same key to two workers at once, so any number
/// of workers is safe.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
    max_retries: u32,
}

impl WorkerPool {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>, max_retries: u32) -> Self {
        Self {
            queue,
            reconciler,
            max_retries,
        }
    }

    /// Run `workers` workers until `shutdown` fires and the queue has drained
    pub async fn run(self, workers: usize, shutdown: CancellationToken) {
        let pool = Arc::new(self);
        info!(
            kind = pool.reconciler.kind(),
            queue = pool.queue.name(),
            workers,
            "Starting workers"
        );

        let stopper = {
            let queue = pool.queue.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                queue.shut_down();
            })
        };

        let handles = (0..workers).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { while pool.process_next_item().await {} })
        });
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        stopper.abort();
        info!(kind = pool.reconciler.kind(), "Workers stopped");
    }

    /// Reconcile one key. Returns false once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic.as_ref()))));
        self.queue.done(&key);
        self.handle_result(&key, result);
        true
    }

    fn handle_result(&self, key: &str, result: crate::Result<()>) {
        let kind = self.reconciler.kind();
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        metrics::RECONCILIATION_ERRORS.with_label_values(&[kind]).inc();

        if !err.is_retryable() {
            self.drop_key(key, "permanent", &err);
            return;
        }

        let requeues = self.queue.num_requeues(key);
        if requeues < self.max_retries {
            warn!(
                kind,
                key,
                attempt = requeues + 1,
                error = %err,
                "Reconcile failed, requeueing"
            );
            self.queue.add_rate_limited(key);
        } else {
            self.drop_key(key, "retries_exhausted", &err);
        }
    }

    fn drop_key(&self, key: &str, reason: &str, err: &Error) {
        let kind = self.reconciler.kind();
        self.queue.forget(key);
        metrics::DROPPED_KEYS.with_label_values(&[kind, reason]).inc();
        error!(kind, key, reason, error = %err, "Dropping key");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
