//! Worker loop
//!
//! A long-running cooperative scheduler: keeps up to
//! `max_concurrent_masters` processing cycles in flight, pacing idle and
//! failing slots, and drains in-flight cycles on shutdown.

use std::sync::Arc;

use common::Config;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::cycle::{Outcome, Processor};

pub struct Worker {
    processor: Arc<Processor>,
    config: Arc<Config>,
    shutdown: CancellationToken,

    /// Admission control: one permit per concurrently processed master.
    limiter: Arc<Semaphore>,

    /// The set of in-flight processing cycles.
    cycles: JoinSet<Outcome>,
}

impl Worker {
    pub fn new(processor: Processor, config: Arc<Config>, shutdown: CancellationToken) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_masters));
        Self {
            processor: Arc::new(processor),
            config,
            shutdown,
            limiter,
            cycles: JoinSet::new(),
        }
    }

    /// Run until the shutdown token fires, then drain in-flight cycles.
    pub async fn run(mut self) {
        tracing::info!(
            worker = %self.processor.worker_id(),
            max_concurrent_masters = self.config.max_concurrent_masters,
            poll_interval = ?self.config.poll_interval,
            "worker loop started"
        );

        loop {
            tokio::select! { biased;
                _ = self.shutdown.cancelled() => break,

                Some(res) = self.cycles.join_next(), if !self.cycles.is_empty() => {
                    self.handle_cycle_result(res);
                }

                permit = self.limiter.clone().acquire_owned() => {
                    // The semaphore is owned by this loop and never closed.
                    let permit = permit.expect("semaphore closed");
                    self.spawn_cycle(permit);
                }
            }
        }

        tracing::info!("shutdown requested, waiting for in-flight cycles");
        while let Some(res) = self.cycles.join_next().await {
            self.handle_cycle_result(res);
        }
        tracing::info!("worker loop stopped");
    }

    /// Spawn one processing cycle holding a concurrency permit.
    ///
    /// After the cycle finishes, the task keeps the permit through the idle
    /// or transient-error pause so that an empty queue or a failing store is
    /// not hammered by an immediately re-opened slot. A cycle that failed for
    /// a non-transient cause already finalized its master; the next master is
    /// unrelated and there is nothing to back off from.
    fn spawn_cycle(&mut self, permit: OwnedSemaphorePermit) {
        let processor = self.processor.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        self.cycles.spawn(async move {
            let outcome = processor.run_one(&shutdown).await;

            let pause = match &outcome {
                Outcome::Processed(_) => None,
                Outcome::Idle => Some(config.poll_interval),
                Outcome::Errored(err) if err.is_transient() => Some(config.error_backoff),
                Outcome::Errored(_) => None,
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            drop(permit);
            outcome
        });
    }

    fn handle_cycle_result(&mut self, result: Result<Outcome, tokio::task::JoinError>) {
        match result {
            Ok(Outcome::Processed(master_id)) => {
                tracing::debug!(%master_id, "cycle finished");
            }
            Ok(Outcome::Idle) => {
                tracing::trace!("cycle found no work");
            }
            Ok(Outcome::Errored(err)) => {
                tracing::error!(error = %err, transient = err.is_transient(), "cycle failed");
            }
            Err(err) => {
                tracing::error!(error = %err, "cycle task panicked");
            }
        }
    }
}
