//! Runner group: a fixed pool of runners over one queue.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelSource;
use crate::error::ConveyorError;
use crate::runner::{JobRunner, RunOutcome};

/// Handle over `n` concurrently polling runners.
///
/// Shutdown is cooperative: cancellation stops runners from taking new
/// entries, it does not abort a job mid-flight. A job already running
/// finishes and settles its entry before the runner exits.
pub struct RunnerGroup {
    cancel: CancelSource,
    joins: Vec<JoinHandle<()>>,
}

impl RunnerGroup {
    /// Spawn `n` runner loops sharing one runner configuration.
    pub fn spawn(n: usize, runner: Arc<JobRunner>) -> Self {
        let cancel = CancelSource::new();

        let mut joins = Vec::with_capacity(n);
        for runner_id in 0..n {
            let runner = Arc::clone(&runner);
            let token = cancel.token();

            let join = tokio::spawn(async move {
                runner_loop(runner_id, runner, token).await;
            });
            joins.push(join);
        }

        Self { cancel, joins }
    }

    /// Request shutdown for all runners without waiting.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Shutdown and wait for all runners to exit.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            // ignore join error: a panicked loop has already logged
            let _ = join.await;
        }
    }
}

async fn runner_loop(
    runner_id: usize,
    runner: Arc<JobRunner>,
    token: crate::cancel::CancelToken,
) {
    debug!(runner_id, "runner started");
    loop {
        match runner.run_once(&token).await {
            Ok(RunOutcome::Cancelled) => break,
            Ok(_) => {}
            Err(ConveyorError::StaleLease(id)) => {
                // Another runner reclaimed the entry; ours is done with it.
                debug!(runner_id, %id, "lease lost, entry reclaimed elsewhere");
            }
            Err(err) => {
                warn!(runner_id, error = %err, "runner cycle failed");
            }
        }
    }
    debug!(runner_id, "runner stopped");
}
