//! utils for long running async tasks

use std::time::Duration;

use futures_util::{
    future::{ready, BoxFuture},
    Future, FutureExt,
};
use log::debug;
use tokio::task::JoinHandle;

use self::retry_policy::TaskRetryPolicy;

const LOG_TARGET: &str = "tasks";

pub mod retry_policy {
    //! retry policies for restartable tasks
    use super::*;

    /// Decides whether a finished task is restarted
    pub trait TaskRetryPolicy: Send + Sync + 'static {
        /// called after the task exits, `attempts` counts consecutive runs without progress
        ///
        /// Returns whether the task should be restarted, may sleep before returning
        fn check(&mut self, attempts: u32) -> BoxFuture<bool>;
    }

    /// Never restart
    pub fn never() -> FailFast {
        FailFast
    }

    /// Restart with exponentially increasing delay, up to `max_attempts` unproductive runs
    pub fn exponential_backoff(max_attempts: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            max_attempts,
            base: Duration::from_secs(1),
        }
    }

    pub struct FailFast;

    impl TaskRetryPolicy for FailFast {
        fn check(&mut self, _attempts: u32) -> BoxFuture<bool> {
            ready(false).boxed()
        }
    }

    pub struct ExponentialBackoff {
        max_attempts: u32,
        base: Duration,
    }

    impl ExponentialBackoff {
        /// Set the delay before the first restart (default 1s)
        pub fn base_delay(mut self, base: Duration) -> Self {
            self.base = base;
            self
        }
    }

    impl TaskRetryPolicy for ExponentialBackoff {
        fn check(&mut self, attempts: u32) -> BoxFuture<bool> {
            async move {
                if attempts >= self.max_attempts {
                    return false;
                }
                let delay = self.base * 2_u32.saturating_pow(attempts);
                tokio::time::sleep(delay).await;
                true
            }
            .boxed()
        }
    }
}

/// Spawns a restartable task
///
/// `task_fn` builds a fresh task future for every run. The future resolves `true` if it made
/// progress before exiting (e.g. delivered at least one item), which resets the attempt count
/// seen by `retry_policy`.
pub fn spawn_retry_task<F, G>(task_fn: G, mut retry_policy: impl TaskRetryPolicy) -> JoinHandle<()>
where
    F: Future<Output = bool> + Send + 'static,
    G: Fn() -> F + Send + 'static,
{
    tokio::spawn(async move {
        let mut attempts = 0;
        loop {
            if task_fn().await {
                attempts = 0;
            }
            if !retry_policy.check(attempts).await {
                debug!(target: LOG_TARGET, "task not restarted after {attempts} attempts");
                break;
            }
            attempts += 1;
        }
    })
}
