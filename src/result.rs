use std::{cmp, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{event, Level};

use crate::{error::Error, invoker::Invoker, task::Outcome};

const INITIAL_POLL_DELAY: Duration = Duration::from_millis(100);

/// How a blocking [`ResultHandle::get`] polls the result store.
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Give up after this long; `None` polls until the outcome appears.
    pub timeout: Option<Duration>,
    /// Multiplier applied to the poll delay after each empty read.
    pub backoff: f64,
    pub max_delay: Duration,
    /// Revoke the invocation before reporting a timeout.
    pub revoke_on_timeout: bool,
}

impl Default for GetOptions {
    fn default() -> GetOptions {
        GetOptions {
            timeout: None,
            backoff: 1.15,
            max_delay: Duration::from_secs(1),
            revoke_on_timeout: false,
        }
    }
}

/// Producer-side view of one invocation's terminal outcome.
pub struct ResultHandle {
    invoker: Arc<Invoker>,
    pub task_id: String,
}

impl ResultHandle {
    pub(crate) fn new(invoker: Arc<Invoker>, task_id: String) -> ResultHandle {
        ResultHandle { invoker, task_id }
    }

    /// Non-blocking read. `Ok(None)` while the task is still pending; a
    /// persisted failure outcome is raised as [`Error::TaskFailed`].
    pub async fn try_get(&self) -> Result<Option<Value>, Error> {
        match self.invoker.read_result(&self.task_id).await? {
            None => Ok(None),
            Some(Outcome::Success(value)) => Ok(Some(value)),
            Some(Outcome::Failure(message)) => Err(Error::TaskFailed(message)),
        }
    }

    /// Poll until the outcome appears, with exponentially increasing waits.
    pub async fn get(&self, options: GetOptions) -> Result<Value, Error> {
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut delay = INITIAL_POLL_DELAY;

        loop {
            if let Some(value) = self.try_get().await? {
                return Ok(value);
            }

            let mut sleep_for = delay;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    if options.revoke_on_timeout {
                        if let Err(e) = self.invoker.revoke(&self.task_id).await {
                            event!(Level::ERROR, task_id = %self.task_id, error = %e,
                                "failed to revoke timed-out task");
                        }
                    }
                    return Err(Error::ResultTimeout);
                }
                sleep_for = cmp::min(sleep_for, deadline - now);
            }

            tokio::time::sleep(sleep_for).await;
            delay = cmp::min(delay.mul_f64(options.backoff), options.max_delay);
        }
    }
}
