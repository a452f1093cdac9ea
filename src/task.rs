use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of work: a handler name plus its arguments and delivery
/// parameters. The wire form on the queue and in the persisted schedule.
///
/// `task_id` identifies the invocation for its whole lifetime; re-enqueues
/// after a failure keep the same id so observers holding a result handle
/// continue to see updates.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInvocation {
    pub task_id: String,
    pub handler_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub execute_time: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
    #[serde(with = "serde_millis")]
    pub retry_delay: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<Box<TaskInvocation>>,
}

impl TaskInvocation {
    pub fn new(
        handler_name: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> TaskInvocation {
        TaskInvocation {
            task_id: uuid::Uuid::new_v4().to_string(),
            handler_name: handler_name.into(),
            args,
            kwargs,
            execute_time: None,
            retries_remaining: 0,
            retry_delay: Duration::from_secs(0),
            on_complete: None,
        }
    }
}

impl std::fmt::Debug for TaskInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInvocation")
            .field("task_id", &self.task_id)
            .field("handler_name", &self.handler_name)
            .field("execute_time", &self.execute_time)
            .field("retries_remaining", &self.retries_remaining)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

/// Terminal result written to the result store, keyed by task id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Success(Value),
    Failure(String),
}
