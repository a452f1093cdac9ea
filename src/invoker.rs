use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::{
    backends::{KeyStore, Queue},
    error::Error,
    registry::Registry,
    result::ResultHandle,
    task::{Outcome, TaskInvocation},
};

/// Task-store key holding the persisted schedule snapshot.
pub const SCHEDULE_KEY: &str = "schedule";

const REVOKED_KEY_PREFIX: &str = "revoked:";

/// Interpret a naive timestamp as local wall time and convert it to UTC.
/// Nonexistent local times (DST gaps) fall back to reading it as UTC.
pub fn local_to_utc(eta: NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(&eta) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        chrono::LocalResult::None => Utc.from_utc_datetime(&eta),
    }
}

/// Encode/decode bridge between producers, the queue, and the stores. The
/// producer API surface (immediate and deferred enqueue, revocation) lives
/// here; the consumer side uses `dequeue` and the result/schedule writers.
pub struct Invoker {
    queue: Arc<dyn Queue>,
    result_store: Arc<dyn KeyStore>,
    task_store: Arc<dyn KeyStore>,
    registry: Arc<Registry>,
    utc: bool,
}

impl Invoker {
    pub fn new(
        queue: Arc<dyn Queue>,
        result_store: Arc<dyn KeyStore>,
        task_store: Arc<dyn KeyStore>,
        registry: Arc<Registry>,
    ) -> Invoker {
        Invoker {
            queue,
            result_store,
            task_store,
            registry,
            utc: true,
        }
    }

    /// Whether deferred enqueues convert `eta` from local time by default.
    pub fn with_utc(mut self, utc: bool) -> Invoker {
        self.utc = utc;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub async fn queue_size(&self) -> Result<usize, Error> {
        Ok(self.queue.size().await?)
    }

    pub async fn enqueue(&self, invocation: &TaskInvocation) -> Result<(), Error> {
        let encoded = serde_json::to_vec(invocation)?;
        self.queue.write(encoded).await?;
        Ok(())
    }

    /// Take and decode the next queued invocation. A decode failure
    /// consumes the message; the caller is expected to drop it.
    pub async fn dequeue(&self) -> Result<Option<TaskInvocation>, Error> {
        match self.queue.read().await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn build_invocation(
        &self,
        handler_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<TaskInvocation, Error> {
        let record = self.registry.resolve(handler_name)?;
        let mut invocation = TaskInvocation::new(handler_name, args, kwargs);
        invocation.retries_remaining = record.default_retries;
        invocation.retry_delay = record.default_retry_delay;
        Ok(invocation)
    }

    /// Immediate enqueue of a registered handler.
    pub async fn invoke(
        self: &Arc<Self>,
        handler_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<ResultHandle, Error> {
        let invocation = self.build_invocation(handler_name, args, kwargs)?;
        self.enqueue(&invocation).await?;
        Ok(ResultHandle::new(self.clone(), invocation.task_id))
    }

    /// Deferred enqueue: stamp an execute time and let the consumer hold
    /// the invocation until then. `convert_utc` defaults to the invoker's
    /// `utc` setting; when true, `eta` is local wall time.
    pub async fn schedule(
        self: &Arc<Self>,
        handler_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        eta: NaiveDateTime,
        convert_utc: Option<bool>,
    ) -> Result<ResultHandle, Error> {
        let mut invocation = self.build_invocation(handler_name, args, kwargs)?;
        invocation.execute_time = Some(if convert_utc.unwrap_or(self.utc) {
            local_to_utc(eta)
        } else {
            Utc.from_utc_datetime(&eta)
        });
        self.enqueue(&invocation).await?;
        Ok(ResultHandle::new(self.clone(), invocation.task_id))
    }

    pub async fn write_result(&self, task_id: &str, outcome: &Outcome) -> Result<(), Error> {
        let encoded = serde_json::to_vec(outcome)?;
        self.result_store.put(task_id, encoded).await?;
        Ok(())
    }

    pub async fn read_result(&self, task_id: &str) -> Result<Option<Outcome>, Error> {
        match self.result_store.get(task_id).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_result(&self, task_id: &str) -> Result<(), Error> {
        self.result_store.delete(task_id).await?;
        Ok(())
    }

    /// Mark an invocation so the consumer skips it instead of executing.
    pub async fn revoke(&self, task_id: &str) -> Result<(), Error> {
        let key = format!("{}{}", REVOKED_KEY_PREFIX, task_id);
        self.task_store.put(&key, Vec::new()).await?;
        Ok(())
    }

    pub async fn is_revoked(&self, task_id: &str) -> Result<bool, Error> {
        let key = format!("{}{}", REVOKED_KEY_PREFIX, task_id);
        Ok(self.task_store.get(&key).await?.is_some())
    }

    pub async fn clear_revoked(&self, task_id: &str) -> Result<(), Error> {
        let key = format!("{}{}", REVOKED_KEY_PREFIX, task_id);
        self.task_store.delete(&key).await?;
        Ok(())
    }

    pub async fn write_schedule(&self, entries: &[TaskInvocation]) -> Result<(), Error> {
        let encoded = serde_json::to_vec(entries)?;
        self.task_store.put(SCHEDULE_KEY, encoded).await?;
        Ok(())
    }

    pub async fn read_schedule(&self) -> Result<Option<Vec<TaskInvocation>>, Error> {
        match self.task_store.get(SCHEDULE_KEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
