use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use backoff::backoff::Backoff;
use chrono::{DateTime, Timelike, Utc};
use futures::{
    future::FutureExt,
    stream::{FuturesUnordered, StreamExt},
};
use serde_json::Map;
use tokio::{
    task::JoinHandle,
    time::{interval, sleep},
};
use tracing::{event, Level};

use crate::{
    config::ConsumerConfig,
    error::Error,
    invoker::Invoker,
    iterable_queue::{IterableQueue, StreamItem},
    pool::WorkerPool,
    schedule::Schedule,
    shutdown::{ShutdownCoordinator, ShutdownWatcher, TaskDrain},
    task::{Outcome, TaskInvocation},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// The consumer runtime: one message receiver, one scheduler tick, and a
/// dispatcher fanning invocations out to workers gated by the pool.
pub struct Consumer(Arc<ConsumerInner>);

struct ConsumerInner {
    invoker: Arc<Invoker>,
    config: ConsumerConfig,
    schedule: Schedule,
    pool: WorkerPool,
    work_queue: IterableQueue<TaskInvocation>,

    coordinator: ShutdownCoordinator,
    shutdown_started: AtomicBool,
    state: Mutex<RunState>,

    receiver_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl Clone for Consumer {
    fn clone(&self) -> Consumer {
        Consumer(self.0.clone())
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.0.invoker.queue().name())
            .field("threads", &self.0.config.threads)
            .field("state", &self.state())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Consumer {
    pub fn new(invoker: Arc<Invoker>, config: ConsumerConfig) -> Result<Consumer, Error> {
        config.validate()?;

        let pool = WorkerPool::new(config.threads);

        Ok(Consumer(Arc::new(ConsumerInner {
            invoker,
            config,
            schedule: Schedule::new(),
            pool,
            work_queue: IterableQueue::new(),
            coordinator: ShutdownCoordinator::new(),
            shutdown_started: AtomicBool::new(false),
            state: Mutex::new(RunState::Stopped),
            receiver_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            scheduler_task: Mutex::new(None),
        })))
    }

    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.0.invoker
    }

    pub fn schedule(&self) -> &Schedule {
        &self.0.schedule
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.0.pool
    }

    pub fn state(&self) -> RunState {
        *self.0.state.lock().unwrap()
    }

    pub fn shutdown_watcher(&self) -> ShutdownWatcher {
        self.0.coordinator.watcher()
    }

    /// Load the persisted schedule, then bring up the scheduler tick, the
    /// worker dispatcher, and the message receiver.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.0.state.lock().unwrap();
            if *state != RunState::Stopped {
                return Ok(());
            }
            *state = RunState::Starting;
        }

        event!(Level::INFO, queue = %self.0.invoker.queue().name(),
            threads = self.0.config.threads, "starting consumer");

        if let Err(e) = self.load_schedule().await {
            event!(Level::ERROR, error = %e, "failed to load persisted schedule");
        }

        self.start_worker_pool();
        self.start_scheduler();
        self.start_message_receiver();

        *self.0.state.lock().unwrap() = RunState::Running;
        Ok(())
    }

    pub fn start_message_receiver(&self) {
        let mut task = self.0.receiver_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        event!(Level::INFO, queue = %self.0.invoker.queue().name(), "starting message receiver");
        let consumer = self.clone();
        *task = Some(tokio::spawn(async move { consumer.receiver_loop().await }));
    }

    pub fn start_worker_pool(&self) {
        let mut task = self.0.dispatch_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        event!(Level::INFO, threads = self.0.config.threads, "starting worker pool");
        let consumer = self.clone();
        *task = Some(tokio::spawn(async move { consumer.dispatch_loop().await }));
    }

    pub fn start_scheduler(&self) {
        let mut task = self.0.scheduler_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        event!(Level::INFO, "starting scheduled task checker");
        let consumer = self.clone();
        *task = Some(tokio::spawn(async move { consumer.scheduler_loop().await }));
    }

    /// Start, wait for a shutdown signal, shut down. The usual entry point
    /// for a daemon.
    pub async fn run(&self) -> Result<(), Error> {
        self.start().await?;
        let mut watcher = self.shutdown_watcher();
        watcher.stopped().await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting work, drain in-flight workers up to the configured
    /// drain timeout, and persist the schedule. Idempotent; in-flight
    /// executions are never preempted.
    pub async fn shutdown(&self) {
        if self.0.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.0.state.lock().unwrap() = RunState::Stopping;
        event!(Level::INFO, "stopping consumer");

        let drain = TaskDrain::new(self.0.config.drain_timeout);
        self.0.coordinator.trigger();

        let receiver = self.0.receiver_task.lock().unwrap().take();
        drain.retire("message receiver", receiver).await;

        // The receiver is stopped, so nothing else will feed the dispatch
        // queue; the sentinel lets the dispatcher finish in-flight work.
        self.0.work_queue.put(StreamItem::EndOfStream);

        let dispatch = self.0.dispatch_task.lock().unwrap().take();
        drain.retire("worker pool", dispatch).await;

        let scheduler = self.0.scheduler_task.lock().unwrap().take();
        drain.retire("scheduler", scheduler).await;

        if let Err(e) = self.save_schedule().await {
            event!(Level::ERROR, error = %e, "failed to persist schedule during shutdown");
        }

        *self.0.state.lock().unwrap() = RunState::Stopped;
        event!(Level::INFO, "consumer stopped");
    }

    /// One receiver iteration: acquire a worker slot, pull the next
    /// message, and route it. Returns whether the iteration was productive;
    /// an empty or failed read tells the caller to back off.
    pub async fn check_message(&self) -> bool {
        if !self.0.pool.acquire(true, None).await {
            return false;
        }

        let invocation = match self.0.invoker.dequeue().await {
            Ok(Some(invocation)) => invocation,
            Ok(None) => {
                self.0.pool.release();
                return false;
            }
            Err(e @ Error::Decode(_)) => {
                event!(Level::ERROR, error = %e, "dropping malformed message");
                self.0.pool.release();
                return true;
            }
            Err(e) => {
                event!(Level::ERROR, error = %e, "error reading from queue");
                self.0.pool.release();
                return false;
            }
        };

        if let Err(e) = self.0.invoker.registry().resolve(&invocation.handler_name) {
            event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                "dropping message for unregistered handler");
            self.0.pool.release();
            return true;
        }

        if let Some(at) = invocation.execute_time {
            if at > Utc::now() {
                self.0.schedule.add(invocation);
                self.0.pool.release();
                return true;
            }
        }

        // Slot stays held; the worker releases it after execution.
        self.0.work_queue.put(StreamItem::Item(invocation));
        true
    }

    async fn receiver_loop(&self) {
        let mut watcher = self.0.coordinator.watcher();
        let stopped = watcher.stopped();
        tokio::pin!(stopped);

        let mut backoff = self.0.config.idle_backoff();
        let mut sleep_time = Duration::from_millis(0);

        loop {
            if sleep_time > Duration::from_millis(0) {
                tokio::select! {
                    biased;

                    _ = &mut stopped => break,
                    _ = sleep(sleep_time) => {}
                };
            }

            tokio::select! {
                biased;

                _ = &mut stopped => break,
                productive = self.check_message() => {
                    if productive {
                        backoff.reset();
                        sleep_time = Duration::from_millis(0);
                    } else {
                        sleep_time = backoff
                            .next_backoff()
                            .unwrap_or(self.0.config.max_delay);
                    }
                }
            };
        }

        event!(Level::INFO, "message receiver stopped");
    }

    async fn dispatch_loop(&self) {
        let mut active_tasks = FuturesUnordered::<JoinHandle<()>>::new();

        loop {
            tokio::select! {
                item = self.0.work_queue.next() => match item {
                    Some(invocation) => {
                        let consumer = self.clone();
                        active_tasks.push(tokio::spawn(async move {
                            consumer.worker(invocation).await;
                        }));
                    }
                    None => break,
                },
                Some(res) = active_tasks.next() => {
                    if let Err(e) = res {
                        event!(Level::ERROR, error = %e, "worker task panicked");
                    }
                }
            };
        }

        // End of stream; let in-flight work run to completion.
        while let Some(res) = active_tasks.next().await {
            if let Err(e) = res {
                event!(Level::ERROR, error = %e, "worker task panicked");
            }
        }

        event!(Level::INFO, "worker pool stopped");
    }

    /// Execute one invocation and release the worker slot. The caller must
    /// already hold the slot; it is returned on every exit path.
    pub async fn worker(&self, invocation: TaskInvocation) {
        self.execute(invocation).await;
        self.0.pool.release();
    }

    async fn execute(&self, invocation: TaskInvocation) {
        match self.0.invoker.is_revoked(&invocation.task_id).await {
            Ok(true) => {
                event!(Level::INFO, task_id = %invocation.task_id, "not executing revoked task");
                if let Err(e) = self.0.invoker.clear_revoked(&invocation.task_id).await {
                    event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                        "failed to clear revocation marker");
                }
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Revocation is advisory; execute anyway when the marker
                // cannot be read.
                event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                    "failed to check revocation marker");
            }
        }

        let record = match self.0.invoker.registry().resolve(&invocation.handler_name) {
            Ok(record) => record,
            Err(e) => {
                event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                    "dropping message for unregistered handler");
                return;
            }
        };

        let call = std::panic::AssertUnwindSafe(
            record
                .handler
                .call(invocation.args.clone(), invocation.kwargs.clone()),
        )
        .catch_unwind();

        let result = match call.await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match result {
            Ok(value) => self.complete(invocation, value).await,
            Err(error) => self.retry_or_fail(invocation, error).await,
        }
    }

    async fn complete(&self, mut invocation: TaskInvocation, value: serde_json::Value) {
        if let Err(e) = self
            .0
            .invoker
            .write_result(&invocation.task_id, &Outcome::Success(value))
            .await
        {
            event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                "failed to write task result");
        }

        if let Some(next) = invocation.on_complete.take() {
            if let Err(e) = self.0.invoker.enqueue(&next).await {
                event!(Level::ERROR, task_id = %next.task_id, error = %e,
                    "failed to enqueue follow-up task");
            }
        }
    }

    async fn retry_or_fail(&self, mut invocation: TaskInvocation, error: anyhow::Error) {
        event!(Level::ERROR, task_id = %invocation.task_id, error = ?error,
            "unhandled exception in worker thread");

        if invocation.retries_remaining == 0 {
            if let Err(e) = self
                .0
                .invoker
                .write_result(&invocation.task_id, &Outcome::Failure(error.to_string()))
                .await
            {
                event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                    "failed to write task result");
            }
            return;
        }

        invocation.retries_remaining -= 1;
        event!(
            Level::INFO,
            "re-enqueueing task {}, {} tries left",
            invocation.task_id,
            invocation.retries_remaining
        );

        if invocation.retry_delay.as_millis() == 0 {
            if let Err(e) = self.0.invoker.enqueue(&invocation).await {
                event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                    "failed to re-enqueue task");
            }
        } else {
            let delay = chrono::Duration::from_std(invocation.retry_delay)
                .unwrap_or_else(|_| chrono::Duration::max_value());
            invocation.execute_time = Some(Utc::now() + delay);
            self.0.schedule.add(invocation);
        }
    }

    async fn scheduler_loop(&self) {
        let mut watcher = self.0.coordinator.watcher();
        let stopped = watcher.stopped();
        tokio::pin!(stopped);

        let mut tick = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                biased;

                _ = &mut stopped => break,
                _ = tick.tick() => {}
            };

            let now = Utc::now();
            self.check_schedule(now).await;

            if self.0.config.periodic && now.second() == 0 {
                self.check_periodic(now).await;
            }
        }

        event!(Level::INFO, "scheduler stopped");
    }

    /// Promote every schedule entry due at `now` back onto the queue.
    pub async fn check_schedule(&self, now: DateTime<Utc>) {
        let due = self.0.schedule.due(now);
        let mut enqueued = 0usize;

        for invocation in due {
            match self.0.invoker.enqueue(&invocation).await {
                Ok(()) => enqueued += 1,
                Err(e) => {
                    event!(Level::ERROR, task_id = %invocation.task_id, error = %e,
                        "failed to enqueue scheduled task; keeping it scheduled");
                    self.0.schedule.add(invocation);
                }
            }
        }

        if enqueued > 0 {
            event!(Level::INFO, count = enqueued, "enqueued scheduled tasks");
        }
    }

    /// Enqueue every periodic handler whose cron predicate matches the
    /// minute containing `now`. The tick calls this once per minute.
    pub async fn check_periodic(&self, now: DateTime<Utc>) {
        for record in self.0.invoker.registry().periodic_handlers() {
            let matches = match record.periodic.as_ref() {
                Some(schedule) => schedule.matches(now),
                None => continue,
            };

            match matches {
                Ok(true) => {
                    let mut invocation =
                        TaskInvocation::new(record.name.clone(), Vec::new(), Map::new());
                    invocation.retries_remaining = record.default_retries;
                    invocation.retry_delay = record.default_retry_delay;

                    event!(Level::INFO, handler = %record.name, task_id = %invocation.task_id,
                        "enqueueing periodic task");
                    if let Err(e) = self.0.invoker.enqueue(&invocation).await {
                        event!(Level::ERROR, handler = %record.name, error = %e,
                            "failed to enqueue periodic task");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    event!(Level::ERROR, handler = %record.name, error = %e,
                        "invalid periodic schedule");
                }
            }
        }
    }

    pub async fn save_schedule(&self) -> Result<(), Error> {
        let entries = self.0.schedule.snapshot();
        event!(Level::INFO, count = entries.len(), "persisting schedule");
        self.0.invoker.write_schedule(&entries).await
    }

    pub async fn load_schedule(&self) -> Result<(), Error> {
        if let Some(entries) = self.0.invoker.read_schedule().await? {
            event!(Level::INFO, count = entries.len(), "restored persisted schedule");
            self.0.schedule.restore(entries);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryKeyStore, MemoryQueue};
    use crate::registry::{Handler, HandlerRecord, Registry};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct AlwaysFails;

    #[async_trait]
    impl Handler for AlwaysFails {
        async fn call(
            &self,
            _args: Vec<Value>,
            _kwargs: Map<String, Value>,
        ) -> Result<Value, anyhow::Error> {
            Err(anyhow::anyhow!("nope"))
        }
    }

    struct Panics;

    #[async_trait]
    impl Handler for Panics {
        async fn call(
            &self,
            _args: Vec<Value>,
            _kwargs: Map<String, Value>,
        ) -> Result<Value, anyhow::Error> {
            panic!("boom");
        }
    }

    fn test_consumer() -> Consumer {
        let registry = Arc::new(Registry::new());
        registry
            .register(
                HandlerRecord::new("fails-slow", Arc::new(AlwaysFails))
                    .with_retries(3, Duration::from_secs(10)),
            )
            .unwrap();
        registry
            .register(HandlerRecord::new("panics", Arc::new(Panics)))
            .unwrap();

        let invoker = Arc::new(Invoker::new(
            Arc::new(MemoryQueue::new("test-queue")),
            Arc::new(MemoryKeyStore::new("test-results")),
            Arc::new(MemoryKeyStore::new("test-tasks")),
            registry,
        ));

        Consumer::new(
            invoker,
            ConsumerConfig {
                threads: 2,
                periodic: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failure_with_delay_lands_in_the_schedule() {
        let consumer = test_consumer();
        let invoker = consumer.invoker().clone();
        let handle = invoker.invoke("fails-slow", vec![], Map::new()).await.unwrap();

        let before = Utc::now();
        let invocation = invoker.dequeue().await.unwrap().unwrap();
        assert!(consumer.pool().acquire(false, None).await);
        consumer.worker(invocation).await;

        // Not re-enqueued immediately; parked in the schedule with one
        // retry consumed and the delay applied.
        assert_eq!(invoker.queue_size().await.unwrap(), 0);
        let parked = consumer.schedule().get(&handle.task_id).unwrap();
        assert_eq!(parked.retries_remaining, 2);

        let eta = parked.execute_time.unwrap();
        let delta = eta - (before + chrono::Duration::seconds(10));
        assert!(delta.num_seconds().abs() <= 1, "eta {} off by {}", eta, delta);

        // Promotion happens only once the delay has passed.
        consumer.check_schedule(before).await;
        assert_eq!(invoker.queue_size().await.unwrap(), 0);
        consumer.check_schedule(eta).await;
        assert_eq!(invoker.queue_size().await.unwrap(), 1);
        assert!(consumer.schedule().is_empty());
    }

    #[tokio::test]
    async fn revoked_tasks_are_skipped() {
        let consumer = test_consumer();
        let invoker = consumer.invoker().clone();
        let handle = invoker.invoke("fails-slow", vec![], Map::new()).await.unwrap();

        invoker.revoke(&handle.task_id).await.unwrap();

        let invocation = invoker.dequeue().await.unwrap().unwrap();
        assert!(consumer.pool().acquire(false, None).await);
        consumer.worker(invocation).await;

        // No execution: no retry was scheduled, no result written, and the
        // marker was consumed.
        assert!(consumer.schedule().is_empty());
        assert_eq!(handle.try_get().await.unwrap(), None);
        assert!(!invoker.is_revoked(&handle.task_id).await.unwrap());
        assert_eq!(consumer.pool().available(), consumer.pool().capacity());
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure() {
        let consumer = test_consumer();
        let invoker = consumer.invoker().clone();
        let handle = invoker.invoke("panics", vec![], Map::new()).await.unwrap();

        let invocation = invoker.dequeue().await.unwrap().unwrap();
        assert!(consumer.pool().acquire(false, None).await);
        consumer.worker(invocation).await;

        assert!(matches!(handle.try_get().await, Err(Error::TaskFailed(_))));
        // The slot came back despite the panic.
        assert_eq!(consumer.pool().available(), consumer.pool().capacity());
    }

    #[tokio::test]
    async fn schedule_persistence_round_trip() {
        let consumer = test_consumer();

        let mut invocation = TaskInvocation::new("fails-slow", vec![], Map::new());
        invocation.execute_time = Some(Utc::now() + chrono::Duration::days(30));
        consumer.schedule().add(invocation.clone());

        consumer.save_schedule().await.unwrap();
        consumer.schedule().restore(vec![]);
        assert!(consumer.schedule().is_empty());

        consumer.load_schedule().await.unwrap();
        assert_eq!(consumer.schedule().len(), 1);
        assert_eq!(
            consumer.schedule().get(&invocation.task_id).unwrap().execute_time,
            invocation.execute_time
        );
    }
}
