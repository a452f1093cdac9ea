//! A task-queue consumer runtime: pull serialized invocations from a
//! pluggable queue, execute them on a bounded worker pool, store results,
//! and re-schedule work that runs in the future or failed with retries
//! remaining.

pub mod backends;
pub mod config;
pub mod consumer;
pub mod error;
pub mod invoker;
pub mod iterable_queue;
pub mod periodic;
pub mod pool;
pub mod registry;
pub mod result;
pub mod schedule;
pub mod settings;
pub mod shutdown;
pub mod task;
pub mod tracing_config;

pub use self::{
    config::ConsumerConfig,
    consumer::{Consumer, RunState},
    error::Error,
    invoker::{local_to_utc, Invoker},
    periodic::PeriodicSchedule,
    registry::{Handler, HandlerRecord, Registry},
    result::{GetOptions, ResultHandle},
    schedule::Schedule,
    task::{Outcome, TaskInvocation},
};
