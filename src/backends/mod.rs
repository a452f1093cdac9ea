//! Transport abstractions for messages, results, and persisted consumer
//! state. Implementations carry no task semantics and are responsible for
//! their own thread safety; the core never locks around them.

mod memory;

pub use memory::{MemoryKeyStore, MemoryQueue};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("backend error: {0}")]
pub struct BackendError(pub anyhow::Error);

impl From<anyhow::Error> for BackendError {
    fn from(err: anyhow::Error) -> BackendError {
        BackendError(err)
    }
}

/// Message transport between producers and the single consumer.
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, message: Vec<u8>) -> Result<(), BackendError>;

    /// Take the next message, if any. Must not drop messages under
    /// concurrent readers, though the core only ever runs one.
    async fn read(&self) -> Result<Option<Vec<u8>>, BackendError>;

    async fn size(&self) -> Result<usize, BackendError>;
}

/// Keyed byte storage, last-write-wins. Used for both the result store and
/// the task store; when one backend instance serves both, the namespaces
/// stay disjoint by key convention.
#[async_trait]
pub trait KeyStore: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;
}
