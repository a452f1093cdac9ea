use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{BackendError, KeyStore, Queue};

/// Process-local FIFO queue. The default transport for tests and
/// single-process deployments.
pub struct MemoryQueue {
    name: String,
    messages: Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> MemoryQueue {
        MemoryQueue {
            name: name.into(),
            messages: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn write(&self, message: Vec<u8>) -> Result<(), BackendError> {
        self.messages.lock().unwrap().push_back(message);
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.messages.lock().unwrap().pop_front())
    }

    async fn size(&self) -> Result<usize, BackendError> {
        Ok(self.messages.lock().unwrap().len())
    }
}

/// Process-local key/value store backing the result and task stores.
pub struct MemoryKeyStore {
    name: String,
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new(name: impl Into<String>) -> MemoryKeyStore {
        MemoryKeyStore {
            name: name.into(),
            values: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_preserves_fifo_order() {
        let queue = MemoryQueue::new("test-queue");
        queue.write(b"one".to_vec()).await.unwrap();
        queue.write(b"two".to_vec()).await.unwrap();

        assert_eq!(queue.size().await.unwrap(), 2);
        assert_eq!(queue.read().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(queue.read().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(queue.read().await.unwrap(), None);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn key_store_last_write_wins() {
        let store = MemoryKeyStore::new("test-results");
        assert_eq!(store.get("a").await.unwrap(), None);

        store.put("a", b"first".to_vec()).await.unwrap();
        store.put("a", b"second".to_vec()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"second".to_vec()));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
