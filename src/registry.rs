use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{error::Error, periodic::PeriodicSchedule};

/// Executable side of a registered task. Implementations are free to close
/// over whatever state they need; the runtime makes no isolation guarantee.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, anyhow::Error>;
}

#[derive(Clone)]
pub struct HandlerRecord {
    pub name: String,
    pub handler: Arc<dyn Handler>,
    pub default_retries: u32,
    pub default_retry_delay: Duration,
    pub periodic: Option<PeriodicSchedule>,
}

impl HandlerRecord {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>) -> HandlerRecord {
        HandlerRecord {
            name: name.into(),
            handler,
            default_retries: 0,
            default_retry_delay: Duration::from_secs(0),
            periodic: None,
        }
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.default_retries = retries;
        self.default_retry_delay = retry_delay;
        self
    }

    pub fn with_periodic(mut self, schedule: PeriodicSchedule) -> Self {
        self.periodic = Some(schedule);
        self
    }
}

impl std::fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("name", &self.name)
            .field("default_retries", &self.default_retries)
            .field("default_retry_delay", &self.default_retry_delay)
            .field("periodic", &self.periodic)
            .finish()
    }
}

/// The only bridge between a received message's handler name and
/// executable code. Populated during startup, append-only afterward.
pub struct Registry {
    handlers: RwLock<HashMap<String, HandlerRecord>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, record: HandlerRecord) -> Result<(), Error> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&record.name) {
            return Err(Error::DuplicateHandler(record.name));
        }
        handlers.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<HandlerRecord, Error> {
        self.handlers
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn periodic_handlers(&self) -> Vec<HandlerRecord> {
        self.handlers
            .read()
            .unwrap()
            .values()
            .filter(|record| record.periodic.is_some())
            .cloned()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn call(
            &self,
            _args: Vec<Value>,
            _kwargs: Map<String, Value>,
        ) -> Result<Value, anyhow::Error> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn resolve_unknown_name_fails() {
        let registry = Registry::new();
        assert_matches!(registry.resolve("missing"), Err(Error::UnknownTask(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry
            .register(HandlerRecord::new("noop", Arc::new(Noop)))
            .unwrap();
        assert_matches!(
            registry.register(HandlerRecord::new("noop", Arc::new(Noop))),
            Err(Error::DuplicateHandler(_))
        );
        assert!(registry.resolve("noop").is_ok());
    }

    #[test]
    fn periodic_handlers_are_listed() {
        let registry = Registry::new();
        registry
            .register(HandlerRecord::new("plain", Arc::new(Noop)))
            .unwrap();
        registry
            .register(
                HandlerRecord::new("minutely", Arc::new(Noop))
                    .with_periodic(PeriodicSchedule::Cron("0 * * * * * *".to_string())),
            )
            .unwrap();

        let periodic = registry.periodic_handlers();
        assert_eq!(periodic.len(), 1);
        assert_eq!(periodic[0].name, "minutely");
    }
}
