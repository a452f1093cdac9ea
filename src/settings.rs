use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::{config::ConsumerConfig, error::Error};

/// Driver-side settings: a configuration file merged with
/// `DRUDGE_`-prefixed environment variables, then with command-line
/// overrides. Only the tunables live here; backends and handlers are wired
/// by the embedding application.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    pub queue_name: Option<String>,
    pub threads: Option<usize>,
    pub periodic: Option<bool>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff: Option<f64>,
    pub utc: Option<bool>,
    pub drain_timeout_ms: Option<u64>,
    pub logfile: Option<PathBuf>,
    pub loglevel: Option<String>,
}

impl Settings {
    pub fn load(path: &str) -> Result<Settings, Error> {
        let mut settings = config::Config::default();
        settings
            .merge(config::File::with_name(path))
            .map_err(|e| Error::Config(e.to_string()))?;
        settings
            .merge(config::Environment::with_prefix("DRUDGE"))
            .map_err(|e| Error::Config(e.to_string()))?;
        settings
            .try_into()
            .map_err(|e: config::ConfigError| Error::Config(e.to_string()))
    }

    pub fn queue_name(&self) -> &str {
        self.queue_name.as_deref().unwrap_or("default")
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        let defaults = ConsumerConfig::default();
        ConsumerConfig {
            threads: self.threads.unwrap_or(defaults.threads),
            periodic: self.periodic.unwrap_or(defaults.periodic),
            initial_delay: self
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            utc: self.utc.unwrap_or(defaults.utc),
            drain_timeout: self
                .drain_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let settings = Settings::default();
        let config = settings.consumer_config();
        let defaults = ConsumerConfig::default();

        assert_eq!(settings.queue_name(), "default");
        assert_eq!(config.threads, defaults.threads);
        assert_eq!(config.backoff, defaults.backoff);
    }

    #[test]
    fn overrides_take_effect() {
        let settings = Settings {
            threads: Some(4),
            initial_delay_ms: Some(50),
            backoff: Some(2.0),
            ..Default::default()
        };
        let config = settings.consumer_config();

        assert_eq!(config.threads, 4);
        assert_eq!(config.initial_delay, Duration::from_millis(50));
        assert_eq!(config.backoff, 2.0);
        config.validate().unwrap();
    }
}
