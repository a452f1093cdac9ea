use std::time::Duration;

use backoff::ExponentialBackoff;

use crate::error::Error;

/// Tunables for one consumer instance. Backend instances and the registry
/// travel with the [`Invoker`](crate::invoker::Invoker), not the config.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Worker pool size; at least 1.
    pub threads: usize,
    /// Enqueue registered periodic handlers on their cron schedule.
    pub periodic: bool,
    /// First idle sleep after an empty dequeue.
    pub initial_delay: Duration,
    /// Ceiling for the idle sleep.
    pub max_delay: Duration,
    /// Idle sleep multiplier; at least 1.0.
    pub backoff: f64,
    /// Whether deferred enqueue etas are local wall time by default.
    pub utc: bool,
    /// How long shutdown waits for in-flight work before giving up.
    pub drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> ConsumerConfig {
        ConsumerConfig {
            threads: num_cpus::get().max(1),
            periodic: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: 1.15,
            utc: true,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.threads < 1 {
            return Err(Error::Config("threads must be at least 1".to_string()));
        }
        if self.backoff < 1.0 {
            return Err(Error::Config("backoff must be at least 1.0".to_string()));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::Config(
                "initial_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// The receiver's idle backoff: multiply from `initial_delay` up to
    /// `max_delay`, reset on every productive iteration.
    pub(crate) fn idle_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            multiplier: self.backoff,
            max_interval: self.max_delay,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn default_config_is_valid() {
        ConsumerConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = ConsumerConfig::default();
        config.threads = 0;
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::default();
        config.backoff = 0.5;
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::default();
        config.initial_delay = Duration::from_secs(60);
        config.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn idle_backoff_grows_to_the_cap_and_resets() {
        let config = ConsumerConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff: 2.0,
            ..Default::default()
        };

        let mut backoff = config.idle_backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
        // Capped.
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    }
}
