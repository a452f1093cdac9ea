use std::{sync::Arc, time::Duration};

use tokio::select;
use tokio::signal::ctrl_c;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{event, Level};

/// Wait for SIGINT or SIGTERM, whichever lands first.
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            select! {
                _ = ctrl_c() => {},
                _ = term.recv() => {},
            };
        }
        Err(e) => {
            event!(Level::ERROR, error = %e, "failed to install SIGTERM handler");
            let _ = ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = ctrl_c().await;
}

/// Flips the process-wide stop state exactly once, whether the trigger is
/// a signal or a manual call. Runtime loops observe the transition through
/// [`ShutdownWatcher`] handles; the drain half of a stop sequence is
/// [`TaskDrain`].
#[derive(Debug)]
pub struct ShutdownCoordinator {
    stop: Arc<watch::Sender<bool>>,
    watcher: watch::Receiver<bool>,
    signal_listener: JoinHandle<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> ShutdownCoordinator {
        let (stop, watcher) = watch::channel(false);
        let stop = Arc::new(stop);

        let listener_stop = stop.clone();
        let signal_listener = tokio::spawn(async move {
            wait_for_signal().await;
            event!(Level::INFO, "received shutdown signal");
            let _ = listener_stop.send(true);
        });

        ShutdownCoordinator {
            stop,
            watcher,
            signal_listener,
        }
    }

    pub fn watcher(&self) -> ShutdownWatcher {
        ShutdownWatcher(self.watcher.clone())
    }

    /// Enter the stopping state. Idempotent; the signal listener and
    /// manual callers race for the single false-to-true transition.
    pub fn trigger(&self) {
        let _ = self.stop.send(true);
        self.signal_listener.abort();
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.signal_listener.abort();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> ShutdownCoordinator {
        ShutdownCoordinator::new()
    }
}

/// Clonable view of the stop state, held by each runtime loop.
#[derive(Clone, Debug)]
pub struct ShutdownWatcher(watch::Receiver<bool>);

impl ShutdownWatcher {
    pub fn is_stopping(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the stop state is set. A dropped coordinator counts
    /// as stopped.
    pub async fn stopped(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One stop sequence's deadline. Runtime tasks are retired in order
/// against the same instant, so time spent draining workers is no longer
/// available to the tasks retired after them.
#[derive(Debug)]
pub struct TaskDrain {
    deadline: Instant,
}

impl TaskDrain {
    pub fn new(timeout: Duration) -> TaskDrain {
        TaskDrain {
            deadline: Instant::now() + timeout,
        }
    }

    /// Wait for one runtime task to finish, up to the shared deadline.
    /// Returns false when the deadline passed first: the task is left
    /// running detached, and any invocations it holds were consumed from
    /// the queue but will never get a result written.
    pub async fn retire(&self, name: &str, task: Option<JoinHandle<()>>) -> bool {
        let task = match task {
            Some(task) => task,
            None => return true,
        };

        match timeout_at(self.deadline, task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                event!(Level::ERROR, error = %e, "{} task panicked", name);
                true
            }
            Err(_) => {
                event!(
                    Level::WARN,
                    "{} still running at the drain deadline; in-flight invocations may be lost",
                    name
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libc::{getpid, kill, SIGINT};
    use tokio::time::timeout;

    #[tokio::test]
    async fn manual_trigger_reaches_every_watcher() {
        let coordinator = ShutdownCoordinator::new();

        let mut early = coordinator.watcher();
        assert!(!early.is_stopping());

        let observer = tokio::spawn({
            let mut watcher = coordinator.watcher();
            async move { watcher.stopped().await }
        });
        tokio::task::yield_now().await;

        coordinator.trigger();
        // A second trigger is a no-op, not a panic.
        coordinator.trigger();

        timeout(Duration::from_secs(2), observer)
            .await
            .expect("watcher did not observe the stop")
            .unwrap();
        assert!(early.is_stopping());

        // A watcher created after the transition sees it immediately.
        let mut late = coordinator.watcher();
        assert!(late.is_stopping());
        timeout(Duration::from_secs(2), late.stopped())
            .await
            .expect("late watcher did not resolve");
    }

    #[tokio::test]
    async fn sigint_flips_the_stop_state() {
        let coordinator = ShutdownCoordinator::new();
        let mut watcher = coordinator.watcher();
        assert!(!watcher.is_stopping());

        // Give the listener task a chance to start before raising.
        tokio::task::yield_now().await;
        unsafe {
            kill(getpid(), SIGINT);
        }

        timeout(Duration::from_secs(2), watcher.stopped())
            .await
            .expect("signal was not observed");
        assert!(coordinator.watcher().is_stopping());
    }

    #[tokio::test]
    async fn dropped_coordinator_counts_as_stopped() {
        let coordinator = ShutdownCoordinator::new();
        let mut watcher = coordinator.watcher();
        drop(coordinator);

        timeout(Duration::from_secs(2), watcher.stopped())
            .await
            .expect("watcher did not resolve after drop");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_retires_tasks_against_one_deadline() {
        let drain = TaskDrain::new(Duration::from_millis(50));

        assert!(drain.retire("absent", None).await);

        let quick = tokio::spawn(async {});
        assert!(drain.retire("quick", Some(quick)).await);

        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(!drain.retire("stuck", Some(stuck)).await);
    }
}
