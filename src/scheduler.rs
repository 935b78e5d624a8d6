//! Cooperative task scheduler.
//!
//! Every periodic job in the process (security decay tick, health check,
//! quarantine sweep, liveness sweep, index cleanup, per-session progress
//! ticks) is registered here under a unique name. Cancelling a name aborts
//! its task; [`Scheduler::shutdown`] aborts all of them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Shortest period a task may run at
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Named periodic task registry
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period`, starting one period from now.
    ///
    /// A task already registered under `name` is aborted and replaced.
    /// Periods below one millisecond are raised to it. Must be called from
    /// within a tokio runtime.
    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let period = period.max(MIN_PERIOD);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracing::trace!(task = %task_name, "Scheduler tick");
                tick().await;
            }
        });

        if let Some(previous) = self.lock().insert(name, handle) {
            previous.abort();
        }
    }

    /// Abort a task. Returns false if no such task was registered.
    pub fn cancel(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                true
            },
            None => false,
        }
    }

    /// Is a live task registered under `name`
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|h| !h.is_finished())
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// No tasks registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered task names, sorted
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Abort every task
    pub fn shutdown(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = self.lock().drain().collect();
        for (name, handle) in tasks {
            tracing::debug!(task = %name, "Stopping scheduled task");
            handle.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.spawn_periodic("counter", Duration::from_secs(60), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_raised() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.spawn_periodic("fast", Duration::ZERO, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(count.load(Ordering::SeqCst) >= 5);
        assert!(scheduler.is_scheduled("fast"));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_task() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.spawn_periodic("t", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(scheduler.is_scheduled("t"));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(scheduler.cancel("t"));
        assert!(!scheduler.cancel("t"));
        let seen = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_and_shutdown() {
        let scheduler = Scheduler::new();
        scheduler.spawn_periodic("a", Duration::from_secs(1), || async {});
        scheduler.spawn_periodic("a", Duration::from_secs(1), || async {});
        scheduler.spawn_periodic("b", Duration::from_secs(1), || async {});
        assert_eq!(scheduler.task_names(), vec!["a".to_string(), "b".to_string()]);

        scheduler.shutdown();
        assert!(scheduler.is_empty());
    }
}
