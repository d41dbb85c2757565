//! Named repeating tasks with per-task intervals.
//!
//! Every task runs on its own tokio task. A run that fails or panics is
//! reported to the shared error sink with the task name and the schedule
//! carries on. Interval changes apply from the next firing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type ExecuteFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ErrorSink = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

struct TaskEntry {
    interval_ms: Arc<AtomicU64>,
    run_immediately: bool,
    execute: ExecuteFn,
    handle: Option<JoinHandle<()>>,
}

impl TaskEntry {
    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    on_error: ErrorSink,
}

impl Scheduler {
    /// Create a scheduler whose failed runs are passed to `on_error`
    pub fn new<E>(on_error: E) -> Self
    where
        E: Fn(&str, &anyhow::Error) + Send + Sync + 'static,
    {
        Self {
            tasks: Mutex::new(HashMap::new()),
            on_error: Arc::new(on_error),
        }
    }

    /// Scheduler that logs failed runs
    pub fn logging() -> Self {
        Self::new(|name, error| warn!("Scheduled task '{}' failed: {:#}", name, error))
    }

    /// Register (or replace) a task. It does not run until [`Scheduler::start`].
    pub fn register<F, Fut>(&self, name: &str, interval: Duration, run_immediately: bool, execute: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry = TaskEntry {
            interval_ms: Arc::new(AtomicU64::new(duration_ms(interval))),
            run_immediately,
            execute: Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(execute())
            }),
            handle: None,
        };

        if let Some(mut previous) = self.tasks.lock().insert(name.to_string(), entry) {
            previous.stop();
        }
    }

    /// Start a registered task. Returns false if no task has that name.
    pub fn start(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(entry) = tasks.get_mut(name) else {
            return false;
        };
        if entry.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return true;
        }

        let task_name = name.to_string();
        let interval_ms = Arc::clone(&entry.interval_ms);
        let execute = Arc::clone(&entry.execute);
        let on_error = Arc::clone(&self.on_error);
        let run_immediately = entry.run_immediately;

        entry.handle = Some(tokio::spawn(async move {
            if !run_immediately {
                tokio::time::sleep(Duration::from_millis(interval_ms.load(Ordering::Relaxed))).await;
            }
            loop {
                run_once(&task_name, &execute, &on_error).await;
                tokio::time::sleep(Duration::from_millis(interval_ms.load(Ordering::Relaxed))).await;
            }
        }));
        debug!("Started scheduled task '{}'", name);
        true
    }

    /// Stop a task; it stays registered and can be started again
    pub fn stop(&self, name: &str) {
        if let Some(entry) = self.tasks.lock().get_mut(name) {
            entry.stop();
        }
    }

    /// Change a task's interval from its next firing on
    pub fn update_interval(&self, name: &str, interval: Duration) -> bool {
        match self.tasks.lock().get(name) {
            Some(entry) => {
                entry.interval_ms.store(duration_ms(interval), Ordering::Relaxed);
                debug!("Interval of '{}' set to {:?}", name, interval);
                true
            }
            None => false,
        }
    }

    pub fn interval(&self, name: &str) -> Option<Duration> {
        self.tasks
            .lock()
            .get(name)
            .map(|e| Duration::from_millis(e.interval_ms.load(Ordering::Relaxed)))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .and_then(|e| e.handle.as_ref())
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop and forget every task. Runs already in flight finish on their own.
    pub fn dispose(&self) {
        let mut tasks = self.tasks.lock();
        for entry in tasks.values_mut() {
            entry.stop();
        }
        tasks.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Run one firing in its own task so a panic is contained
async fn run_once(name: &str, execute: &ExecuteFn, on_error: &ErrorSink) {
    match tokio::spawn(execute()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => on_error(name, &e),
        Err(join_error) => on_error(name, &anyhow::anyhow!("task aborted: {}", join_error)),
    }
}

fn duration_ms(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> BoxFuture<'static, anyhow::Result<()>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let execute = move || -> BoxFuture<'static, anyhow::Result<()>> {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        (count, execute)
    }

    fn recording_sink() -> (Arc<Mutex<Vec<(String, String)>>>, Scheduler) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let scheduler = Scheduler::new(move |name, error| {
            sink.lock().push((name.to_string(), error.to_string()));
        });
        (errors, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() {
        let scheduler = Scheduler::logging();
        let (count, execute) = counter();
        scheduler.register("refresh", Duration::from_secs(60), true, execute);
        assert!(!scheduler.is_running("refresh"));

        assert!(scheduler.start("refresh"));
        tokio::time::sleep(Duration::from_secs(150)).await;

        // t = 0, 60, 120
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_running("refresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_first_run() {
        let scheduler = Scheduler::logging();
        let (count, execute) = counter();
        scheduler.register("cache_check", Duration::from_secs(60), false, execute);
        scheduler.start("cache_check");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_interval_applies_to_next_firing() {
        let scheduler = Scheduler::logging();
        let (fast, fast_exec) = counter();
        let (slow, slow_exec) = counter();
        scheduler.register("fast", Duration::from_secs(60), true, fast_exec);
        scheduler.register("slow", Duration::from_secs(60), true, slow_exec);
        scheduler.start("fast");
        scheduler.start("slow");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(scheduler.update_interval("fast", Duration::from_secs(10)));
        assert_eq!(scheduler.interval("fast"), Some(Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(90)).await;

        // fast: 0, 60, 70, 80, 90; slow: 0, 60
        let fast = fast.load(Ordering::SeqCst);
        assert!((4..=6).contains(&fast), "fast ran {} times", fast);
        assert_eq!(slow.load(Ordering::SeqCst), 2);
        assert!(!scheduler.update_interval("missing", Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated_per_task() {
        let (errors, scheduler) = recording_sink();
        let (count, execute) = counter();
        scheduler.register("broken", Duration::from_secs(60), true, || async {
            Err::<(), _>(anyhow::anyhow!("server gone"))
        });
        scheduler.register("healthy", Duration::from_secs(60), true, execute);
        scheduler.start("broken");
        scheduler.start("healthy");

        tokio::time::sleep(Duration::from_secs(90)).await;

        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|(name, msg)| name == "broken" && msg == "server gone"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_running("broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_reported_and_schedule_survives() {
        let (errors, scheduler) = recording_sink();
        scheduler.register("panicky", Duration::from_secs(60), true, || async {
            let exploded = true;
            if exploded {
                panic!("boom");
            }
            Ok::<(), anyhow::Error>(())
        });
        scheduler.start("panicky");

        tokio::time::sleep(Duration::from_secs(90)).await;

        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0, "panicky");
        assert!(scheduler.is_running("panicky"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_dispose() {
        let scheduler = Scheduler::logging();
        let (count, execute) = counter();
        scheduler.register("refresh", Duration::from_secs(60), true, execute);
        scheduler.start("refresh");
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.stop("refresh");
        assert!(!scheduler.is_running("refresh"));
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.start("refresh");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        scheduler.dispose();
        scheduler.dispose();
        assert!(!scheduler.is_running("refresh"));
        assert!(!scheduler.start("refresh"));
        assert_eq!(scheduler.interval("refresh"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_replaces_running_task() {
        let scheduler = Scheduler::logging();
        let (old, old_exec) = counter();
        let (new, new_exec) = counter();
        scheduler.register("refresh", Duration::from_secs(60), true, old_exec);
        scheduler.start("refresh");
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.register("refresh", Duration::from_secs(60), true, new_exec);
        assert!(!scheduler.is_running("refresh"));
        scheduler.start("refresh");
        tokio::time::sleep(Duration::from_secs(90)).await;

        assert_eq!(old.load(Ordering::SeqCst), 1);
        assert_eq!(new.load(Ordering::SeqCst), 2);
    }
}
