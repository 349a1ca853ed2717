//! Unified monitoring scheduler.
//!
//! A single interval ticker evaluates every registered periodic task,
//! replacing per-pool timers. Due tasks group by priority; groups execute
//! sequentially in ascending order and tasks within a group run concurrently,
//! with the group waiting for all of them to settle.

use crate::util::execute_with_timeout;
use crate::ServeError;
use dashmap::DashMap;
use futures::future::join_all;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type TaskResult = Result<(), ServeError>;
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;
pub type TaskErrorHandler = Arc<dyn Fn(&ServeError) + Send + Sync>;

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(5);

/// A periodic task registered with the scheduler.
#[derive(Clone)]
pub struct MonitoringTask {
    pub name: String,
    pub interval: Duration,
    /// 1 runs first, 10 last; values are clamped into that range.
    pub priority: u8,
    pub enabled: bool,
    pub description: String,
    pub execute: TaskFn,
    pub on_error: Option<TaskErrorHandler>,
}

impl MonitoringTask {
    pub fn new<F, Fut>(name: &str, interval: Duration, priority: u8, execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            interval,
            priority,
            enabled: true,
            description: String::new(),
            execute: Arc::new(move || Box::pin(execute()) as TaskFuture),
            on_error: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ServeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

/// Execution statistics for one task.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskStats {
    pub tasks_executed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub last_execution_time_ms: f64,
    /// Exponential moving average with weight 0.1.
    pub average_execution_time_ms: f64,
    pub uptime_ms: u64,
}

struct RegisteredTask {
    task: MonitoringTask,
    enabled: AtomicBool,
    last_execution: Mutex<Option<Instant>>,
    stats: Mutex<TaskStats>,
    registered_at: Instant,
}

impl RegisteredTask {
    async fn run(&self) {
        let started = Instant::now();
        let timeout_ms = self.task.interval.as_millis().max(1_000) as u64;
        let result =
            execute_with_timeout((self.task.execute)(), timeout_ms, &self.task.name).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.tasks_executed += 1;
        stats.last_execution_time_ms = elapsed_ms;
        stats.average_execution_time_ms = if stats.tasks_executed == 1 {
            elapsed_ms
        } else {
            0.1 * elapsed_ms + 0.9 * stats.average_execution_time_ms
        };
        match result {
            Ok(()) => stats.tasks_successful += 1,
            Err(error) => {
                stats.tasks_failed += 1;
                drop(stats);
                debug!(task = %self.task.name, error = %error, "Monitoring task failed");
                if let Some(handler) = &self.task.on_error {
                    let handler = handler.clone();
                    if catch_unwind(AssertUnwindSafe(|| handler(&error))).is_err() {
                        warn!(task = %self.task.name, "Task error handler panicked");
                    }
                }
            }
        }
    }
}

/// Single-ticker task registry with priority groups and per-task stats.
pub struct MonitoringScheduler {
    tasks: DashMap<String, Arc<RegisteredTask>>,
    tick_period: Duration,
    cancel: CancellationToken,
    started: AtomicBool,
    destroyed: AtomicBool,
}

impl MonitoringScheduler {
    pub fn new(tick_period: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            tick_period,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_default_tick() -> Self {
        Self::new(DEFAULT_TICK_PERIOD)
    }

    /// Spawns the ticker loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst)
            || self.started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = ticker.tick() => scheduler.run_cycle().await,
                }
            }
        });
    }

    /// Registers a task; false when the name is taken or the scheduler is
    /// destroyed.
    pub fn register(&self, mut task: MonitoringTask) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        task.priority = task.priority.clamp(1, 10);
        let name = task.name.clone();
        let enabled = task.enabled;
        let entry = Arc::new(RegisteredTask {
            task,
            enabled: AtomicBool::new(enabled),
            last_execution: Mutex::new(None),
            stats: Mutex::new(TaskStats::default()),
            registered_at: Instant::now(),
        });
        match self.tasks.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                debug!(task = %name, "Monitoring task registered");
                true
            }
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tasks.remove(name).is_some()
    }

    /// Removes every task whose name starts with `prefix`; returns how many
    /// were removed.
    pub fn unregister_prefix(&self, prefix: &str) -> usize {
        let names: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for name in names {
            if self.tasks.remove(&name).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.tasks.get(name) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn task_stats(&self, name: &str) -> Option<TaskStats> {
        self.tasks.get(name).map(|entry| {
            let mut stats = entry
                .stats
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            stats.uptime_ms = entry.registered_at.elapsed().as_millis() as u64;
            stats
        })
    }

    /// Evaluates one scheduler cycle: selects due tasks, groups them by
    /// priority, and runs the groups sequentially in ascending order. Tasks
    /// are snapshot as Arcs first, so registry mutations never touch a task
    /// mid-flight.
    pub async fn run_cycle(&self) {
        let now = Instant::now();
        let mut due: Vec<Arc<RegisteredTask>> = Vec::new();
        for entry in self.tasks.iter() {
            let registered = entry.value();
            if !registered.enabled.load(Ordering::SeqCst) {
                continue;
            }
            let mut last = registered
                .last_execution
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let is_due = match *last {
                None => true,
                Some(at) => now.duration_since(at) >= registered.task.interval,
            };
            if is_due {
                *last = Some(now);
                due.push(Arc::clone(registered));
            }
        }
        if due.is_empty() {
            return;
        }
        due.sort_by_key(|t| t.task.priority);

        let mut index = 0;
        while index < due.len() {
            let priority = due[index].task.priority;
            let mut group_end = index;
            while group_end < due.len() && due[group_end].task.priority == priority {
                group_end += 1;
            }
            let group = &due[index..group_end];
            join_all(group.iter().map(|t| t.run())).await;
            index = group_end;
        }
    }

    /// Stops the ticker and clears the registry. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.tasks.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for MonitoringScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(name: &str, priority: u8, counter: Arc<AtomicUsize>) -> MonitoringTask {
        MonitoringTask::new(name, Duration::from_millis(50), priority, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_register_and_run() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.register(counting_task("t1", 5, Arc::clone(&counter))));
        scheduler.run_cycle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.register(counting_task("t1", 5, Arc::clone(&counter))));
        assert!(!scheduler.register(counting_task("t1", 5, counter)));
    }

    #[tokio::test]
    async fn test_interval_gating() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(counting_task("t1", 5, Arc::clone(&counter)));
        scheduler.run_cycle().await;
        // immediately again: not due yet
        scheduler.run_cycle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.run_cycle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_priority_group_ordering() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, priority) in [("low", 9u8), ("high", 1u8), ("mid", 5u8)] {
            let order = Arc::clone(&order);
            scheduler.register(MonitoringTask::new(
                name,
                Duration::from_millis(10),
                priority,
                move || {
                    let order = Arc::clone(&order);
                    let name = name.to_string();
                    async move {
                        order.lock().unwrap().push(name);
                        Ok(())
                    }
                },
            ));
        }
        scheduler.run_cycle().await;
        let observed = order.lock().unwrap().clone();
        assert_eq!(observed, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_disabled_task_skipped() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(counting_task("t1", 5, Arc::clone(&counter)));
        assert!(scheduler.set_enabled("t1", false));
        scheduler.run_cycle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(scheduler.set_enabled("t1", true));
        scheduler.run_cycle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_handler_invoked() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let handled = Arc::new(AtomicUsize::new(0));
        let handled_clone = Arc::clone(&handled);
        let task = MonitoringTask::new("failing", Duration::from_millis(10), 5, || async {
            Err(ServeError::HandlerError("expected".into()))
        })
        .with_error_handler(move |_| {
            handled_clone.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.register(task);
        scheduler.run_cycle().await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        let stats = scheduler.task_stats("failing").unwrap();
        assert_eq!(stats.tasks_executed, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_successful, 0);
    }

    #[tokio::test]
    async fn test_stats_average() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(counting_task("t1", 5, counter));
        scheduler.run_cycle().await;
        let first = scheduler.task_stats("t1").unwrap();
        assert_eq!(first.tasks_executed, 1);
        assert!(first.average_execution_time_ms >= 0.0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.run_cycle().await;
        let second = scheduler.task_stats("t1").unwrap();
        assert_eq!(second.tasks_executed, 2);
    }

    #[tokio::test]
    async fn test_unregister_prefix() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(counting_task("srv1:cleanup", 5, Arc::clone(&counter)));
        scheduler.register(counting_task("srv1:metrics", 5, Arc::clone(&counter)));
        scheduler.register(counting_task("srv2:cleanup", 5, counter));
        assert_eq!(scheduler.unregister_prefix("srv1:"), 2);
        assert_eq!(scheduler.task_count(), 1);
    }

    #[tokio::test]
    async fn test_destroy_idempotent() {
        let scheduler = MonitoringScheduler::with_default_tick();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(counting_task("t1", 5, Arc::clone(&counter)));
        scheduler.destroy();
        scheduler.destroy();
        assert_eq!(scheduler.task_count(), 0);
        assert!(!scheduler.register(counting_task("t2", 5, counter)));
    }
}
