//! Repeating timers with owned cancel handles.
//!
//! Timer lifetime is tied to a [`CancelHandle`] rather than to a closure
//! kept alive somewhere. The output buffer schedules one task per terminal
//! and cancels it on reconfiguration or disposal.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Callback invoked on every tick
pub type Task = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle identifying a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CancelHandle(u64);

pub trait Scheduler: Send + Sync {
    /// Run `task` every `interval`, first run one interval from now
    fn schedule_repeating(&self, interval: Duration, task: Task) -> CancelHandle;

    /// Stop a task. Unknown or already cancelled handles are ignored.
    fn cancel(&self, handle: CancelHandle);
}

/// Scheduler backed by tokio interval tasks
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tasks that have not been cancelled
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, interval: Duration, task: Task) -> CancelHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let join = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, join);
        debug!("Scheduled repeating task {} every {:?}", id, interval);
        CancelHandle(id)
    }

    fn cancel(&self, handle: CancelHandle) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if let Some(join) = removed {
            join.abort();
            debug!("Cancelled repeating task {}", handle.0);
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, join) in tasks.drain() {
            join.abort();
        }
    }
}

/// Deterministic scheduler: tasks only run when [`ManualScheduler::tick`] is called.
///
/// Used by tests and by hosts that drive flushing from their own frame loop.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<u64, (Duration, Task)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every live task once, in scheduling order
    pub fn tick(&self) {
        // Snapshot first: tasks may schedule or cancel while running.
        let snapshot: Vec<Task> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(_, task)| Arc::clone(task))
            .collect();
        for task in snapshot {
            task();
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Intervals of the live tasks, in scheduling order
    pub fn intervals(&self) -> Vec<Duration> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(interval, _)| *interval)
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, interval: Duration, task: Task) -> CancelHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (interval, task));
        CancelHandle(id)
    }

    fn cancel(&self, handle: CancelHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_tick_and_cancel() {
        let scheduler = ManualScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_repeating(Duration::from_millis(16), counter_task(&count));

        scheduler.tick();
        scheduler.tick();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        scheduler.cancel(handle);
        scheduler.tick();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.active_count(), 0);

        // Cancelling twice is harmless
        scheduler.cancel(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_on_interval() {
        let scheduler = TokioScheduler::new(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_repeating(Duration::from_millis(10), counter_task(&count));

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.cancel(handle);
        assert_eq!(scheduler.active_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
