//! Cooperative task scheduling.
//!
//! The manager lives on the main thread and is advanced by [`TaskManager::poll`].
//! Non-threaded tasks run inline during a poll. Threaded tasks are spawned on
//! the rayon pool and report back over a channel; their results are only
//! accepted while the task is still registered, so a cancelled task's output
//! is dropped even if the worker runs to completion.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::ArcStr;
use crate::event::{Event, EventBus};
use crate::key::CacheKey;

/// Identity of a task, either generated or supplied by the caller.
///
/// Generation tasks use their cache key, which makes a second request for the
/// same key collide with the running one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(ArcStr);

impl TaskId {
    pub fn new(id: impl Into<ArcStr>) -> Self {
        Self(id.into())
    }

    fn auto(n: u64) -> Self {
        Self(format!("#{n}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&CacheKey> for TaskId {
    fn from(key: &CacheKey) -> Self {
        Self(key.to_string().into())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    /// Completed fraction in `0..=1`, `None` when unknown.
    pub fraction: Option<f64>,
    pub message: Option<String>,
    /// Whether the fraction should be displayed as a percentage.
    pub percent: bool,
}

impl Progress {
    pub fn new(prog_max: usize, prog: usize, message: Option<&str>, percent: bool) -> Self {
        Self {
            fraction: (prog_max > 0).then(|| (prog as f64 / prog_max as f64).clamp(0.0, 1.0)),
            message: message.map(String::from),
            percent,
        }
    }
}

struct ProgressUpdate {
    id: TaskId,
    serial: u64,
    progress: Progress,
}

/// Passed to a task's body, and from there to any code that wants to check
/// for cancellation or report progress. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    serial: u64,
    token: CancelToken,
    updates: Sender<ProgressUpdate>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn set_progress(&self, prog_max: usize, prog: usize, message: Option<&str>, percent: bool) {
        // a closed channel means the manager is gone, nobody is listening
        let _ = self.updates.send(ProgressUpdate {
            id: self.id.clone(),
            serial: self.serial,
            progress: Progress::new(prog_max, prog, message, percent),
        });
    }

    /// Handle that isn't attached to any manager, for running task bodies
    /// directly.
    pub fn detached(id: TaskId) -> Self {
        let (updates, _) = channel();
        Self {
            id,
            serial: 0,
            token: CancelToken::default(),
            updates,
        }
    }
}

pub type TaskWork<T> = Box<dyn FnOnce(&TaskHandle) -> anyhow::Result<T> + Send>;

/// Description of a task to submit.
pub struct TaskSpec<T> {
    work: TaskWork<T>,
    name: Option<String>,
    visual: bool,
    threaded: bool,
    key: Option<TaskId>,
    component_parent: Option<CacheKey>,
}

impl<T> TaskSpec<T> {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&TaskHandle) -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            work: Box::new(work),
            name: None,
            visual: false,
            threaded: false,
            key: None,
            component_parent: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn visual(mut self, visual: bool) -> Self {
        self.visual = visual;
        self
    }

    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    pub fn key(mut self, key: TaskId) -> Self {
        self.key = Some(key);
        self
    }

    pub fn component_parent(mut self, parent: Option<CacheKey>) -> Self {
        self.component_parent = parent;
        self
    }
}

/// Bookkeeping for one running task.
#[derive(Debug)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub visual: bool,
    pub threaded: bool,
    pub progress: Progress,
    /// Key whose resolution spawned this task, if it is a prerequisite.
    pub component_parent: Option<CacheKey>,
    pub started: Instant,
    serial: u64,
    token: CancelToken,
    span: tracing::Span,
}

pub enum Outcome<T> {
    Finished(T),
    Failed(anyhow::Error),
}

/// A task that ran to the end, successfully or not.
pub struct Completion<T> {
    pub record: TaskRecord,
    pub outcome: Outcome<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Finished,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub id: TaskId,
    pub name: String,
    pub start: Instant,
    pub duration: Duration,
    pub status: ExecutionStatus,
}

struct Finished<T> {
    id: TaskId,
    serial: u64,
    outcome: anyhow::Result<T>,
}

struct Inline<T> {
    id: TaskId,
    serial: u64,
    handle: TaskHandle,
    work: TaskWork<T>,
}

fn run_guarded<T>(work: TaskWork<T>, handle: &TaskHandle) -> anyhow::Result<T> {
    // A panicking body only owns its captured data, nothing shared is left
    // half-written.
    match catch_unwind(AssertUnwindSafe(|| work(handle))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}

fn task_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub struct TaskManager<T> {
    next_id: u64,
    next_serial: u64,
    running: BTreeMap<TaskId, TaskRecord>,
    submissions: VecDeque<TaskSpec<T>>,
    inline: VecDeque<Inline<T>>,
    results_tx: Sender<Finished<T>>,
    results_rx: Receiver<Finished<T>>,
    updates_tx: Sender<ProgressUpdate>,
    updates_rx: Receiver<ProgressUpdate>,
    history: Vec<TaskExecution>,
    history_limit: usize,
    style: ProgressStyle,
}

/// Executions kept for diagnostics before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

impl<T: Send + 'static> Default for TaskManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskManager<T> {
    pub fn new() -> Self {
        let (results_tx, results_rx) = channel();
        let (updates_tx, updates_rx) = channel();

        Self {
            next_id: 0,
            next_serial: 0,
            running: BTreeMap::new(),
            submissions: VecDeque::new(),
            inline: VecDeque::new(),
            results_tx,
            results_rx,
            updates_tx,
            updates_rx,
            history: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            style: task_style(),
        }
    }

    /// Starts a task now. Returns `None` if a task with the same id is
    /// already running.
    pub fn new_task(&mut self, spec: TaskSpec<T>, bus: &mut EventBus) -> Option<TaskId> {
        let TaskSpec {
            work,
            name,
            visual,
            threaded,
            key,
            component_parent,
        } = spec;

        let id = key.unwrap_or_else(|| {
            self.next_id += 1;
            TaskId::auto(self.next_id)
        });

        if self.running.contains_key(&id) {
            tracing::warn!(task = %id, "task is already running, not starting it twice");
            return None;
        }

        self.next_serial += 1;
        let serial = self.next_serial;
        let name = name.unwrap_or_else(|| id.to_string());

        let span = if visual {
            let span = tracing::span!(Level::INFO, "task", name = %name);
            span.pb_set_style(&self.style);
            span.pb_set_message(&name);
            span
        } else {
            tracing::span!(Level::DEBUG, "task", name = %name)
        };

        let token = CancelToken::default();
        let handle = TaskHandle {
            id: id.clone(),
            serial,
            token: token.clone(),
            updates: self.updates_tx.clone(),
        };

        self.running.insert(
            id.clone(),
            TaskRecord {
                id: id.clone(),
                name,
                visual,
                threaded,
                progress: Progress::default(),
                component_parent,
                started: Instant::now(),
                serial,
                token,
                span: span.clone(),
            },
        );

        if threaded {
            let sender = self.results_tx.clone();
            rayon::spawn(move || {
                let _enter = span.enter();
                let outcome = run_guarded(work, &handle);
                let _ = sender.send(Finished {
                    id: handle.id.clone(),
                    serial: handle.serial,
                    outcome,
                });
            });
        } else {
            self.inline.push_back(Inline {
                id: id.clone(),
                serial,
                handle,
                work,
            });
        }

        tracing::debug!(task = %id, threaded, "task created");
        bus.push(Event::TaskCreated(id.clone()));
        Some(id)
    }

    /// Defers [`new_task`](Self::new_task) to the next poll.
    pub fn queue_task(&mut self, spec: TaskSpec<T>) {
        self.submissions.push_back(spec);
    }

    fn is_current(&self, id: &TaskId, serial: u64) -> bool {
        self.running
            .get(id)
            .is_some_and(|record| record.serial == serial)
    }

    /// Advances every task by one step and returns the ones that completed.
    pub fn poll(&mut self, bus: &mut EventBus) -> Vec<Completion<T>> {
        let submissions = std::mem::take(&mut self.submissions);
        for spec in submissions {
            self.new_task(spec, bus);
        }

        let mut finished = Vec::new();

        while let Some(Inline {
            id,
            serial,
            handle,
            work,
        }) = self.inline.pop_front()
        {
            // cancelled before it got a turn
            let Some(record) = self.running.get(&id).filter(|r| r.serial == serial) else {
                continue;
            };

            let span = record.span.clone();
            let _enter = span.enter();
            let outcome = run_guarded(work, &handle);
            finished.push(Finished {
                id,
                serial,
                outcome,
            });
        }

        while let Ok(update) = self.updates_rx.try_recv() {
            self.apply_progress(update, bus);
        }

        while let Ok(done) = self.results_rx.try_recv() {
            finished.push(done);
        }

        let mut completions = Vec::new();

        for done in finished {
            if !self.is_current(&done.id, done.serial) {
                tracing::debug!(task = %done.id, "discarding result of a cancelled task");
                continue;
            }

            let Some(record) = self.running.remove(&done.id) else {
                continue;
            };

            let (outcome, status) = match done.outcome {
                Ok(value) => (Outcome::Finished(value), ExecutionStatus::Finished),
                Err(err) => {
                    tracing::error!(task = %record.id, name = %record.name, "task failed: {err:?}");
                    (Outcome::Failed(err), ExecutionStatus::Failed)
                }
            };

            self.record_history(&record, status);
            bus.push(Event::TaskDone(record.id.clone()));
            completions.push(Completion { record, outcome });
        }

        completions
    }

    fn apply_progress(&mut self, update: ProgressUpdate, bus: &mut EventBus) {
        if !self.is_current(&update.id, update.serial) {
            tracing::trace!(task = %update.id, "progress for a task that is no longer running");
            return;
        }

        self.update_record(&update.id, update.progress, bus);
    }

    fn update_record(&mut self, id: &TaskId, progress: Progress, bus: &mut EventBus) {
        let Some(record) = self.running.get_mut(id) else {
            return;
        };

        if record.visual {
            if let Some(fraction) = progress.fraction {
                record.span.pb_set_length(1000);
                record.span.pb_set_position((fraction * 1000.0) as u64);
            }
            if let Some(message) = &progress.message {
                record.span.pb_set_message(message);
            }
        }

        record.progress = progress.clone();
        bus.push(Event::TaskProgress {
            id: id.clone(),
            progress,
        });
    }

    /// Updates a task's progress. Unknown tasks are ignored.
    pub fn set_task_progress(
        &mut self,
        id: &TaskId,
        prog_max: usize,
        prog: usize,
        message: Option<&str>,
        percent: bool,
        bus: &mut EventBus,
    ) {
        if !self.running.contains_key(id) {
            tracing::trace!(task = %id, "ignoring progress for unknown task");
            return;
        }

        self.update_record(id, Progress::new(prog_max, prog, message, percent), bus);
    }

    /// Cancels a task. Once this returns, the task is gone and its result
    /// will never be reported, whether or not a worker is still running it.
    pub fn cancel_task(&mut self, id: &TaskId, bus: &mut EventBus) -> Option<TaskRecord> {
        let record = self.running.remove(id)?;
        record.token.cancel();

        tracing::info!(task = %id, name = %record.name, "task cancelled");
        self.record_history(&record, ExecutionStatus::Cancelled);
        bus.push(Event::TaskDone(id.clone()));

        Some(record)
    }

    /// Cancels everything, including tasks not yet started.
    pub fn quit(&mut self, bus: &mut EventBus) -> Vec<TaskRecord> {
        self.submissions.clear();

        let ids: Vec<TaskId> = self.running.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.cancel_task(id, bus))
            .collect()
    }

    fn record_history(&mut self, record: &TaskRecord, status: ExecutionStatus) {
        self.history.push(TaskExecution {
            id: record.id.clone(),
            name: record.name.clone(),
            start: record.started,
            duration: record.started.elapsed(),
            status,
        });

        if self.history.len() > self.history_limit {
            let excess = self.history.len() - self.history_limit;
            self.history.drain(..excess);
        }
    }

    pub fn is_task_running(&self, id: &TaskId) -> bool {
        self.running.contains_key(id)
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.running.get(id)
    }

    pub fn running(&self) -> impl Iterator<Item = &TaskRecord> {
        self.running.values()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// No task running and none waiting to be started.
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.submissions.is_empty()
    }

    /// Finished, failed and cancelled executions, oldest first.
    pub fn history(&self) -> &[TaskExecution] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Keeps at most `limit` executions, dropping the oldest.
    pub fn set_history_limit(&mut self, limit: usize) {
        self.history_limit = limit;
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn kinds(bus: &mut EventBus) -> Vec<Event> {
        bus.drain()
    }

    #[test]
    fn test_inline_task_completes_on_poll() {
        let mut manager = TaskManager::<u32>::new();
        let mut bus = EventBus::new();

        let id = manager
            .new_task(TaskSpec::new(|_| Ok(7)).name("seven"), &mut bus)
            .unwrap();
        assert!(manager.is_task_running(&id));

        let done = manager.poll(&mut bus);
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].outcome, Outcome::Finished(7)));
        assert!(!manager.is_task_running(&id));
        assert_eq!(
            kinds(&mut bus),
            vec![Event::TaskCreated(id.clone()), Event::TaskDone(id)]
        );
    }

    #[test]
    fn test_key_collision() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();
        let key = TaskId::new("energy__m__d");

        assert!(
            manager
                .new_task(TaskSpec::new(|_| Ok(())).key(key.clone()), &mut bus)
                .is_some()
        );
        assert!(
            manager
                .new_task(TaskSpec::new(|_| Ok(())).key(key), &mut bus)
                .is_none()
        );
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_auto_ids_are_distinct() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        let a = manager.new_task(TaskSpec::new(|_| Ok(())), &mut bus);
        let b = manager.new_task(TaskSpec::new(|_| Ok(())), &mut bus);
        assert_ne!(a, b);
    }

    #[test]
    fn test_failure_still_reports_done() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        let id = manager
            .new_task(
                TaskSpec::new(|_| Err(anyhow::anyhow!("no reference forces"))),
                &mut bus,
            )
            .unwrap();

        let done = manager.poll(&mut bus);
        assert!(matches!(done[0].outcome, Outcome::Failed(_)));

        let events = kinds(&mut bus);
        let count = events
            .iter()
            .filter(|e| **e == Event::TaskDone(id.clone()))
            .count();
        assert_eq!(count, 1);
        assert_eq!(manager.history()[0].status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_history_is_capped() {
        let mut manager = TaskManager::<u32>::new();
        let mut bus = EventBus::new();

        for n in 0..3 {
            manager.new_task(TaskSpec::new(move |_| Ok(n)).name(format!("task {n}")), &mut bus);
            manager.poll(&mut bus);
        }
        assert_eq!(manager.history().len(), 3);

        manager.set_history_limit(2);
        let names: Vec<_> = manager.history().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["task 1", "task 2"]);

        manager.new_task(TaskSpec::new(|_| Ok(3)).name("task 3"), &mut bus);
        manager.poll(&mut bus);
        assert_eq!(manager.history().len(), 2);
        assert_eq!(manager.history()[1].name, "task 3");

        manager.clear_history();
        assert!(manager.history().is_empty());
    }

    #[test]
    fn test_panic_is_caught() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        manager.new_task(TaskSpec::new(|_| panic!("boom")), &mut bus);

        let done = manager.poll(&mut bus);
        match &done[0].outcome {
            Outcome::Failed(err) => assert!(err.to_string().contains("boom")),
            Outcome::Finished(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_cancel_before_start() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        let id = manager
            .new_task(TaskSpec::new(|_| panic!("must not run")), &mut bus)
            .unwrap();

        let record = manager.cancel_task(&id, &mut bus).unwrap();
        assert_eq!(record.id, id);
        assert!(manager.poll(&mut bus).is_empty());
        assert!(manager.cancel_task(&id, &mut bus).is_none());
    }

    #[test]
    fn test_cancelled_threaded_result_is_discarded() {
        let mut manager = TaskManager::<u32>::new();
        let mut bus = EventBus::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel::<bool>();

        let id = manager
            .new_task(
                TaskSpec::new(move |handle| {
                    release_rx.recv().ok();
                    seen_tx.send(handle.is_running()).ok();
                    Ok(1)
                })
                .threaded(true),
                &mut bus,
            )
            .unwrap();

        manager.cancel_task(&id, &mut bus);
        release_tx.send(()).unwrap();

        // the worker observes the cancellation but still runs to the end
        assert!(!seen_rx.recv().unwrap());

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(200) {
            assert!(manager.poll(&mut bus).is_empty());
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_threaded_task_completes() {
        let mut manager = TaskManager::<u32>::new();
        let mut bus = EventBus::new();

        manager.new_task(TaskSpec::new(|_| Ok(3)).threaded(true), &mut bus);

        let start = Instant::now();
        let mut done = Vec::new();
        while done.is_empty() && start.elapsed() < Duration::from_secs(5) {
            done = manager.poll(&mut bus);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(done[0].outcome, Outcome::Finished(3)));
    }

    #[test]
    fn test_progress() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        let id = manager
            .new_task(
                TaskSpec::new(|handle| {
                    handle.set_progress(4, 1, Some("batch 1"), true);
                    Ok(())
                }),
                &mut bus,
            )
            .unwrap();

        manager.set_task_progress(&id, 10, 5, None, false, &mut bus);
        assert_eq!(manager.task(&id).unwrap().progress.fraction, Some(0.5));

        manager.poll(&mut bus);
        // progress sent from inside the body lands before the task finishes
        let progress: Vec<_> = bus
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::TaskProgress { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[1].fraction, Some(0.25));
        assert_eq!(progress[1].message.as_deref(), Some("batch 1"));
    }

    #[test]
    fn test_progress_for_unknown_task_is_ignored() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        manager.set_task_progress(&TaskId::new("ghost"), 1, 1, None, false, &mut bus);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_queue_task_waits_for_poll() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        manager.queue_task(TaskSpec::new(|_| Ok(())).key(TaskId::new("later")));
        assert!(!manager.is_task_running(&TaskId::new("later")));
        assert!(!manager.is_idle());

        let done = manager.poll(&mut bus);
        assert_eq!(done.len(), 1);
        assert!(manager.is_idle());
    }

    #[test]
    fn test_quit_cancels_everything() {
        let mut manager = TaskManager::<()>::new();
        let mut bus = EventBus::new();

        manager.new_task(TaskSpec::new(|_| Ok(())), &mut bus);
        manager.new_task(TaskSpec::new(|_| Ok(())), &mut bus);
        manager.queue_task(TaskSpec::new(|_| Ok(())));

        let cancelled = manager.quit(&mut bus);
        assert_eq!(cancelled.len(), 2);
        assert!(manager.is_idle());
        assert!(manager.poll(&mut bus).is_empty());
    }
}
