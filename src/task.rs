//! Cancellable, observable unit of engine work
//!
//! A [`Task`] is handed back as soon as an operation starts. Observers can
//! be attached at any point; ones attached after the task settled fire right
//! away with the stored outcome.
//!
//! ```text
//!            progress* ┐
//!                      ▼
//!   Pending ──┬──▶ Resolved(T)
//!             ├──▶ Rejected(E)
//!             └──▶ Aborted(E)
//! ```
//!
//! Exactly one terminal transition happens; later attempts return `false`.
//! Abort is cooperative: running work checks [`Task::is_pending`] at its
//! own checkpoints.
//!
//! Work usually starts before anyone has subscribed. Progress emitted while
//! no progress observer is attached is held and replayed to the first one,
//! unless a settle observer has already seen the outcome.

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::PdfErrorReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStage {
    Pending,
    Resolved,
    Rejected,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskErrorKind {
    Reject,
    Abort,
}

/// Failure half of a task outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError<E> {
    #[serde(rename = "type")]
    pub kind: TaskErrorKind,
    pub reason: E,
}

impl<E> TaskError<E> {
    pub fn reject(reason: E) -> Self {
        Self {
            kind: TaskErrorKind::Reject,
            reason,
        }
    }

    pub fn abort(reason: E) -> Self {
        Self {
            kind: TaskErrorKind::Abort,
            reason,
        }
    }
}

/// Terminal state of a task, as carried by `ExecuteResponse`
///
/// Serializes as `{"type":"result","value":..}` or
/// `{"type":"error","value":{"type":"reject"|"abort","reason":..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TaskOutcome<T, E> {
    Result(T),
    Error(TaskError<E>),
}

impl<T, E> TaskOutcome<T, E> {
    pub fn stage(&self) -> TaskStage {
        match self {
            TaskOutcome::Result(_) => TaskStage::Resolved,
            TaskOutcome::Error(e) if e.kind == TaskErrorKind::Reject => TaskStage::Rejected,
            TaskOutcome::Error(_) => TaskStage::Aborted,
        }
    }

    pub fn into_result(self) -> Result<T, TaskError<E>> {
        match self {
            TaskOutcome::Result(value) => Ok(value),
            TaskOutcome::Error(error) => Err(error),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, TaskOutcome::Error(e) if e.kind == TaskErrorKind::Abort)
    }
}

type SettleFn<T, E> = Box<dyn FnOnce(&TaskOutcome<T, E>) + Send>;
type AbortFn<E> = Box<dyn FnOnce(&E) + Send>;
type ProgressFn<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct TaskState<T, E, P> {
    outcome: Option<Arc<TaskOutcome<T, E>>>,
    on_settled: Vec<SettleFn<T, E>>,
    on_progress: Vec<ProgressFn<P>>,
    on_abort: Vec<AbortFn<E>>,
    /// Progress emitted before the first progress observer attached
    held: Vec<P>,
    /// Some settle observer has been handed the outcome
    settle_seen: bool,
}

struct TaskInner<T, E, P> {
    state: Mutex<TaskState<T, E, P>>,
    /// Held for a whole progress emission and for the terminal state change,
    /// so a terminal notification is never followed by a progress one.
    /// Reentrant so progress observers may settle the task.
    emit: ReentrantMutex<()>,
    settled: Notify,
}

/// Handle to a running operation. Clones share state.
pub struct Task<T, E = PdfErrorReason, P = ()> {
    inner: Arc<TaskInner<T, E, P>>,
}

impl<T, E, P> Clone for Task<T, E, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E, P> Default for Task<T, E, P>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    P: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E, P> std::fmt::Debug for Task<T, E, P>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    P: 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("stage", &self.stage()).finish()
    }
}

impl<T, E, P> Task<T, E, P>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    P: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskInner {
                state: Mutex::new(TaskState {
                    outcome: None,
                    on_settled: Vec::new(),
                    on_progress: Vec::new(),
                    on_abort: Vec::new(),
                    held: Vec::new(),
                    settle_seen: false,
                }),
                emit: ReentrantMutex::new(()),
                settled: Notify::new(),
            }),
        }
    }

    /// Already-resolved task
    pub fn resolved(value: T) -> Self {
        let task = Self::new();
        task.resolve(value);
        task
    }

    /// Already-rejected task
    pub fn rejected(reason: E) -> Self {
        let task = Self::new();
        task.reject(reason);
        task
    }

    pub fn stage(&self) -> TaskStage {
        self.inner
            .state
            .lock()
            .outcome
            .as_ref()
            .map_or(TaskStage::Pending, |o| o.stage())
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().outcome.is_none()
    }

    pub fn is_aborted(&self) -> bool {
        self.stage() == TaskStage::Aborted
    }

    /// Stored outcome, if settled
    pub fn outcome(&self) -> Option<TaskOutcome<T, E>> {
        self.inner
            .state
            .lock()
            .outcome
            .as_ref()
            .map(|o| o.as_ref().clone())
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(TaskOutcome::Result(value))
    }

    pub fn reject(&self, reason: E) -> bool {
        self.settle(TaskOutcome::Error(TaskError::reject(reason)))
    }

    /// Ask the work to stop; observers see an abort immediately
    pub fn abort(&self, reason: E) -> bool {
        self.settle(TaskOutcome::Error(TaskError::abort(reason)))
    }

    /// Forward a failure from another task, keeping its kind
    pub fn fail(&self, error: TaskError<E>) -> bool {
        self.settle(TaskOutcome::Error(error))
    }

    /// Perform the single terminal transition
    pub fn settle(&self, outcome: TaskOutcome<T, E>) -> bool {
        // Waits out any in-flight progress emission. Observers run after the
        // emission lock is dropped; later progress calls see the outcome.
        let (outcome, observers, abort_hooks) = {
            let _emit = self.inner.emit.lock();
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            let outcome = Arc::new(outcome);
            state.outcome = Some(outcome.clone());
            state.on_progress.clear();
            let observers = std::mem::take(&mut state.on_settled);
            if !observers.is_empty() {
                state.settle_seen = true;
                state.held.clear();
            }
            (outcome, observers, std::mem::take(&mut state.on_abort))
        };

        if let TaskOutcome::Error(error) = outcome.as_ref() {
            if error.kind == TaskErrorKind::Abort {
                for hook in abort_hooks {
                    hook(&error.reason);
                }
            }
        }
        for observer in observers {
            observer(&outcome);
        }
        self.inner.settled.notify_waiters();
        true
    }

    /// Emit a progress event. Dropped once the task has settled; held for
    /// the first observer while nobody listens.
    pub fn progress(&self, event: P) -> bool {
        let _emit = self.inner.emit.lock();

        let observers = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            if state.on_progress.is_empty() {
                state.held.push(event);
                return true;
            }
            state.on_progress.clone()
        };

        for observer in observers {
            // An observer may have settled the task
            if !self.is_pending() {
                break;
            }
            observer(&event);
        }
        true
    }

    /// Observe the terminal outcome
    pub fn on_settled(&self, f: impl FnOnce(&TaskOutcome<T, E>) + Send + 'static) {
        let stored = {
            let mut state = self.inner.state.lock();
            match state.outcome.clone() {
                Some(outcome) => {
                    state.settle_seen = true;
                    state.held.clear();
                    outcome
                }
                None => {
                    state.on_settled.push(Box::new(f));
                    return;
                }
            }
        };
        f(&stored);
    }

    /// Run `f` if the task ends in an abort. Unlike [`on_settled`], this
    /// does not count as observing the outcome, so held progress is kept.
    ///
    /// [`on_settled`]: Self::on_settled
    pub fn on_abort(&self, f: impl FnOnce(&E) + Send + 'static) {
        let stored = {
            let mut state = self.inner.state.lock();
            match state.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    state.on_abort.push(Box::new(f));
                    return;
                }
            }
        };
        if let TaskOutcome::Error(error) = stored.as_ref() {
            if error.kind == TaskErrorKind::Abort {
                f(&error.reason);
            }
        }
    }

    /// Observe success and failure separately
    pub fn wait(
        &self,
        on_result: impl FnOnce(&T) + Send + 'static,
        on_error: impl FnOnce(&TaskError<E>) + Send + 'static,
    ) {
        self.on_settled(move |outcome| match outcome {
            TaskOutcome::Result(value) => on_result(value),
            TaskOutcome::Error(error) => on_error(error),
        });
    }

    /// Observe progress. The first observer also receives events emitted
    /// before it attached.
    pub fn on_progress(&self, f: impl Fn(&P) + Send + Sync + 'static) {
        // Replay happens under the emission lock so live events queue behind it
        let _emit = self.inner.emit.lock();

        let observer: ProgressFn<P> = Arc::new(f);
        let (was_pending, held) = {
            let mut state = self.inner.state.lock();
            let was_pending = state.outcome.is_none();
            if was_pending {
                state.on_progress.push(observer.clone());
            }
            (was_pending, std::mem::take(&mut state.held))
        };

        for event in &held {
            // The observer may settle the task mid-replay
            if was_pending && !self.is_pending() {
                break;
            }
            observer(event);
        }
    }

    /// Wait for the terminal outcome
    pub async fn settled(&self) -> TaskOutcome<T, E> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::error::PdfErrorCode;

    type TestTask = Task<u32, PdfErrorReason, usize>;

    fn reason(message: &str) -> PdfErrorReason {
        PdfErrorReason::new(PdfErrorCode::Unknown, message)
    }

    #[test]
    fn test_single_terminal_transition() {
        let task = TestTask::new();
        assert!(task.resolve(1));
        assert!(!task.resolve(2));
        assert!(!task.reject(reason("late")));
        assert!(!task.abort(reason("late")));

        assert_eq!(task.stage(), TaskStage::Resolved);
        assert_eq!(task.outcome(), Some(TaskOutcome::Result(1)));
    }

    #[test]
    fn test_late_observer_fires_immediately() {
        let task = TestTask::rejected(reason("bad"));
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        task.wait(
            |_| panic!("not resolved"),
            move |error| *sink.lock() = Some(error.clone()),
        );

        let error = seen.lock().clone().unwrap();
        assert_eq!(error.kind, TaskErrorKind::Reject);
        assert_eq!(error.reason.message, "bad");
    }

    #[test]
    fn test_progress_stops_at_terminal() {
        let task = TestTask::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        task.on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.progress(1));
        assert!(task.progress(2));
        task.abort(PdfErrorReason::cancelled());
        assert!(!task.progress(3));

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(task.is_aborted());
    }

    #[test]
    fn test_observer_may_abort_from_progress() {
        let task = TestTask::new();
        let handle = task.clone();
        task.on_progress(move |n| {
            if *n == 2 {
                handle.abort(PdfErrorReason::cancelled());
            }
        });
        let after = Arc::new(AtomicUsize::new(0));
        let counter = after.clone();
        task.on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.progress(1);
        task.progress(2);
        assert!(task.is_aborted());
        // Second observer saw event 1 but not event 2
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outcome_wire_shape() {
        let ok: TaskOutcome<u32, PdfErrorReason> = TaskOutcome::Result(7);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"type": "result", "value": 7})
        );

        let aborted: TaskOutcome<u32, PdfErrorReason> =
            TaskOutcome::Error(TaskError::abort(PdfErrorReason::cancelled()));
        assert_eq!(
            serde_json::to_value(&aborted).unwrap(),
            serde_json::json!({
                "type": "error",
                "value": {
                    "type": "abort",
                    "reason": {"code": "cancelled", "message": "aborted by client"}
                }
            })
        );
    }

    #[test]
    fn test_progress_before_subscribe_is_replayed() {
        let task = TestTask::new();
        task.progress(1);
        task.progress(2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        task.on_progress(move |n| sink.lock().push(*n));
        task.progress(3);

        // A second observer only sees live events
        let late = Arc::new(Mutex::new(Vec::new()));
        let sink = late.clone();
        task.on_progress(move |n| sink.lock().push(*n));
        task.progress(4);

        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
        assert_eq!(*late.lock(), vec![4]);
    }

    #[test]
    fn test_held_progress_survives_unobserved_settle() {
        // Work finished before anyone subscribed: events still come first
        let task = TestTask::new();
        task.progress(1);
        task.progress(2);
        task.resolve(7);

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        task.on_progress(move |n| sink.lock().push(format!("progress {n}")));
        let sink = log.clone();
        task.on_settled(move |outcome| sink.lock().push(format!("settled {:?}", outcome.stage())));

        assert_eq!(
            *log.lock(),
            vec!["progress 1", "progress 2", "settled Resolved"]
        );
    }

    #[test]
    fn test_no_replay_after_outcome_observed() {
        let task = TestTask::new();
        task.progress(1);
        task.on_settled(|_| {});
        task.resolve(7);

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        task.on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_hook_keeps_held_progress() {
        let task = TestTask::new();
        let aborted = Arc::new(Mutex::new(None));
        let sink = aborted.clone();
        task.on_abort(move |reason| *sink.lock() = Some(reason.clone()));

        task.progress(1);
        task.resolve(2);
        assert!(aborted.lock().is_none());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        task.on_progress(move |n| sink.lock().push(*n));
        assert_eq!(*seen.lock(), vec![1]);

        let task = TestTask::new();
        let sink = aborted.clone();
        task.on_abort(move |reason| *sink.lock() = Some(reason.clone()));
        task.abort(PdfErrorReason::cancelled());
        assert_eq!(*aborted.lock(), Some(PdfErrorReason::cancelled()));
    }

    #[tokio::test]
    async fn test_settled_resolves_from_other_task() {
        let task = TestTask::new();
        let worker = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            worker.progress(50);
            worker.resolve(42);
        });

        assert_eq!(task.settled().await, TaskOutcome::Result(42));
        // Already settled: returns straight away
        assert_eq!(task.settled().await.into_result().unwrap(), 42);
    }
}
