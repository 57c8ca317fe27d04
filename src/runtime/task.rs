//! Cancellable user-visible work.
//!
//! Script evaluation and function calls can spin forever, so every async
//! operation runs as a task with a tiny state machine:
//! `not-started → running → {completed | canceled}`. Cancellation and
//! completion race; the per-task mutex is the sole arbiter, and exactly one
//! of the two terminal callbacks fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::isolate::{IsolateManager, LoopState};
use crate::runtime::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskPhase {
    NotStarted,
    Running,
    Completed,
    Canceled,
}

pub struct TaskState {
    phase: Mutex<TaskPhase>,
    isolate: Arc<IsolateManager>,
}

impl TaskState {
    fn new(isolate: Arc<IsolateManager>) -> Self {
        Self {
            phase: Mutex::new(TaskPhase::NotStarted),
            isolate,
        }
    }

    /// Cancel the task. Terminates in-flight engine execution when the task
    /// is already running. No-op once the task is terminal.
    pub fn cancel(&self) {
        let mut phase = self.phase.lock().expect("task state poisoned");
        match *phase {
            TaskPhase::Canceled | TaskPhase::Completed => {}
            TaskPhase::Running => {
                self.isolate.terminate_running();
                *phase = TaskPhase::Canceled;
            }
            TaskPhase::NotStarted => {
                *phase = TaskPhase::Canceled;
            }
        }
    }

    fn set_running_if_not_canceled(&self) -> bool {
        let mut phase = self.phase.lock().expect("task state poisoned");
        if *phase == TaskPhase::Canceled {
            return false;
        }
        *phase = TaskPhase::Running;
        true
    }

    fn set_complete_if_not_canceled(&self) -> bool {
        let mut phase = self.phase.lock().expect("task state poisoned");
        if *phase == TaskPhase::Canceled {
            return false;
        }
        *phase = TaskPhase::Completed;
        true
    }
}

/// Cancels the task when dropped, unless it already reached a terminal
/// state. Makes abandoned tasks fire-and-forget safe.
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.state.cancel();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.state.cancel();
    }
}

/// Runs bodies on the isolate owner thread with cancellation tracking.
pub struct CancelableTaskManager {
    isolate: Arc<IsolateManager>,
    tasks: Arc<Mutex<HashMap<u64, TaskHandle>>>,
    next_task_id: AtomicU64,
}

impl CancelableTaskManager {
    pub fn new(isolate: Arc<IsolateManager>) -> Self {
        Self {
            isolate,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Schedule `body` on the owner thread.
    ///
    /// Exactly one of `on_completed` / `on_canceled` is invoked, on the
    /// owner thread. If cancellation wins the race after the body already
    /// produced a value, `on_canceled` receives that value so the caller
    /// can discard it.
    pub fn schedule<B, C, N>(&self, body: B, on_completed: C, on_canceled: N) -> u64
    where
        B: FnOnce(&mut v8::HandleScope) -> Arc<Value> + Send + 'static,
        C: FnOnce(Arc<Value>) + Send + 'static,
        N: FnOnce(Option<Arc<Value>>) + Send + 'static,
    {
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(TaskState::new(self.isolate.clone()));

        self.tasks
            .lock()
            .expect("task map poisoned")
            .insert(task_id, TaskHandle {
                state: state.clone(),
            });

        let isolate = self.isolate.clone();
        let tasks = self.tasks.clone();
        drop(self.isolate.submit(move |scope| {
            let finish = |tasks: &Mutex<HashMap<u64, TaskHandle>>| {
                tasks.lock().expect("task map poisoned").remove(&task_id);
            };

            // A termination requested for a previous task may not have been
            // consumed if that script finished first; don't let it kill us.
            // Cleared before the running transition so a cancel landing
            // after the transition still terminates the body.
            isolate.clear_termination();

            if !state.set_running_if_not_canceled() {
                on_canceled(None);
                finish(&tasks);
                return;
            }

            // Once JavaScript is stopped, queued work is refused rather
            // than run.
            if isolate.state() != LoopState::Run {
                state.cancel();
                on_canceled(None);
                finish(&tasks);
                return;
            }

            let result = body(scope);

            if state.set_complete_if_not_canceled() {
                on_completed(result);
            } else {
                on_canceled(Some(result));
            }
            finish(&tasks);
        }));

        task_id
    }

    /// Cancel by id. Unknown ids (never issued, or already finished) are
    /// ignored.
    pub fn cancel(&self, task_id: u64) {
        let tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(handle) = tasks.get(&task_id) {
            handle.cancel();
        }
    }
}

impl Drop for CancelableTaskManager {
    fn drop(&mut self) {
        // Dropping the handles cancels anything still pending.
        let leftover = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            tasks.drain().count()
        };
        if leftover > 0 {
            tracing::debug!(count = leftover, "canceling tasks at teardown");
        }
    }
}
