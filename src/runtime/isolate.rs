//! Single-threaded ownership of the V8 isolate.
//!
//! V8 isolates are not thread safe, and gating access with a lock is
//! fragile around the platform's message pump, which blocks on work and
//! then dispatches it internally. Instead the isolate is hidden on a
//! dedicated owner thread, and everything that wants to touch it gets in
//! line by submitting a task. Tasks run in FIFO order with the isolate's
//! global context entered, and the microtask checkpoint runs once per loop
//! iteration so promise chains resolve deterministically at task
//! boundaries.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::runtime::error::{RuntimeError, RuntimeResult};

/// Owner-loop state. Published atomically; the loop re-reads it after every
/// task, so a state change followed by a wake task takes effect promptly.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Normal operation: run tasks, pump the message loop, drain microtasks.
    Run = 0,
    /// JavaScript is forbidden; the loop keeps servicing cleanup tasks.
    NoJs = 1,
    /// Exit the loop and dispose the isolate.
    Stop = 2,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoopState::Run,
            1 => LoopState::NoJs,
            _ => LoopState::Stop,
        }
    }
}

type OwnerTask = Box<dyn FnOnce(&mut v8::HandleScope) + Send + 'static>;

pub struct IsolateManager {
    task_tx: UnboundedSender<OwnerTask>,
    state: Arc<AtomicU8>,
    /// Set by the memory monitor; picked up at the next task boundary.
    pressure_hint: Arc<AtomicBool>,
    isolate_handle: v8::IsolateHandle,
    owner_thread: thread::ThreadId,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl IsolateManager {
    /// Spawn the owner thread and wait for it to bring up the isolate.
    ///
    /// The isolate and its single global context are created *on* the owner
    /// thread; this function only hands back the thread-safe pieces.
    pub fn new() -> RuntimeResult<Self> {
        let platform = crate::runtime::platform().ok_or(RuntimeError::PlatformNotInitialized)?;

        let (task_tx, task_rx) = tokio::sync::mpsc::unbounded_channel::<OwnerTask>();
        let (init_tx, init_rx) = mpsc::channel::<(v8::IsolateHandle, thread::ThreadId)>();

        let state = Arc::new(AtomicU8::new(LoopState::Run as u8));
        let pressure_hint = Arc::new(AtomicBool::new(false));

        let loop_state = state.clone();
        let loop_hint = pressure_hint.clone();
        let join_handle = thread::Builder::new()
            .name("jsgate-isolate".to_string())
            .spawn(move || owner_loop(platform, task_rx, loop_state, loop_hint, init_tx))
            .map_err(|err| RuntimeError::ThreadSpawn(err.to_string()))?;

        let (isolate_handle, owner_thread) =
            init_rx.recv().map_err(|_| RuntimeError::IsolateGone)?;

        Ok(Self {
            task_tx,
            state,
            pressure_hint,
            isolate_handle,
            owner_thread,
            join_handle: Some(join_handle),
        })
    }

    /// Schedule `f` on the owner thread and return a future for its result.
    ///
    /// `f` runs with a handle scope and the global context entered. Tasks
    /// submitted from one thread run in submission order. Submission itself
    /// never fails; if the owner loop is already gone the returned receiver
    /// resolves to an error.
    pub fn submit<R, F>(&self, f: F) -> oneshot::Receiver<R>
    where
        F: FnOnce(&mut v8::HandleScope) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let task: OwnerTask = Box::new(move |scope| {
            // The receiver may have been dropped by a fire-and-forget caller.
            let _ = result_tx.send(f(scope));
        });
        if self.task_tx.send(task).is_err() {
            tracing::debug!("task submitted after owner loop exit");
        }
        result_rx
    }

    /// Request that the engine abort the currently executing script.
    /// Safe from any thread; idempotent.
    pub fn terminate_running(&self) {
        self.isolate_handle.terminate_execution();
    }

    /// Clear a stale termination request before starting fresh work.
    pub fn clear_termination(&self) {
        self.isolate_handle.cancel_terminate_execution();
    }

    /// Forbid further JavaScript execution while keeping the loop alive for
    /// cleanup tasks. Also aborts the current script.
    pub fn stop_javascript(&self) {
        self.change_state(LoopState::NoJs);
        self.terminate_running();
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn on_owner_thread(&self) -> bool {
        thread::current().id() == self.owner_thread
    }

    /// Flag shared with the memory monitor: when set, the owner loop
    /// forwards a low-memory hint to the engine at the next task boundary.
    pub(crate) fn pressure_hint(&self) -> Arc<AtomicBool> {
        self.pressure_hint.clone()
    }

    /// Thread-safe handle for the wrapped isolate.
    pub(crate) fn isolate_handle(&self) -> v8::IsolateHandle {
        self.isolate_handle.clone()
    }

    fn change_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
        // Run a no-op task to kick the loop into noticing the new state.
        drop(self.submit(|_scope| {}));
    }
}

impl Drop for IsolateManager {
    fn drop(&mut self) {
        self.change_state(LoopState::Stop);
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };
        if self.on_owner_thread() {
            // The last reference unwound inside an owner-thread task; the
            // loop observes STOP and exits once that task returns. Joining
            // here would be joining ourselves.
            return;
        }
        if join_handle.join().is_err() {
            tracing::error!("isolate owner thread panicked");
        }
    }
}

/// The owner thread: create the isolate and its global context, then pump
/// tasks until told to stop.
fn owner_loop(
    platform: v8::SharedRef<v8::Platform>,
    mut task_rx: UnboundedReceiver<OwnerTask>,
    state: Arc<AtomicU8>,
    pressure_hint: Arc<AtomicBool>,
    init_tx: mpsc::Sender<(v8::IsolateHandle, thread::ThreadId)>,
) {
    let mut isolate = v8::Isolate::new(v8::CreateParams::default());
    // The loop runs the microtask checkpoint manually, once per iteration.
    isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);

    let global_context = {
        let scope = &mut v8::HandleScope::new(&mut isolate);
        let context = v8::Context::new(scope, Default::default());
        v8::Global::new(scope, context)
    };

    if init_tx
        .send((isolate.thread_safe_handle(), thread::current().id()))
        .is_err()
    {
        tracing::error!("isolate manager dropped before initialization finished");
        return;
    }
    drop(init_tx);

    loop {
        if LoopState::from_u8(state.load(Ordering::SeqCst)) == LoopState::Stop {
            break;
        }

        // Blocking on the queue is the loop's wait-for-work; state changes
        // wake it with a no-op task.
        let Some(task) = task_rx.blocking_recv() else {
            break;
        };

        let scope = &mut v8::HandleScope::with_context(&mut isolate, &global_context);
        task(scope);

        // Service engine-posted foreground work (GC finalization etc.).
        while v8::Platform::pump_message_loop(&platform, scope, false) {}

        if LoopState::from_u8(state.load(Ordering::SeqCst)) == LoopState::Run {
            scope.perform_microtask_checkpoint();
        }

        if pressure_hint.swap(false, Ordering::SeqCst) {
            scope.low_memory_notification();
        }
    }

    tracing::debug!("isolate owner loop exiting");

    // Tasks still queued at shutdown are dropped without running; their
    // completion futures resolve to errors on the caller side.
    task_rx.close();
    while let Ok(task) = task_rx.try_recv() {
        drop(task);
    }

    drop(global_context);
    // `isolate` drops here, on the only thread that ever touched it.
}
