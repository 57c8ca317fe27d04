//! Heap-limit enforcement for one isolate.
//!
//! A GC epilogue callback observes heap growth after every collection.
//! Crossing the soft limit flags the isolate for a low-memory hint (applied
//! by the owner loop at the next task boundary; hinting from inside a GC
//! callback would re-enter the collector). Crossing the hard limit flags
//! the isolate and terminates the running script; the code evaluator turns
//! that termination into an OOM error.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::isolate::IsolateManager;

/// State shared between the monitor, the GC callback, and the evaluator.
pub struct MemoryState {
    soft_limit: AtomicUsize,
    hard_limit: AtomicUsize,
    soft_reached: AtomicBool,
    hard_reached: AtomicBool,
    pressure_hint: Arc<AtomicBool>,
    isolate_handle: v8::IsolateHandle,
}

impl MemoryState {
    pub fn is_soft_reached(&self) -> bool {
        self.soft_reached.load(Ordering::SeqCst)
    }

    pub fn is_hard_reached(&self) -> bool {
        self.hard_reached.load(Ordering::SeqCst)
    }

    /// Called from the GC epilogue with the post-collection heap usage.
    fn observe(&self, used_heap_size: usize) {
        let soft = self.soft_limit.load(Ordering::SeqCst);
        if soft > 0 && used_heap_size > soft {
            self.soft_reached.store(true, Ordering::SeqCst);
            self.pressure_hint.store(true, Ordering::SeqCst);
        } else {
            self.soft_reached.store(false, Ordering::SeqCst);
        }

        let hard = self.hard_limit.load(Ordering::SeqCst);
        if hard > 0 && used_heap_size > hard {
            self.hard_reached.store(true, Ordering::SeqCst);
            self.isolate_handle.terminate_execution();
        }
    }
}

pub struct MemoryMonitor {
    isolate: Arc<IsolateManager>,
    state: Arc<MemoryState>,
    /// Raw `Arc<MemoryState>` handed to the engine as callback data; turned
    /// back into an `Arc` when the callback is unregistered.
    callback_data: usize,
}

extern "C" fn gc_epilogue(
    isolate: *mut v8::Isolate,
    _gc_type: v8::GCType,
    _flags: v8::GCCallbackFlags,
    data: *mut c_void,
) {
    let state = unsafe { &*(data as *const MemoryState) };
    let isolate = unsafe { &mut *isolate };

    let mut stats = v8::HeapStatistics::default();
    isolate.get_heap_statistics(&mut stats);
    state.observe(stats.used_heap_size());
}

impl MemoryMonitor {
    pub fn new(isolate: Arc<IsolateManager>) -> Self {
        let state = Arc::new(MemoryState {
            soft_limit: AtomicUsize::new(0),
            hard_limit: AtomicUsize::new(0),
            soft_reached: AtomicBool::new(false),
            hard_reached: AtomicBool::new(false),
            pressure_hint: isolate.pressure_hint(),
            isolate_handle: isolate.isolate_handle(),
        });

        let callback_data = Arc::into_raw(state.clone()) as usize;
        drop(isolate.submit(move |scope| {
            scope.add_gc_epilogue_callback(
                gc_epilogue,
                callback_data as *mut c_void,
                v8::GCType::ALL,
            );
        }));

        Self {
            isolate,
            state,
            callback_data,
        }
    }

    /// Shared flags, for the evaluator's OOM classification.
    pub fn state(&self) -> Arc<MemoryState> {
        self.state.clone()
    }

    /// `0` disables the limit. Setting a limit clears its reached flag.
    pub fn set_soft_limit(&self, bytes: usize) {
        self.state.soft_limit.store(bytes, Ordering::SeqCst);
        self.state.soft_reached.store(false, Ordering::SeqCst);
    }

    /// `0` disables the limit. Setting a limit clears its reached flag.
    pub fn set_hard_limit(&self, bytes: usize) {
        self.state.hard_limit.store(bytes, Ordering::SeqCst);
        self.state.hard_reached.store(false, Ordering::SeqCst);
    }

    pub fn is_soft_reached(&self) -> bool {
        self.state.is_soft_reached()
    }

    pub fn is_hard_reached(&self) -> bool {
        self.state.is_hard_reached()
    }

    /// Forward a low-memory hint to the engine.
    pub fn apply_low_memory_notification(&self) {
        drop(self.isolate.submit(|scope| {
            scope.low_memory_notification();
        }));
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        let callback_data = self.callback_data;
        let receiver = self.isolate.submit(move |scope| {
            scope.remove_gc_epilogue_callback(gc_epilogue, callback_data as *mut c_void);
            drop(unsafe { Arc::from_raw(callback_data as *const MemoryState) });
        });
        if receiver.blocking_recv().is_err() {
            // Owner loop already gone; the callback can never fire again,
            // but its Arc reference is unrecoverable.
            tracing::warn!("leaking GC callback registration: owner thread exited");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_util;

    fn monitor() -> (Arc<IsolateManager>, MemoryMonitor) {
        test_util::init_v8();
        let isolate = Arc::new(IsolateManager::new().expect("isolate"));
        let monitor = MemoryMonitor::new(isolate.clone());
        (isolate, monitor)
    }

    #[test]
    fn test_limits_default_off() {
        let (_isolate, monitor) = monitor();
        assert!(!monitor.is_soft_reached());
        assert!(!monitor.is_hard_reached());
    }

    #[test]
    fn test_setting_limits_clears_flags() {
        let (_isolate, monitor) = monitor();
        monitor.state.soft_reached.store(true, Ordering::SeqCst);
        monitor.state.hard_reached.store(true, Ordering::SeqCst);

        monitor.set_soft_limit(1024);
        monitor.set_hard_limit(0);
        assert!(!monitor.is_soft_reached());
        assert!(!monitor.is_hard_reached());
    }

    #[test]
    fn test_observe_marks_and_clears_soft() {
        let (_isolate, monitor) = monitor();
        let state = monitor.state();

        monitor.set_soft_limit(1000);
        state.observe(2000);
        assert!(state.is_soft_reached());

        state.observe(10);
        assert!(!state.is_soft_reached());
    }

    #[test]
    fn test_observe_marks_hard() {
        let (_isolate, monitor) = monitor();
        let state = monitor.state();

        monitor.set_hard_limit(1000);
        state.observe(5000);
        assert!(state.is_hard_reached());

        // Hard-reached is sticky until the limit is reset.
        state.observe(10);
        assert!(state.is_hard_reached());
    }

    #[test]
    fn test_low_memory_notification_roundtrip() {
        let (isolate, monitor) = monitor();
        monitor.apply_low_memory_notification();
        // Synchronize on a follow-up task so the hint has been applied.
        isolate
            .submit(|_scope| {})
            .blocking_recv()
            .expect("owner thread alive");
    }
}
