//! Deferred release of engine-owned state.
//!
//! Persistent handles and backing-store references must be released on the
//! isolate's owner thread, but values are dropped from whatever thread the
//! host happens to be on. The collector batches that garbage and frees it
//! from the owner thread's task queue.

use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use crate::runtime::isolate::IsolateManager;

/// Engine state awaiting release on the owner thread.
pub enum EngineGarbage {
    Global(v8::Global<v8::Value>),
    BackingStore(v8::SharedRef<v8::BackingStore>),
}

// Garbage is only ever created on the owner thread and only released there;
// in between it is inert cargo.
unsafe impl Send for EngineGarbage {}

struct CollectorState {
    garbage: Vec<EngineGarbage>,
    /// True while a release batch is queued or running on the owner thread.
    in_flight: bool,
}

pub struct ObjectCollector {
    isolate: Arc<IsolateManager>,
    state: Mutex<CollectorState>,
    drained: Condvar,
}

impl ObjectCollector {
    pub fn new(isolate: Arc<IsolateManager>) -> Self {
        Self {
            isolate,
            state: Mutex::new(CollectorState {
                garbage: Vec::new(),
                in_flight: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// Enqueue garbage for release on the owner thread.
    ///
    /// Callable from any thread, including the owner thread itself: the
    /// release batch is a queued task, never an inline wait, so there is no
    /// self-deadlock.
    pub fn collect(this: &Arc<Self>, garbage: EngineGarbage) {
        let mut state = this.state.lock().expect("collector poisoned");
        state.garbage.push(garbage);

        if state.in_flight {
            // A queued batch will pick this up (or re-submit for it).
            return;
        }
        state.in_flight = true;
        drop(state);

        Self::submit_batch(this);
    }

    fn submit_batch(this: &Arc<Self>) {
        let batch_owner = Arc::clone(this);
        let receiver = this
            .isolate
            .submit(move |_scope| Self::run_batch(&batch_owner));
        // The batch reports through the condvar, not the future.
        drop(receiver);
    }

    /// Runs on the owner thread: swap the pending garbage out and drop it.
    fn run_batch(this: &Arc<Self>) {
        let batch = {
            let mut state = this.state.lock().expect("collector poisoned");
            mem::take(&mut state.garbage)
        };
        drop(batch);

        let mut state = this.state.lock().expect("collector poisoned");
        if state.garbage.is_empty() {
            state.in_flight = false;
            drop(state);
            this.drained.notify_all();
            return;
        }
        // More garbage accumulated while we were dropping the batch.
        drop(state);
        Self::submit_batch(this);
    }

    /// Block until no release batch is queued or running.
    ///
    /// Called during context teardown after the registry has been cleared,
    /// so no new garbage can arrive. On the owner thread itself a queued
    /// batch could never run while we wait, so the backlog is dropped in
    /// place instead (the isolate is live and entered there).
    pub fn drain(&self) {
        if self.isolate.on_owner_thread() {
            let mut state = self.state.lock().expect("collector poisoned");
            let backlog = mem::take(&mut state.garbage);
            drop(state);
            drop(backlog);
            return;
        }

        let state = self.state.lock().expect("collector poisoned");
        let _unused = self
            .drained
            .wait_while(state, |state| state.in_flight)
            .expect("collector poisoned");
    }
}

impl Drop for ObjectCollector {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("collector poisoned");
        if !state.garbage.is_empty() {
            if self.isolate.on_owner_thread() {
                let backlog = mem::take(&mut state.garbage);
                drop(state);
                drop(backlog);
                return;
            }
            // The owner loop is gone and we are not on its thread; releasing
            // engine state here would race the isolate. Leak instead.
            tracing::error!(
                count = state.garbage.len(),
                "leaking engine handles: owner thread exited before collection"
            );
            mem::forget(mem::take(&mut state.garbage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_util;

    fn collector() -> (Arc<IsolateManager>, Arc<ObjectCollector>) {
        test_util::init_v8();
        let isolate = Arc::new(IsolateManager::new().expect("isolate"));
        let collector = Arc::new(ObjectCollector::new(isolate.clone()));
        (isolate, collector)
    }

    #[test]
    fn test_collect_from_external_thread_drains() {
        let (isolate, collector) = collector();

        let garbage = isolate
            .submit(|scope| {
                let obj = v8::Object::new(scope);
                EngineGarbage::Global(v8::Global::new(scope, obj.into()))
            })
            .blocking_recv()
            .expect("owner thread alive");

        ObjectCollector::collect(&collector, garbage);
        collector.drain();

        let state = collector.state.lock().unwrap();
        assert!(state.garbage.is_empty());
        assert!(!state.in_flight);
    }

    #[test]
    fn test_collect_from_owner_thread_does_not_deadlock() {
        let (isolate, collector) = collector();

        let inner = collector.clone();
        isolate
            .submit(move |scope| {
                let obj = v8::Object::new(scope);
                let global = v8::Global::new(scope, obj.into());
                ObjectCollector::collect(&inner, EngineGarbage::Global(global));
            })
            .blocking_recv()
            .expect("owner thread alive");

        collector.drain();
        assert!(!collector.state.lock().unwrap().in_flight);
    }

    #[test]
    fn test_drain_without_garbage_returns_immediately() {
        let (_isolate, collector) = collector();
        collector.drain();
    }
}
