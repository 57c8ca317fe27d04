//! The per-context façade tying the runtime together.
//!
//! A `Context` owns one isolate (and its owner thread), the value registry
//! and factory, the memory monitor, the object collector, and the operation
//! modules. Synchronous operations block on an owner-thread task;
//! asynchronous operations (eval, function calls) go through the cancelable
//! task manager and deliver their result through the host callback.

use std::ptr;
use std::sync::Arc;

use crate::runtime::callback::{CallbackSink, ClientCallback, JsCallbackMaker};
use crate::runtime::collector::ObjectCollector;
use crate::runtime::error::RuntimeResult;
use crate::runtime::eval::CodeEvaluator;
use crate::runtime::factory::ValueFactory;
use crate::runtime::heap::HeapReporter;
use crate::runtime::isolate::IsolateManager;
use crate::runtime::memory::MemoryMonitor;
use crate::runtime::object::ObjectManipulator;
use crate::runtime::task::CancelableTaskManager;
use crate::runtime::value::{RawHandle, TypeTag, Value, ValueRegistry};

/// One isolated JavaScript context, safe to drive from any thread.
///
/// Field order is teardown order: tasks are canceled first, the registry is
/// drained before the collector, and the isolate manager (which joins the
/// owner thread) goes last.
pub struct Context {
    task_manager: CancelableTaskManager,
    evaluator: CodeEvaluator,
    manipulator: ObjectManipulator,
    callback_maker: JsCallbackMaker,
    heap_reporter: HeapReporter,
    sink: Arc<CallbackSink>,
    registry: Arc<ValueRegistry>,
    factory: Arc<ValueFactory>,
    monitor: MemoryMonitor,
    collector: Arc<ObjectCollector>,
    isolate: Arc<IsolateManager>,
}

impl Context {
    /// Bring up an isolate on a fresh owner thread.
    ///
    /// `callback` receives every asynchronous result (and every JS→host
    /// callback invocation); it may be called from the owner thread, and
    /// ownership of delivered handles transfers to the host.
    pub fn new(callback: ClientCallback) -> RuntimeResult<Self> {
        let isolate = Arc::new(IsolateManager::new()?);
        let collector = Arc::new(ObjectCollector::new(isolate.clone()));
        let monitor = MemoryMonitor::new(isolate.clone());
        let factory = Arc::new(ValueFactory::new(collector.clone()));
        let registry = Arc::new(ValueRegistry::new());
        let sink = Arc::new(CallbackSink::new(
            registry.clone(),
            factory.clone(),
            callback,
        ));

        Ok(Self {
            task_manager: CancelableTaskManager::new(isolate.clone()),
            evaluator: CodeEvaluator::new(factory.clone(), monitor.state()),
            manipulator: ObjectManipulator::new(factory.clone()),
            callback_maker: JsCallbackMaker::new(factory.clone(), sink.clone()),
            heap_reporter: HeapReporter::new(factory.clone()),
            sink,
            registry,
            factory,
            monitor,
            collector,
            isolate,
        })
    }

    // ---- value allocation and release -------------------------------------

    pub fn alloc_int(&self, val: i64, tag: TypeTag) -> *mut RawHandle {
        self.registry.remember(self.factory.from_int(val, tag))
    }

    pub fn alloc_double(&self, val: f64, tag: TypeTag) -> *mut RawHandle {
        self.registry.remember(self.factory.from_double(val, tag))
    }

    pub fn alloc_string(&self, val: &[u8], tag: TypeTag) -> *mut RawHandle {
        self.registry.remember(self.factory.from_bytes(val, tag))
    }

    pub fn free_value(&self, handle: *mut RawHandle) {
        self.registry.forget(handle);
    }

    pub fn value_count(&self) -> usize {
        self.registry.count()
    }

    // ---- memory policy ----------------------------------------------------

    pub fn set_hard_memory_limit(&self, bytes: usize) {
        self.monitor.set_hard_limit(bytes);
    }

    pub fn set_soft_memory_limit(&self, bytes: usize) {
        self.monitor.set_soft_limit(bytes);
    }

    pub fn is_hard_memory_limit_reached(&self) -> bool {
        self.monitor.is_hard_reached()
    }

    pub fn is_soft_memory_limit_reached(&self) -> bool {
        self.monitor.is_soft_reached()
    }

    pub fn apply_low_memory_notification(&self) {
        self.monitor.apply_low_memory_notification();
    }

    // ---- async operations -------------------------------------------------

    /// Compile and run a script; the result arrives through the host
    /// callback under `callback_id`. Returns the cancelable task id.
    pub fn eval(&self, code_handle: *mut RawHandle, callback_id: u64) -> u64 {
        let code = match self.resolve(code_handle, "code") {
            Ok(code) => code,
            Err(err) => return self.run_error_task(err, callback_id),
        };

        let evaluator = self.evaluator.clone();
        self.run_task(move |scope| evaluator.eval(scope, &code), callback_id)
    }

    /// Call a captured function; `this_handle` may be null for `undefined`.
    pub fn call_function(
        &self,
        func_handle: *mut RawHandle,
        this_handle: *mut RawHandle,
        argv_handle: *mut RawHandle,
        callback_id: u64,
    ) -> u64 {
        let func = match self.resolve(func_handle, "func") {
            Ok(func) => func,
            Err(err) => return self.run_error_task(err, callback_id),
        };
        let this = if this_handle.is_null() {
            None
        } else {
            match self.resolve(this_handle, "this") {
                Ok(this) => Some(this),
                Err(err) => return self.run_error_task(err, callback_id),
            }
        };
        let argv = match self.resolve(argv_handle, "argv") {
            Ok(argv) => argv,
            Err(err) => return self.run_error_task(err, callback_id),
        };

        let manipulator = self.manipulator.clone();
        self.run_task(
            move |scope| manipulator.call(scope, &func, this.as_deref(), &argv),
            callback_id,
        )
    }

    pub fn cancel_task(&self, task_id: u64) {
        self.task_manager.cancel(task_id);
    }

    // ---- sync operations --------------------------------------------------

    pub fn make_js_callback(&self, callback_id: u64) -> *mut RawHandle {
        let maker = self.callback_maker.clone();
        self.run_sync(move |scope| maker.make_js_callback(scope, callback_id))
    }

    pub fn heap_stats(&self) -> *mut RawHandle {
        let reporter = self.heap_reporter.clone();
        self.run_sync(move |scope| reporter.heap_stats(scope))
    }

    pub fn heap_snapshot(&self) -> *mut RawHandle {
        let reporter = self.heap_reporter.clone();
        self.run_sync(move |scope| reporter.heap_snapshot(scope))
    }

    pub fn get_identity_hash(&self, obj_handle: *mut RawHandle) -> *mut RawHandle {
        let obj = match self.resolve(obj_handle, "obj") {
            Ok(obj) => obj,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |scope| manipulator.identity_hash(scope, &obj))
    }

    pub fn get_own_property_names(&self, obj_handle: *mut RawHandle) -> *mut RawHandle {
        let obj = match self.resolve(obj_handle, "obj") {
            Ok(obj) => obj,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |scope| manipulator.own_property_names(scope, &obj))
    }

    pub fn get_object_item(
        &self,
        obj_handle: *mut RawHandle,
        key_handle: *mut RawHandle,
    ) -> *mut RawHandle {
        let (obj, key) = match self.resolve_pair(obj_handle, key_handle) {
            Ok(pair) => pair,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |scope| manipulator.get(scope, &obj, &key))
    }

    pub fn set_object_item(
        &self,
        obj_handle: *mut RawHandle,
        key_handle: *mut RawHandle,
        val_handle: *mut RawHandle,
    ) -> *mut RawHandle {
        let (obj, key) = match self.resolve_pair(obj_handle, key_handle) {
            Ok(pair) => pair,
            Err(err) => return self.registry.remember(err),
        };
        let val = match self.resolve(val_handle, "val") {
            Ok(val) => val,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |scope| manipulator.set(scope, &obj, &key, &val))
    }

    pub fn del_object_item(
        &self,
        obj_handle: *mut RawHandle,
        key_handle: *mut RawHandle,
    ) -> *mut RawHandle {
        let (obj, key) = match self.resolve_pair(obj_handle, key_handle) {
            Ok(pair) => pair,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |scope| manipulator.del(scope, &obj, &key))
    }

    /// `new_val_handle` may be null to splice without inserting.
    pub fn splice_array(
        &self,
        obj_handle: *mut RawHandle,
        start: i32,
        delete_count: i32,
        new_val_handle: *mut RawHandle,
    ) -> *mut RawHandle {
        let obj = match self.resolve(obj_handle, "obj") {
            Ok(obj) => obj,
            Err(err) => return self.registry.remember(err),
        };
        let new_val = if new_val_handle.is_null() {
            None
        } else {
            match self.resolve(new_val_handle, "new_val") {
                Ok(val) => Some(val),
                Err(err) => return self.registry.remember(err),
            }
        };

        let manipulator = self.manipulator.clone();
        self.run_sync(move |scope| {
            manipulator.splice(scope, &obj, start, delete_count, new_val.as_deref())
        })
    }

    pub fn array_push(
        &self,
        obj_handle: *mut RawHandle,
        new_val_handle: *mut RawHandle,
    ) -> *mut RawHandle {
        let obj = match self.resolve(obj_handle, "obj") {
            Ok(obj) => obj,
            Err(err) => return self.registry.remember(err),
        };
        let new_val = match self.resolve(new_val_handle, "new_val") {
            Ok(val) => val,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |scope| manipulator.push(scope, &obj, &new_val))
    }

    // ---- plumbing ---------------------------------------------------------

    /// Look a handle up, or synthesize the bad-handle error value.
    fn resolve(&self, handle: *mut RawHandle, name: &str) -> Result<Arc<Value>, Arc<Value>> {
        self.registry.lookup(handle).ok_or_else(|| {
            self.factory
                .from_str(&format!("Bad handle: {name}"), TypeTag::ValueException)
        })
    }

    fn resolve_pair(
        &self,
        obj_handle: *mut RawHandle,
        key_handle: *mut RawHandle,
    ) -> Result<(Arc<Value>, Arc<Value>), Arc<Value>> {
        let obj = self.resolve(obj_handle, "obj")?;
        let key = self.resolve(key_handle, "key")?;
        Ok((obj, key))
    }

    /// Schedule a cancelable body whose result is delivered through the
    /// host callback. Cancellation delivers a terminated error instead.
    fn run_task<B>(&self, body: B, callback_id: u64) -> u64
    where
        B: FnOnce(&mut v8::HandleScope) -> Arc<Value> + Send + 'static,
    {
        let on_completed_sink = self.sink.clone();
        let on_canceled_sink = self.sink.clone();
        let factory = self.factory.clone();

        self.task_manager.schedule(
            body,
            move |val| on_completed_sink.deliver(callback_id, val),
            move |_discarded| {
                let err = factory.from_str("execution terminated", TypeTag::TerminatedException);
                on_canceled_sink.deliver(callback_id, err);
            },
        )
    }

    fn run_error_task(&self, err: Arc<Value>, callback_id: u64) -> u64 {
        self.run_task(move |_scope| err, callback_id)
    }

    fn run_sync<F>(&self, f: F) -> *mut RawHandle
    where
        F: FnOnce(&mut v8::HandleScope) -> Arc<Value> + Send + 'static,
    {
        match self.isolate.submit(f).blocking_recv() {
            Ok(val) => self.registry.remember(val),
            Err(_) => {
                tracing::warn!("synchronous operation after owner loop exit");
                ptr::null_mut()
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Keep the owner loop alive for cleanup, but refuse further JS.
        self.isolate.stop_javascript();
        // Drop every host-visible value, then wait for the collector to
        // release the engine state those values pinned.
        self.registry.clear();
        self.collector.drain();
    }
}
