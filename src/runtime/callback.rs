//! JS functions that re-enter the host.
//!
//! A made callback is an ordinary JS function whose data slot carries a
//! 2-element array of unsigned BigInts: `[caller_id, callback_id]`. The
//! caller id resolves through a process-wide registry to the owning
//! context's delivery sink. Embedding ids instead of native pointers means
//! a JS function that outlives its context (the engine owns its lifetime)
//! degrades to a lookup miss and the late call is silently ignored,
//! instead of dereferencing freed memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::runtime::factory::ValueFactory;
use crate::runtime::value::{RawHandle, TypeTag, Value, ValueRegistry};

/// The host's single entry point for delivered results. Invoked on the
/// owner thread; ownership of the handle transfers to the host.
pub type ClientCallback = extern "C" fn(callback_id: u64, value: *mut RawHandle);

/// Delivery path back to one host context: publish the value in that
/// context's registry, then hand the handle across the boundary.
pub struct CallbackSink {
    registry: Arc<ValueRegistry>,
    factory: Arc<ValueFactory>,
    callback: ClientCallback,
}

impl CallbackSink {
    pub fn new(
        registry: Arc<ValueRegistry>,
        factory: Arc<ValueFactory>,
        callback: ClientCallback,
    ) -> Self {
        Self {
            registry,
            factory,
            callback,
        }
    }

    pub fn deliver(&self, callback_id: u64, val: Arc<Value>) {
        let handle = self.registry.remember(val);
        (self.callback)(callback_id, handle);
    }

    fn deliver_from_v8(
        &self,
        scope: &mut v8::HandleScope,
        callback_id: u64,
        val: v8::Local<v8::Value>,
    ) {
        self.deliver(callback_id, self.factory.from_v8(scope, val));
    }
}

/// Process-wide map from caller id to a live context's sink.
static CALLBACK_SINKS: Lazy<Mutex<HashMap<u64, Arc<CallbackSink>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

/// Registration of one sink in the process-wide map, released on drop.
struct CallerRegistration {
    caller_id: u64,
}

impl CallerRegistration {
    fn new(sink: Arc<CallbackSink>) -> Self {
        let caller_id = NEXT_CALLER_ID.fetch_add(1, Ordering::SeqCst);
        CALLBACK_SINKS
            .lock()
            .expect("callback sink registry poisoned")
            .insert(caller_id, sink);
        Self { caller_id }
    }
}

impl Drop for CallerRegistration {
    fn drop(&mut self) {
        CALLBACK_SINKS
            .lock()
            .expect("callback sink registry poisoned")
            .remove(&self.caller_id);
    }
}

fn lookup_sink(caller_id: u64) -> Option<Arc<CallbackSink>> {
    CALLBACK_SINKS
        .lock()
        .expect("callback sink registry poisoned")
        .get(&caller_id)
        .cloned()
}

#[derive(Clone)]
pub struct JsCallbackMaker {
    factory: Arc<ValueFactory>,
    registration: Arc<CallerRegistration>,
}

impl JsCallbackMaker {
    pub fn new(factory: Arc<ValueFactory>, sink: Arc<CallbackSink>) -> Self {
        Self {
            factory,
            registration: Arc::new(CallerRegistration::new(sink)),
        }
    }

    /// Build a JS function that forwards its arguments to the host under
    /// `callback_id`.
    pub fn make_js_callback(&self, scope: &mut v8::HandleScope, callback_id: u64) -> Arc<Value> {
        let caller_id = v8::BigInt::new_from_u64(scope, self.registration.caller_id);
        let callback_id = v8::BigInt::new_from_u64(scope, callback_id);
        let data =
            v8::Array::new_with_elements(scope, &[caller_id.into(), callback_id.into()]);

        match v8::Function::builder(on_called).data(data.into()).build(scope) {
            Some(function) => self.factory.from_v8(scope, function.into()),
            None => self
                .factory
                .from_str("Could not create func", TypeTag::ExecuteException),
        }
    }
}

fn bigint_element(
    scope: &mut v8::HandleScope,
    data: v8::Local<v8::Array>,
    index: u32,
) -> Option<u64> {
    let element = data.get_index(scope, index)?;
    let bigint = v8::Local::<v8::BigInt>::try_from(element).ok()?;
    let (id, lossless) = bigint.u64_value();
    lossless.then_some(id)
}

/// Trampoline installed behind every made callback. Unknown callers and
/// malformed data are dropped without observable effect.
fn on_called(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Ok(data) = v8::Local::<v8::Array>::try_from(args.data()) else {
        return;
    };
    if data.length() != 2 {
        return;
    }
    let Some(caller_id) = bigint_element(scope, data, 0) else {
        return;
    };
    let Some(callback_id) = bigint_element(scope, data, 1) else {
        return;
    };

    let argv = v8::Array::new(scope, args.length());
    for index in 0..args.length() {
        let element = args.get(index);
        let _ = argv.set_index(scope, index as u32, element);
    }

    let Some(sink) = lookup_sink(caller_id) else {
        // Context already torn down; the JS side outlived it.
        return;
    };
    sink.deliver_from_v8(scope, callback_id, argv.into());
}
