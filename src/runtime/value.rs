//! Value wrappers shared with the foreign-language host.
//!
//! A [`Value`] either carries an inline primitive, an owned UTF-8 buffer, or
//! pins a live engine object with a persistent handle. The host only ever
//! sees the address of the embedded [`RawHandle`], which stays stable for
//! the lifetime of the `Value` and doubles as its identity in the
//! [`ValueRegistry`].

use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Mutex};

use crate::runtime::collector::{EngineGarbage, ObjectCollector};

/// Discriminant for [`RawHandle`] payloads.
///
/// The numeric values are wire-visible and must never be renumbered. Tag 7
/// is retired and must not be reused.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Invalid = 0,
    Null = 1,
    Bool = 2,
    Integer = 3,
    Double = 4,
    String = 5,
    Array = 6,
    Date = 8,
    Symbol = 9,
    Object = 10,
    Undefined = 11,

    Function = 100,
    SharedArrayBuffer = 101,
    ArrayBuffer = 102,
    Promise = 103,
    ArrayBufferView = 104,

    ExecuteException = 200,
    ParseException = 201,
    OomException = 202,
    TimeoutException = 203,
    TerminatedException = 204,
    ValueException = 205,
    KeyException = 206,
}

impl TypeTag {
    pub fn is_exception(self) -> bool {
        self as u8 >= TypeTag::ExecuteException as u8
    }
}

/// Payload union of a [`RawHandle`].
#[repr(C)]
#[derive(Clone, Copy)]
pub union RawPayload {
    pub int_val: i64,
    pub double_val: f64,
    pub bytes: *mut u8,
}

/// Fixed-layout record shared with the host over the language boundary.
///
/// The host treats the address of this struct as the value's identity and
/// reads the payload directly: numbers and booleans are inline, strings and
/// exception summaries are `(bytes, len)` into memory owned by the `Value`,
/// and buffer types alias the engine's backing store.
#[repr(C, packed)]
pub struct RawHandle {
    pub payload: RawPayload,
    pub len: u64,
    pub tag: TypeTag,
}

impl RawHandle {
    fn inline(tag: TypeTag) -> Self {
        Self {
            payload: RawPayload { int_val: 0 },
            len: 0,
            tag,
        }
    }
}

/// Engine state pinned by a [`Value`].
///
/// Only the owner thread may release these; `Value::drop` routes them
/// through the [`ObjectCollector`].
struct PinnedEngineState {
    global: Option<v8::Global<v8::Value>>,
    backing_store: Option<v8::SharedRef<v8::BackingStore>>,
    collector: Arc<ObjectCollector>,
}

enum ValueData {
    /// Payload lives entirely inside the handle.
    Inline,
    /// NUL-terminated buffer backing `handle.payload.bytes`.
    Bytes(Vec<u8>),
    /// Persistent engine handle (plus backing store for buffer types).
    Engine(PinnedEngineState),
}

/// Server-side owner of one value visible to the host.
///
/// Published `Value`s are immutable; the embedded handle may be read from
/// any thread while the owning `Arc` is alive.
pub struct Value {
    handle: RawHandle,
    data: ValueData,
}

// Engine state inside `data` is only created and released on the owner
// thread (release goes through the collector), and the rest of the struct is
// immutable after construction.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Value {
    pub(crate) fn new_bool(val: bool) -> Self {
        let mut handle = RawHandle::inline(TypeTag::Bool);
        handle.payload.int_val = i64::from(val);
        Self {
            handle,
            data: ValueData::Inline,
        }
    }

    pub(crate) fn new_int(val: i64, tag: TypeTag) -> Self {
        let mut handle = RawHandle::inline(tag);
        handle.payload.int_val = val;
        Self {
            handle,
            data: ValueData::Inline,
        }
    }

    pub(crate) fn new_double(val: f64, tag: TypeTag) -> Self {
        let mut handle = RawHandle::inline(tag);
        handle.payload.double_val = val;
        Self {
            handle,
            data: ValueData::Inline,
        }
    }

    pub(crate) fn new_unit(tag: TypeTag) -> Self {
        Self {
            handle: RawHandle::inline(tag),
            data: ValueData::Inline,
        }
    }

    /// Copy `val` into an owned buffer with a trailing NUL. `len` excludes
    /// the NUL.
    pub(crate) fn new_bytes(val: &[u8], tag: TypeTag) -> Self {
        let mut buf = Vec::with_capacity(val.len() + 1);
        buf.extend_from_slice(val);
        buf.push(0);

        let mut handle = RawHandle::inline(tag);
        handle.payload.bytes = buf.as_ptr() as *mut u8;
        handle.len = val.len() as u64;
        Self {
            handle,
            data: ValueData::Bytes(buf),
        }
    }

    /// Pin a plain engine object.
    pub(crate) fn new_pinned(
        scope: &mut v8::HandleScope,
        val: v8::Local<v8::Value>,
        tag: TypeTag,
        collector: Arc<ObjectCollector>,
    ) -> Self {
        Self {
            handle: RawHandle::inline(tag),
            data: ValueData::Engine(PinnedEngineState {
                global: Some(v8::Global::new(scope, val)),
                backing_store: None,
                collector,
            }),
        }
    }

    /// Pin an ArrayBuffer-family object, exposing a pointer into its
    /// backing store. The pointer is valid only while the pin is alive.
    pub(crate) fn new_buffer(
        scope: &mut v8::HandleScope,
        val: v8::Local<v8::Value>,
        tag: TypeTag,
        backing_store: v8::SharedRef<v8::BackingStore>,
        byte_offset: usize,
        byte_length: usize,
        collector: Arc<ObjectCollector>,
    ) -> Self {
        let mut handle = RawHandle::inline(tag);
        handle.payload.bytes = match backing_store.data() {
            Some(data) => unsafe { data.as_ptr().cast::<u8>().add(byte_offset) },
            None => ptr::null_mut(),
        };
        handle.len = byte_length as u64;
        Self {
            handle,
            data: ValueData::Engine(PinnedEngineState {
                global: Some(v8::Global::new(scope, val)),
                backing_store: Some(backing_store),
                collector,
            }),
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.handle.tag
    }

    pub fn int_val(&self) -> i64 {
        unsafe { self.handle.payload.int_val }
    }

    pub fn double_val(&self) -> f64 {
        unsafe { self.handle.payload.double_val }
    }

    pub fn len(&self) -> usize {
        self.handle.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned UTF-8 bytes, excluding the trailing NUL. `None` for values
    /// without an owned buffer.
    pub fn utf8_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            ValueData::Bytes(buf) => Some(&buf[..buf.len() - 1]),
            _ => None,
        }
    }

    /// Address of the embedded wire handle; the value's identity. Only
    /// meaningful for values already placed behind their final `Arc`.
    pub(crate) fn handle_ptr(&self) -> *mut RawHandle {
        &self.handle as *const RawHandle as *mut RawHandle
    }

    /// Rebuild an engine value on the owner thread.
    ///
    /// Pinned values return the exact object they refer to; inline values
    /// are rehydrated from the handle payload. Integers wider than `i32`
    /// come back as BigInts so they survive a round trip. Exception tags
    /// (and anything else without a natural engine form) become `undefined`.
    pub(crate) fn to_v8<'s>(&self, scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Value> {
        if let ValueData::Engine(pinned) = &self.data {
            if let Some(global) = &pinned.global {
                return v8::Local::new(scope, global);
            }
        }

        match self.tag() {
            TypeTag::Null => v8::null(scope).into(),
            TypeTag::Undefined => v8::undefined(scope).into(),
            TypeTag::Bool => v8::Boolean::new(scope, self.int_val() != 0).into(),
            TypeTag::Integer => {
                let val = self.int_val();
                match i32::try_from(val) {
                    Ok(small) => v8::Integer::new(scope, small).into(),
                    Err(_) => v8::BigInt::new_from_i64(scope, val).into(),
                }
            }
            TypeTag::Double => v8::Number::new(scope, self.double_val()).into(),
            TypeTag::Date => v8::Date::new(scope, self.double_val())
                .map_or_else(|| v8::undefined(scope).into(), Into::into),
            TypeTag::String => match self.utf8_bytes().and_then(|bytes| {
                v8::String::new_from_utf8(scope, bytes, v8::NewStringType::Normal)
            }) {
                Some(string) => string.into(),
                None => v8::undefined(scope).into(),
            },
            _ => v8::undefined(scope).into(),
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if let ValueData::Engine(pinned) = &mut self.data {
            if let Some(global) = pinned.global.take() {
                ObjectCollector::collect(&pinned.collector, EngineGarbage::Global(global));
            }
            if let Some(store) = pinned.backing_store.take() {
                ObjectCollector::collect(&pinned.collector, EngineGarbage::BackingStore(store));
            }
        }
    }
}

/// Keeps host-visible values alive and resolves their handles back to
/// owning records.
///
/// Handles are returned to the host as raw pointers; the registry holds the
/// unique strong reference so the host never has to coordinate garbage
/// collection order with the rest of the runtime.
#[derive(Default)]
pub struct ValueRegistry {
    values: Mutex<HashMap<usize, Arc<Value>>>,
}

impl ValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value and return its wire handle.
    pub fn remember(&self, val: Arc<Value>) -> *mut RawHandle {
        let handle = val.handle_ptr();
        self.values
            .lock()
            .expect("value registry poisoned")
            .insert(handle as usize, val);
        handle
    }

    /// Drop the registry's reference. Silent if the handle is unknown.
    pub fn forget(&self, handle: *mut RawHandle) {
        self.values
            .lock()
            .expect("value registry poisoned")
            .remove(&(handle as usize));
    }

    /// Re-hydrate a value from its wire handle.
    pub fn lookup(&self, handle: *mut RawHandle) -> Option<Arc<Value>> {
        self.values
            .lock()
            .expect("value registry poisoned")
            .get(&(handle as usize))
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.values.lock().expect("value registry poisoned").len()
    }

    /// Drop every value at once. Used during context teardown, before the
    /// collector drains.
    pub fn clear(&self) {
        let drained: Vec<Arc<Value>> = {
            let mut values = self.values.lock().expect("value registry poisoned");
            values.drain().map(|(_, val)| val).collect()
        };
        drop(drained);
    }
}
