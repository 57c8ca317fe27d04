//! C-style boundary for foreign-language hosts.
//!
//! Contexts are addressed by opaque `u64` ids through a process-wide
//! registry, so a host wrapper never holds (or frees) a native object
//! pointer. Lookups for dead ids degrade silently: null handles for value
//! operations, task id `0` for async operations, no-ops for the rest. The
//! host interprets those as "context is gone".
//!
//! Every delivered handle is owned by the host until it calls
//! [`jg_free_value`].

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::runtime::callback::ClientCallback;
use crate::runtime::value::{RawHandle, TypeTag};
use crate::runtime::{init_platform, Context, PlatformConfig};

/// Process-wide table of live contexts.
struct ContextRegistry {
    contexts: Mutex<HashMap<u64, Arc<Context>>>,
    next_context_id: AtomicU64,
}

impl ContextRegistry {
    fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            next_context_id: AtomicU64::new(1),
        }
    }

    fn make_context(&self, callback: ClientCallback) -> u64 {
        let context = match Context::new(callback) {
            Ok(context) => context,
            Err(err) => {
                tracing::error!("context creation failed: {err}");
                return 0;
            }
        };
        let context_id = self.next_context_id.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .expect("context registry poisoned")
            .insert(context_id, Arc::new(context));
        context_id
    }

    fn get(&self, context_id: u64) -> Option<Arc<Context>> {
        self.contexts
            .lock()
            .expect("context registry poisoned")
            .get(&context_id)
            .cloned()
    }

    fn free_context(&self, context_id: u64) {
        self.contexts
            .lock()
            .expect("context registry poisoned")
            .remove(&context_id);
    }

    fn count(&self) -> usize {
        self.contexts.lock().expect("context registry poisoned").len()
    }
}

static REGISTRY: OnceCell<ContextRegistry> = OnceCell::new();

fn registry() -> Option<&'static ContextRegistry> {
    REGISTRY.get()
}

fn context(context_id: u64) -> Option<Arc<Context>> {
    registry()?.get(context_id)
}

unsafe fn cstr_arg(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Initialize the engine. Must be called before any context is created;
/// subsequent calls are no-ops. `icu_path` and `snapshot_path` may be null.
///
/// # Safety
/// Non-null pointers must reference NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn jg_init(
    flags: *const c_char,
    icu_path: *const c_char,
    snapshot_path: *const c_char,
) {
    let flags = cstr_arg(flags);
    let icu_path = cstr_arg(icu_path);
    let snapshot_path = cstr_arg(snapshot_path);

    init_platform(&PlatformConfig {
        flags,
        icu_data_path: (!icu_path.is_empty()).then(|| PathBuf::from(icu_path)),
        snapshot_path: (!snapshot_path.is_empty()).then(|| PathBuf::from(snapshot_path)),
    });
    REGISTRY.get_or_init(ContextRegistry::new);
}

/// Create a context; results and JS callbacks are delivered through
/// `callback`. Returns `0` if the engine was never initialized.
#[no_mangle]
pub extern "C" fn jg_make_context(callback: ClientCallback) -> u64 {
    match registry() {
        Some(registry) => registry.make_context(callback),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn jg_free_context(context_id: u64) {
    if let Some(registry) = registry() {
        registry.free_context(context_id);
    }
}

#[no_mangle]
pub extern "C" fn jg_context_count() -> usize {
    match registry() {
        Some(registry) => registry.count(),
        None => usize::MAX,
    }
}

#[no_mangle]
pub extern "C" fn jg_alloc_int_val(context_id: u64, val: i64, tag: TypeTag) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.alloc_int(val, tag),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_alloc_double_val(context_id: u64, val: f64, tag: TypeTag) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.alloc_double(val, tag),
        None => std::ptr::null_mut(),
    }
}

/// # Safety
/// `val` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn jg_alloc_string_val(
    context_id: u64,
    val: *const u8,
    len: u64,
    tag: TypeTag,
) -> *mut RawHandle {
    let Some(context) = context(context_id) else {
        return std::ptr::null_mut();
    };
    let bytes = if val.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(val, len as usize)
    };
    context.alloc_string(bytes, tag)
}

#[no_mangle]
pub extern "C" fn jg_free_value(context_id: u64, handle: *mut RawHandle) {
    if let Some(context) = context(context_id) {
        context.free_value(handle);
    }
}

#[no_mangle]
pub extern "C" fn jg_value_count(context_id: u64) -> usize {
    match context(context_id) {
        Some(context) => context.value_count(),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn jg_eval(
    context_id: u64,
    code_handle: *mut RawHandle,
    callback_id: u64,
) -> u64 {
    match context(context_id) {
        Some(context) => context.eval(code_handle, callback_id),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn jg_call_function(
    context_id: u64,
    func_handle: *mut RawHandle,
    this_handle: *mut RawHandle,
    argv_handle: *mut RawHandle,
    callback_id: u64,
) -> u64 {
    match context(context_id) {
        Some(context) => context.call_function(func_handle, this_handle, argv_handle, callback_id),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn jg_cancel_task(context_id: u64, task_id: u64) {
    if let Some(context) = context(context_id) {
        context.cancel_task(task_id);
    }
}

#[no_mangle]
pub extern "C" fn jg_make_js_callback(context_id: u64, callback_id: u64) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.make_js_callback(callback_id),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_get_identity_hash(
    context_id: u64,
    obj_handle: *mut RawHandle,
) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.get_identity_hash(obj_handle),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_get_own_property_names(
    context_id: u64,
    obj_handle: *mut RawHandle,
) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.get_own_property_names(obj_handle),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_get_object_item(
    context_id: u64,
    obj_handle: *mut RawHandle,
    key_handle: *mut RawHandle,
) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.get_object_item(obj_handle, key_handle),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_set_object_item(
    context_id: u64,
    obj_handle: *mut RawHandle,
    key_handle: *mut RawHandle,
    val_handle: *mut RawHandle,
) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.set_object_item(obj_handle, key_handle, val_handle),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_del_object_item(
    context_id: u64,
    obj_handle: *mut RawHandle,
    key_handle: *mut RawHandle,
) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.del_object_item(obj_handle, key_handle),
        None => std::ptr::null_mut(),
    }
}

/// `new_val_handle` may be null to splice without inserting.
#[no_mangle]
pub extern "C" fn jg_splice_array(
    context_id: u64,
    array_handle: *mut RawHandle,
    start: i32,
    delete_count: i32,
    new_val_handle: *mut RawHandle,
) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.splice_array(array_handle, start, delete_count, new_val_handle),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_array_push(
    context_id: u64,
    array_handle: *mut RawHandle,
    new_val_handle: *mut RawHandle,
) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.array_push(array_handle, new_val_handle),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_heap_stats(context_id: u64) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.heap_stats(),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_heap_snapshot(context_id: u64) -> *mut RawHandle {
    match context(context_id) {
        Some(context) => context.heap_snapshot(),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn jg_set_hard_memory_limit(context_id: u64, limit: usize) {
    if let Some(context) = context(context_id) {
        context.set_hard_memory_limit(limit);
    }
}

#[no_mangle]
pub extern "C" fn jg_set_soft_memory_limit(context_id: u64, limit: usize) {
    if let Some(context) = context(context_id) {
        context.set_soft_memory_limit(limit);
    }
}

#[no_mangle]
pub extern "C" fn jg_hard_memory_limit_reached(context_id: u64) -> bool {
    context(context_id).is_some_and(|context| context.is_hard_memory_limit_reached())
}

#[no_mangle]
pub extern "C" fn jg_soft_memory_limit_reached(context_id: u64) -> bool {
    context(context_id).is_some_and(|context| context.is_soft_memory_limit_reached())
}

#[no_mangle]
pub extern "C" fn jg_low_memory_notification(context_id: u64) {
    if let Some(context) = context(context_id) {
        context.apply_low_memory_notification();
    }
}

/// Static NUL-terminated engine version string.
#[no_mangle]
pub extern "C" fn jg_v8_version() -> *const c_char {
    static VERSION: OnceCell<std::ffi::CString> = OnceCell::new();
    VERSION
        .get_or_init(|| {
            std::ffi::CString::new(crate::runtime::engine_version()).unwrap_or_default()
        })
        .as_ptr()
}

/// Whether the engine build runs inside the V8 sandbox. The bundled build
/// does not configure one, and the bindings expose no probe for it.
#[no_mangle]
pub extern "C" fn jg_v8_is_using_sandbox() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::mpsc;
    use std::time::Duration;

    static DELIVERIES: Lazy<Mutex<HashMap<u64, mpsc::Sender<(TypeTag, i64)>>>> =
        Lazy::new(|| Mutex::new(HashMap::new()));
    static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

    extern "C" fn forward_callback(callback_id: u64, value: *mut RawHandle) {
        let tag = unsafe { (*value).tag };
        let int = unsafe { (*value).payload.int_val };
        if let Some(tx) = DELIVERIES.lock().unwrap().get(&callback_id) {
            let _ = tx.send((tag, int));
        }
    }

    fn subscribe() -> (u64, mpsc::Receiver<(TypeTag, i64)>) {
        let callback_id = NEXT_CALLBACK_ID.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        DELIVERIES.lock().unwrap().insert(callback_id, tx);
        (callback_id, rx)
    }

    fn init() {
        let flags = std::ffi::CString::new("--expose-gc").unwrap();
        unsafe { jg_init(flags.as_ptr(), std::ptr::null(), std::ptr::null()) };
    }

    #[test]
    fn test_context_lifecycle_and_eval() {
        init();
        let context_id = jg_make_context(forward_callback);
        assert_ne!(context_id, 0);
        assert!(jg_context_count() >= 1);

        let (callback_id, rx) = subscribe();
        let code = b"6 * 7";
        let code_handle =
            unsafe { jg_alloc_string_val(context_id, code.as_ptr(), code.len() as u64, TypeTag::String) };
        assert!(!code_handle.is_null());
        assert_eq!(jg_value_count(context_id), 1);

        let task_id = jg_eval(context_id, code_handle, callback_id);
        assert_ne!(task_id, 0);

        let (tag, int) = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("result delivered");
        assert_eq!(tag, TypeTag::Integer);
        assert_eq!(int, 42);

        jg_free_value(context_id, code_handle);
        jg_free_context(context_id);
        assert!(context(context_id).is_none());
    }

    #[test]
    fn test_dead_context_id_degrades_quietly() {
        init();
        let dead = u64::MAX;

        assert!(jg_alloc_int_val(dead, 1, TypeTag::Integer).is_null());
        assert!(jg_heap_stats(dead).is_null());
        assert_eq!(jg_eval(dead, std::ptr::null_mut(), 0), 0);
        assert_eq!(jg_value_count(dead), 0);
        assert!(!jg_hard_memory_limit_reached(dead));
        jg_cancel_task(dead, 1);
        jg_free_context(dead);
        jg_low_memory_notification(dead);
    }

    #[test]
    fn test_version_string() {
        let version = jg_v8_version();
        assert!(!version.is_null());
        let text = unsafe { CStr::from_ptr(version) }.to_string_lossy();
        assert!(text.chars().next().unwrap().is_ascii_digit());
    }

    #[test]
    fn test_memory_limit_flags_roundtrip() {
        init();
        let context_id = jg_make_context(forward_callback);
        jg_set_hard_memory_limit(context_id, 1 << 30);
        jg_set_soft_memory_limit(context_id, 1 << 29);
        assert!(!jg_hard_memory_limit_reached(context_id));
        assert!(!jg_soft_memory_limit_reached(context_id));
        jg_free_context(context_id);
    }
}
