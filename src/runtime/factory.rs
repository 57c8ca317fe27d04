//! Manufacture of [`Value`]s from engine values, host primitives, and
//! caught exceptions.

use std::sync::Arc;

use crate::runtime::collector::ObjectCollector;
use crate::runtime::value::{TypeTag, Value};

pub struct ValueFactory {
    collector: Arc<ObjectCollector>,
}

impl ValueFactory {
    pub fn new(collector: Arc<ObjectCollector>) -> Self {
        Self { collector }
    }

    pub fn from_bool(&self, val: bool) -> Arc<Value> {
        Arc::new(Value::new_bool(val))
    }

    pub fn from_int(&self, val: i64, tag: TypeTag) -> Arc<Value> {
        Arc::new(Value::new_int(val, tag))
    }

    pub fn from_double(&self, val: f64, tag: TypeTag) -> Arc<Value> {
        Arc::new(Value::new_double(val, tag))
    }

    pub fn from_str(&self, val: &str, tag: TypeTag) -> Arc<Value> {
        Arc::new(Value::new_bytes(val.as_bytes(), tag))
    }

    pub fn from_bytes(&self, val: &[u8], tag: TypeTag) -> Arc<Value> {
        Arc::new(Value::new_bytes(val, tag))
    }

    /// Wrap an engine value, inferring its tag.
    ///
    /// The probe order is load-bearing: many engine objects answer yes to
    /// several predicates (every array is an object, every date is an
    /// object...), so specific types are tested before general ones.
    pub fn from_v8(&self, scope: &mut v8::HandleScope, val: v8::Local<v8::Value>) -> Arc<Value> {
        if val.is_null() {
            Arc::new(Value::new_unit(TypeTag::Null))
        } else if val.is_undefined() {
            Arc::new(Value::new_unit(TypeTag::Undefined))
        } else if val.is_function() {
            self.pin(scope, val, TypeTag::Function)
        } else if val.is_symbol() {
            self.pin(scope, val, TypeTag::Symbol)
        } else if val.is_promise() {
            self.pin(scope, val, TypeTag::Promise)
        } else if val.is_array() {
            self.pin(scope, val, TypeTag::Array)
        } else if val.is_int32() {
            let int = val.int32_value(scope).unwrap_or_default();
            self.from_int(i64::from(int), TypeTag::Integer)
        } else if val.is_big_int() {
            let int = v8::Local::<v8::BigInt>::try_from(val)
                .map(|bigint| bigint.i64_value().0)
                .unwrap_or_default();
            self.from_int(int, TypeTag::Integer)
        } else if val.is_number() {
            self.from_double(val.number_value(scope).unwrap_or(f64::NAN), TypeTag::Double)
        } else if val.is_boolean() {
            self.from_bool(val.is_true())
        } else if val.is_date() {
            let millis = v8::Local::<v8::Date>::try_from(val)
                .map(|date| date.value_of())
                .unwrap_or(f64::NAN);
            self.from_double(millis, TypeTag::Date)
        } else if val.is_string() {
            let text = val.to_rust_string_lossy(scope);
            self.from_bytes(text.as_bytes(), TypeTag::String)
        } else if val.is_array_buffer_view() {
            self.buffer_view(scope, val)
        } else if val.is_shared_array_buffer() {
            self.shared_buffer(scope, val)
        } else if val.is_array_buffer() {
            self.array_buffer(scope, val)
        } else if val.is_object() {
            self.pin(scope, val, TypeTag::Object)
        } else {
            Arc::new(Value::new_unit(TypeTag::Invalid))
        }
    }

    /// Summarize the exception caught by `tc` into a string value carrying
    /// an error tag.
    pub fn from_try_catch(
        &self,
        tc: &mut v8::TryCatch<v8::HandleScope>,
        tag: TypeTag,
    ) -> Arc<Value> {
        let summary = exception_summary(tc);
        self.from_str(&summary, tag)
    }

    fn pin(
        &self,
        scope: &mut v8::HandleScope,
        val: v8::Local<v8::Value>,
        tag: TypeTag,
    ) -> Arc<Value> {
        Arc::new(Value::new_pinned(scope, val, tag, self.collector.clone()))
    }

    fn buffer_view(&self, scope: &mut v8::HandleScope, val: v8::Local<v8::Value>) -> Arc<Value> {
        let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(val) else {
            return Arc::new(Value::new_unit(TypeTag::Invalid));
        };
        let Some(buffer) = view.buffer(scope) else {
            return Arc::new(Value::new_unit(TypeTag::Invalid));
        };
        Arc::new(Value::new_buffer(
            scope,
            val,
            TypeTag::ArrayBufferView,
            buffer.get_backing_store(),
            view.byte_offset(),
            view.byte_length(),
            self.collector.clone(),
        ))
    }

    fn shared_buffer(&self, scope: &mut v8::HandleScope, val: v8::Local<v8::Value>) -> Arc<Value> {
        let Ok(buffer) = v8::Local::<v8::SharedArrayBuffer>::try_from(val) else {
            return Arc::new(Value::new_unit(TypeTag::Invalid));
        };
        let backing_store = buffer.get_backing_store();
        let byte_length = backing_store.byte_length();
        Arc::new(Value::new_buffer(
            scope,
            val,
            TypeTag::SharedArrayBuffer,
            backing_store,
            0,
            byte_length,
            self.collector.clone(),
        ))
    }

    fn array_buffer(&self, scope: &mut v8::HandleScope, val: v8::Local<v8::Value>) -> Arc<Value> {
        let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(val) else {
            return Arc::new(Value::new_unit(TypeTag::Invalid));
        };
        let backing_store = buffer.get_backing_store();
        let byte_length = backing_store.byte_length();
        Arc::new(Value::new_buffer(
            scope,
            val,
            TypeTag::ArrayBuffer,
            backing_store,
            0,
            byte_length,
            self.collector.clone(),
        ))
    }
}

const STRING_CONVERSION_FAILED: &str = "<string conversion failed>";

fn utf8_or_fallback(
    scope: &mut v8::TryCatch<v8::HandleScope>,
    val: Option<v8::Local<v8::Value>>,
) -> String {
    val.and_then(|val| val.to_string(scope))
        .map(|string| string.to_rust_string_lossy(scope))
        .unwrap_or_else(|| STRING_CONVERSION_FAILED.to_string())
}

/// Render a caught exception the way `d8` prints uncaught errors:
/// `<resource>:<line>: <message>`, the offending source line, a caret
/// underline, and the stack trace when the engine provides one.
fn exception_summary(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    let mut out = String::new();

    let exception = tc.exception();
    let exception_string = utf8_or_fallback(tc, exception);

    match tc.message() {
        None => {
            // No extra information about this error; just the exception.
            out.push_str(&exception_string);
            out.push('\n');
        }
        Some(message) => {
            let wasm_function_index = message.get_wasm_function_index();
            if wasm_function_index >= 0 {
                // wasm-function[(function index)]:(offset): (message)
                let offset = message.get_start_column();
                out.push_str(&format!(
                    "wasm-function[{wasm_function_index}]:0x{offset:x}: {exception_string}\n"
                ));
            } else {
                // (filename):(line number): (message)
                let resource_name = message.get_script_resource_name(tc);
                let filename = utf8_or_fallback(tc, resource_name);
                let line = message
                    .get_line_number(tc)
                    .map_or(-1, |line| line as i64);
                out.push_str(&format!("{filename}:{line}: {exception_string}\n"));

                if let Some(source_line) = message.get_source_line(tc) {
                    out.push_str(&source_line.to_rust_string_lossy(tc));
                    out.push('\n');

                    // Caret underline. The end column can equal the start
                    // column at the last position; keep at least one caret.
                    let start = message.get_start_column();
                    let end = message.get_end_column().max(start + 1);
                    out.push_str(&" ".repeat(start));
                    out.push_str(&"^".repeat(end - start));
                    out.push('\n');
                }
            }
        }
    }

    if let Some(stack) = tc.stack_trace() {
        if stack.is_string() {
            let stack_string = utf8_or_fallback(tc, Some(stack));
            out.push('\n');
            out.push_str(&stack_string);
            out.push('\n');
        }
    }

    out
}
