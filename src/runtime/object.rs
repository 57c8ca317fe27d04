//! Property access, array helpers, and function calls on captured objects.
//!
//! Everything here runs on the owner thread against values previously
//! pinned by the factory. Helpers that execute user JavaScript (splice,
//! push, call) run under a TryCatch and report throws as execute errors.

use std::sync::Arc;

use crate::runtime::factory::ValueFactory;
use crate::runtime::value::{TypeTag, Value};

#[derive(Clone)]
pub struct ObjectManipulator {
    factory: Arc<ValueFactory>,
}

impl ObjectManipulator {
    pub fn new(factory: Arc<ValueFactory>) -> Self {
        Self { factory }
    }

    pub fn identity_hash(&self, scope: &mut v8::HandleScope, obj: &Value) -> Arc<Value> {
        let obj_val = obj.to_v8(scope);
        let Ok(obj) = v8::Local::<v8::Object>::try_from(obj_val) else {
            return self.not_an_object();
        };
        self.factory
            .from_int(i64::from(obj.get_identity_hash().get()), TypeTag::Integer)
    }

    pub fn own_property_names(&self, scope: &mut v8::HandleScope, obj: &Value) -> Arc<Value> {
        let obj_val = obj.to_v8(scope);
        let Ok(obj) = v8::Local::<v8::Object>::try_from(obj_val) else {
            return self.not_an_object();
        };
        let Some(names) =
            obj.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
        else {
            return self
                .factory
                .from_str("could not enumerate properties", TypeTag::ExecuteException);
        };
        self.factory.from_v8(scope, names.into())
    }

    pub fn get(&self, scope: &mut v8::HandleScope, obj: &Value, key: &Value) -> Arc<Value> {
        let obj_val = obj.to_v8(scope);
        let Ok(obj) = v8::Local::<v8::Object>::try_from(obj_val) else {
            return self.not_an_object();
        };
        let key = key.to_v8(scope);

        if !obj.has(scope, key).unwrap_or(false) {
            return self.factory.from_str("No such key", TypeTag::KeyException);
        }
        match obj.get(scope, key) {
            Some(found) => self.factory.from_v8(scope, found),
            None => self
                .factory
                .from_str("could not read property", TypeTag::ExecuteException),
        }
    }

    pub fn set(
        &self,
        scope: &mut v8::HandleScope,
        obj: &Value,
        key: &Value,
        val: &Value,
    ) -> Arc<Value> {
        let tc = &mut v8::TryCatch::new(scope);
        let obj_val = obj.to_v8(tc);
        let Ok(obj) = v8::Local::<v8::Object>::try_from(obj_val) else {
            return self.not_an_object();
        };
        let key = key.to_v8(tc);
        let val = val.to_v8(tc);

        if obj.set(tc, key, val).is_none() {
            return self.factory.from_try_catch(tc, TypeTag::ExecuteException);
        }
        self.factory.from_bool(true)
    }

    pub fn del(&self, scope: &mut v8::HandleScope, obj: &Value, key: &Value) -> Arc<Value> {
        let obj_val = obj.to_v8(scope);
        let Ok(obj) = v8::Local::<v8::Object>::try_from(obj_val) else {
            return self.not_an_object();
        };
        let key = key.to_v8(scope);

        if !obj.has(scope, key).unwrap_or(false) {
            return self.factory.from_str("No such key", TypeTag::KeyException);
        }
        let deleted = obj.delete(scope, key).unwrap_or(false);
        self.factory.from_bool(deleted)
    }

    /// Call `obj.splice(start, delete_count, new_val?)`.
    ///
    /// `Array.prototype.splice` has no C++ counterpart in the engine API;
    /// the JS function is looked up on the object and invoked.
    pub fn splice(
        &self,
        scope: &mut v8::HandleScope,
        obj: &Value,
        start: i32,
        delete_count: i32,
        new_val: Option<&Value>,
    ) -> Arc<Value> {
        let mut argv = vec![
            v8::Integer::new(scope, start).into(),
            v8::Integer::new(scope, delete_count).into(),
        ];
        if let Some(new_val) = new_val {
            argv.push(new_val.to_v8(scope));
        }
        self.call_array_helper(scope, obj, "splice", argv)
    }

    /// Call `obj.push(new_val)` through the JS function on the object.
    pub fn push(&self, scope: &mut v8::HandleScope, obj: &Value, new_val: &Value) -> Arc<Value> {
        let argv = vec![new_val.to_v8(scope)];
        self.call_array_helper(scope, obj, "push", argv)
    }

    fn call_array_helper<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        obj: &Value,
        method: &str,
        argv: Vec<v8::Local<'s, v8::Value>>,
    ) -> Arc<Value> {
        let obj_val = obj.to_v8(scope);
        let Ok(obj) = v8::Local::<v8::Object>::try_from(obj_val) else {
            return self.not_an_object();
        };

        let Some(method_name) = v8::String::new(scope, method) else {
            return self
                .factory
                .from_str("", TypeTag::OomException);
        };
        let Some(method_val) = obj.get(scope, method_name.into()) else {
            return self.factory.from_str(
                &format!("no {method} method on object"),
                TypeTag::ExecuteException,
            );
        };
        let Ok(function) = v8::Local::<v8::Function>::try_from(method_val) else {
            return self.factory.from_str(
                &format!("{method} member is not a function"),
                TypeTag::ExecuteException,
            );
        };

        let tc = &mut v8::TryCatch::new(scope);
        match function.call(tc, obj.into(), &argv) {
            Some(result) => self.factory.from_v8(tc, result),
            None => self.factory.from_try_catch(tc, TypeTag::ExecuteException),
        }
    }

    /// Call `func` with `this` (or `undefined`) and the elements of the
    /// `argv` array.
    pub fn call(
        &self,
        scope: &mut v8::HandleScope,
        func: &Value,
        this: Option<&Value>,
        argv: &Value,
    ) -> Arc<Value> {
        let func_val = func.to_v8(scope);
        let Ok(function) = v8::Local::<v8::Function>::try_from(func_val) else {
            return self
                .factory
                .from_str("function is not callable", TypeTag::ValueException);
        };

        let this_val = match this {
            Some(this) => this.to_v8(scope),
            None => v8::undefined(scope).into(),
        };

        let argv_val = argv.to_v8(scope);
        let Ok(argv_array) = v8::Local::<v8::Array>::try_from(argv_val) else {
            return self
                .factory
                .from_str("argv is not an array", TypeTag::ValueException);
        };

        let mut args = Vec::with_capacity(argv_array.length() as usize);
        for index in 0..argv_array.length() {
            let element = argv_array
                .get_index(scope, index)
                .unwrap_or_else(|| v8::undefined(scope).into());
            args.push(element);
        }

        let tc = &mut v8::TryCatch::new(scope);
        match function.call(tc, this_val, &args) {
            Some(result) => self.factory.from_v8(tc, result),
            None => self.factory.from_try_catch(tc, TypeTag::ExecuteException),
        }
    }

    fn not_an_object(&self) -> Arc<Value> {
        self.factory
            .from_str("not an object", TypeTag::ValueException)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::collector::ObjectCollector;
    use crate::runtime::isolate::IsolateManager;
    use crate::runtime::test_util;

    struct Harness {
        isolate: Arc<IsolateManager>,
        factory: Arc<ValueFactory>,
        manipulator: ObjectManipulator,
    }

    fn harness() -> Harness {
        test_util::init_v8();
        let isolate = Arc::new(IsolateManager::new().expect("isolate"));
        let collector = Arc::new(ObjectCollector::new(isolate.clone()));
        let factory = Arc::new(ValueFactory::new(collector));
        let manipulator = ObjectManipulator::new(factory.clone());
        Harness {
            isolate,
            factory,
            manipulator,
        }
    }

    fn eval(harness: &Harness, code: &'static str) -> Arc<Value> {
        let factory = harness.factory.clone();
        harness
            .isolate
            .submit(move |scope| {
                let source = v8::String::new(scope, code).expect("source");
                let script = v8::Script::compile(scope, source, None).expect("compiles");
                let result = script.run(scope).expect("runs");
                factory.from_v8(scope, result)
            })
            .blocking_recv()
            .expect("owner thread alive")
    }

    fn on_owner<R>(
        harness: &Harness,
        f: impl FnOnce(&mut v8::HandleScope, &ObjectManipulator) -> R + Send + 'static,
    ) -> R
    where
        R: Send + 'static,
    {
        let manipulator = harness.manipulator.clone();
        harness
            .isolate
            .submit(move |scope| f(scope, &manipulator))
            .blocking_recv()
            .expect("owner thread alive")
    }

    #[test]
    fn test_get_existing_and_missing_key() {
        let harness = harness();
        let obj = eval(&harness, "({a: 1, b: 2})");
        let key_a = harness.factory.from_str("a", TypeTag::String);
        let key_c = harness.factory.from_str("c", TypeTag::String);

        let obj2 = obj.clone();
        let found = on_owner(&harness, move |scope, m| m.get(scope, &obj2, &key_a));
        assert_eq!(found.tag(), TypeTag::Integer);
        assert_eq!(found.int_val(), 1);

        let missing = on_owner(&harness, move |scope, m| m.get(scope, &obj, &key_c));
        assert_eq!(missing.tag(), TypeTag::KeyException);
        assert_eq!(missing.utf8_bytes(), Some("No such key".as_bytes()));
    }

    #[test]
    fn test_set_then_get() {
        let harness = harness();
        let obj = eval(&harness, "({})");
        let key = harness.factory.from_str("answer", TypeTag::String);
        let val = harness.factory.from_int(42, TypeTag::Integer);

        let (obj2, key2) = (obj.clone(), key.clone());
        let set_result = on_owner(&harness, move |scope, m| m.set(scope, &obj2, &key2, &val));
        assert_eq!(set_result.tag(), TypeTag::Bool);
        assert_eq!(set_result.int_val(), 1);

        let found = on_owner(&harness, move |scope, m| m.get(scope, &obj, &key));
        assert_eq!(found.int_val(), 42);
    }

    #[test]
    fn test_del_missing_and_existing() {
        let harness = harness();
        let obj = eval(&harness, "({gone: true})");
        let key = harness.factory.from_str("gone", TypeTag::String);
        let other = harness.factory.from_str("other", TypeTag::String);

        let (obj2, key2) = (obj.clone(), key.clone());
        let missing = on_owner(&harness, move |scope, m| m.del(scope, &obj2, &other));
        assert_eq!(missing.tag(), TypeTag::KeyException);

        let deleted = on_owner(&harness, move |scope, m| m.del(scope, &obj, &key2));
        assert_eq!(deleted.tag(), TypeTag::Bool);
        assert_eq!(deleted.int_val(), 1);
    }

    #[test]
    fn test_identity_hash_is_stable() {
        let harness = harness();
        let obj = eval(&harness, "({})");

        let obj2 = obj.clone();
        let first = on_owner(&harness, move |scope, m| m.identity_hash(scope, &obj2));
        let second = on_owner(&harness, move |scope, m| m.identity_hash(scope, &obj));
        assert_eq!(first.tag(), TypeTag::Integer);
        assert_eq!(first.int_val(), second.int_val());
    }

    #[test]
    fn test_own_property_names() {
        let harness = harness();
        let obj = eval(&harness, "({x: 1, y: 2})");
        let names = on_owner(&harness, move |scope, m| m.own_property_names(scope, &obj));
        assert_eq!(names.tag(), TypeTag::Array);
    }

    #[test]
    fn test_splice_removes_and_inserts() {
        let harness = harness();
        let arr = eval(&harness, "globalThis.arr = [10, 20, 30]; arr");
        let replacement = harness.factory.from_int(99, TypeTag::Integer);

        let removed = on_owner(&harness, move |scope, m| {
            m.splice(scope, &arr, 1, 1, Some(&replacement))
        });
        assert_eq!(removed.tag(), TypeTag::Array);

        let json = eval(&harness, "JSON.stringify(arr)");
        assert_eq!(json.utf8_bytes(), Some("[10,99,30]".as_bytes()));
    }

    #[test]
    fn test_splice_on_plain_object_fails() {
        let harness = harness();
        let obj = eval(&harness, "({})");
        let result = on_owner(&harness, move |scope, m| m.splice(scope, &obj, 0, 0, None));
        assert_eq!(result.tag(), TypeTag::ExecuteException);
        assert_eq!(
            result.utf8_bytes(),
            Some("splice member is not a function".as_bytes())
        );
    }

    #[test]
    fn test_push_appends() {
        let harness = harness();
        let arr = eval(&harness, "globalThis.parr = [1]; parr");
        let val = harness.factory.from_int(2, TypeTag::Integer);

        let new_len = on_owner(&harness, move |scope, m| m.push(scope, &arr, &val));
        assert_eq!(new_len.tag(), TypeTag::Integer);
        assert_eq!(new_len.int_val(), 2);

        let json = eval(&harness, "JSON.stringify(parr)");
        assert_eq!(json.utf8_bytes(), Some("[1,2]".as_bytes()));
    }

    #[test]
    fn test_call_function_with_args() {
        let harness = harness();
        let func = eval(&harness, "(function add(a, b) { return a + b; })");
        let argv = eval(&harness, "[20, 22]");

        let result = on_owner(&harness, move |scope, m| {
            m.call(scope, &func, None, &argv)
        });
        assert_eq!(result.tag(), TypeTag::Integer);
        assert_eq!(result.int_val(), 42);
    }

    #[test]
    fn test_call_rejects_bad_shapes() {
        let harness = harness();
        let not_fn = eval(&harness, "({})");
        let argv = eval(&harness, "[]");
        let func = eval(&harness, "(function noop() {})");
        let not_argv = eval(&harness, "({})");

        let argv2 = argv.clone();
        let bad_func = on_owner(&harness, move |scope, m| {
            m.call(scope, &not_fn, None, &argv2)
        });
        assert_eq!(bad_func.tag(), TypeTag::ValueException);
        assert_eq!(
            bad_func.utf8_bytes(),
            Some("function is not callable".as_bytes())
        );

        let bad_argv = on_owner(&harness, move |scope, m| {
            m.call(scope, &func, None, &not_argv)
        });
        assert_eq!(bad_argv.tag(), TypeTag::ValueException);
        assert_eq!(bad_argv.utf8_bytes(), Some("argv is not an array".as_bytes()));
    }

    #[test]
    fn test_call_throw_summarized() {
        let harness = harness();
        let func = eval(&harness, "(function boom() { throw new Error('kaput'); })");
        let argv = eval(&harness, "[]");

        let result = on_owner(&harness, move |scope, m| m.call(scope, &func, None, &argv));
        assert_eq!(result.tag(), TypeTag::ExecuteException);
        let text = String::from_utf8_lossy(result.utf8_bytes().unwrap()).into_owned();
        assert!(text.contains("kaput"), "{text}");
    }
}
