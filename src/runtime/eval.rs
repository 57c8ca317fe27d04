//! Parse and run arbitrary scripts within the isolate.

use std::sync::Arc;

use crate::runtime::factory::ValueFactory;
use crate::runtime::memory::MemoryState;
use crate::runtime::value::{TypeTag, Value};

#[derive(Clone)]
pub struct CodeEvaluator {
    factory: Arc<ValueFactory>,
    memory: Arc<MemoryState>,
}

impl CodeEvaluator {
    pub fn new(factory: Arc<ValueFactory>, memory: Arc<MemoryState>) -> Self {
        Self { factory, memory }
    }

    /// Compile and run `code` on the owner thread.
    ///
    /// Never raises: compile failures, thrown exceptions, terminations and
    /// memory-limit hits all come back as values with error tags.
    pub fn eval(&self, scope: &mut v8::HandleScope, code: &Value) -> Arc<Value> {
        let tc = &mut v8::TryCatch::new(scope);

        let code_val = code.to_v8(tc);
        if !code_val.is_string() {
            return self
                .factory
                .from_str("code is not a string", TypeTag::ValueException);
        }
        let Ok(source) = v8::Local::<v8::String>::try_from(code_val) else {
            return self
                .factory
                .from_str("code is not a string", TypeTag::ValueException);
        };

        // Provide a name just for exception messages.
        let Some(resource_name) = v8::String::new(tc, "<anonymous>") else {
            return self
                .factory
                .from_str("", TypeTag::OomException);
        };
        let origin = v8::ScriptOrigin::new(
            tc,
            resource_name.into(),
            0,
            0,
            false,
            0,
            None,
            false,
            false,
            false,
            None,
        );

        let Some(script) = v8::Script::compile(tc, source, Some(&origin)) else {
            return self.factory.from_try_catch(tc, TypeTag::ParseException);
        };

        if let Some(result) = script.run(tc) {
            return self.factory.from_v8(tc, result);
        }

        // Didn't execute. Find an error: a termination that coincides with
        // the hard memory limit is an OOM, any other termination is a
        // cancellation, the rest are ordinary throws.
        if self.memory.is_hard_reached() {
            return self.factory.from_str("", TypeTag::OomException);
        }
        let tag = if tc.has_terminated() {
            TypeTag::TerminatedException
        } else {
            TypeTag::ExecuteException
        };
        self.factory.from_try_catch(tc, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::collector::ObjectCollector;
    use crate::runtime::isolate::IsolateManager;
    use crate::runtime::memory::MemoryMonitor;
    use crate::runtime::test_util;
    use crate::runtime::value::Value;

    struct Harness {
        evaluator: CodeEvaluator,
        factory: Arc<ValueFactory>,
        _monitor: MemoryMonitor,
        isolate: Arc<IsolateManager>,
    }

    fn harness() -> Harness {
        test_util::init_v8();
        let isolate = Arc::new(IsolateManager::new().expect("isolate"));
        let collector = Arc::new(ObjectCollector::new(isolate.clone()));
        let factory = Arc::new(ValueFactory::new(collector));
        let monitor = MemoryMonitor::new(isolate.clone());
        let evaluator = CodeEvaluator::new(factory.clone(), monitor.state());
        Harness {
            evaluator,
            factory,
            _monitor: monitor,
            isolate,
        }
    }

    fn eval(harness: &Harness, code: &str) -> Arc<Value> {
        let code = harness.factory.from_str(code, TypeTag::String);
        let evaluator = harness.evaluator.clone();
        harness
            .isolate
            .submit(move |scope| evaluator.eval(scope, &code))
            .blocking_recv()
            .expect("owner thread alive")
    }

    #[test]
    fn test_eval_arithmetic() {
        let harness = harness();
        let result = eval(&harness, "1 + 2");
        assert_eq!(result.tag(), TypeTag::Integer);
        assert_eq!(result.int_val(), 3);
    }

    #[test]
    fn test_eval_global_state_persists() {
        let harness = harness();
        eval(&harness, "var counter = 40");
        let result = eval(&harness, "counter + 2");
        assert_eq!(result.int_val(), 42);
    }

    #[test]
    fn test_eval_non_string_code() {
        let harness = harness();
        let code = harness.factory.from_int(3, TypeTag::Integer);
        let evaluator = harness.evaluator.clone();
        let result = harness
            .isolate
            .submit(move |scope| evaluator.eval(scope, &code))
            .blocking_recv()
            .expect("owner thread alive");

        assert_eq!(result.tag(), TypeTag::ValueException);
        assert_eq!(result.utf8_bytes(), Some("code is not a string".as_bytes()));
    }

    #[test]
    fn test_eval_syntax_error_is_parse_exception() {
        let harness = harness();
        let result = eval(&harness, "this is not javascript");
        assert_eq!(result.tag(), TypeTag::ParseException);
        let text = String::from_utf8_lossy(result.utf8_bytes().unwrap()).into_owned();
        assert!(text.contains("SyntaxError"), "{text}");
    }

    #[test]
    fn test_eval_throw_is_execute_exception() {
        let harness = harness();
        let result = eval(&harness, "throw new Error('boom')");
        assert_eq!(result.tag(), TypeTag::ExecuteException);
        let text = String::from_utf8_lossy(result.utf8_bytes().unwrap()).into_owned();
        assert!(text.contains("boom"), "{text}");
        assert!(text.contains("at <anonymous>"), "{text}");
    }

    #[test]
    fn test_hard_limit_termination_maps_to_oom() {
        let harness = harness();
        harness._monitor.set_hard_limit(16 * 1024 * 1024);

        let result = eval(
            &harness,
            "let hog = []; while (true) hog.push(new Array(1000000).fill(0));",
        );
        assert_eq!(result.tag(), TypeTag::OomException);
        assert!(harness._monitor.is_hard_reached());
        assert!(result.is_empty());
    }
}
