//! Report fun facts about the isolate heap.

use std::sync::Arc;

use crate::runtime::factory::ValueFactory;
use crate::runtime::value::{TypeTag, Value};

#[derive(Clone)]
pub struct HeapReporter {
    factory: Arc<ValueFactory>,
}

impl HeapReporter {
    pub fn new(factory: Arc<ValueFactory>) -> Self {
        Self { factory }
    }

    /// Headline heap statistics as a JSON document in a string value.
    pub fn heap_stats(&self, scope: &mut v8::HandleScope) -> Arc<Value> {
        let mut stats = v8::HeapStatistics::default();
        scope.get_heap_statistics(&mut stats);

        let doc = serde_json::json!({
            "total_physical_size": stats.total_physical_size(),
            "total_heap_size_executable": stats.total_heap_size_executable(),
            "total_heap_size": stats.total_heap_size(),
            "used_heap_size": stats.used_heap_size(),
            "heap_size_limit": stats.heap_size_limit(),
        });
        self.factory.from_str(&doc.to_string(), TypeTag::String)
    }

    /// Full heap snapshot, serialized to its UTF-8 wire format.
    pub fn heap_snapshot(&self, scope: &mut v8::HandleScope) -> Arc<Value> {
        let mut buf: Vec<u8> = Vec::new();
        scope.take_heap_snapshot(|chunk| {
            buf.extend_from_slice(chunk);
            true
        });
        self.factory.from_bytes(&buf, TypeTag::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::collector::ObjectCollector;
    use crate::runtime::isolate::IsolateManager;
    use crate::runtime::test_util;

    fn harness() -> (Arc<IsolateManager>, HeapReporter) {
        test_util::init_v8();
        let isolate = Arc::new(IsolateManager::new().expect("isolate"));
        let collector = Arc::new(ObjectCollector::new(isolate.clone()));
        let factory = Arc::new(ValueFactory::new(collector));
        (isolate, HeapReporter::new(factory))
    }

    #[test]
    fn test_heap_stats_is_json_with_expected_fields() {
        let (isolate, reporter) = harness();
        let stats = isolate
            .submit(move |scope| reporter.heap_stats(scope))
            .blocking_recv()
            .expect("owner thread alive");

        assert_eq!(stats.tag(), TypeTag::String);
        let doc: serde_json::Value =
            serde_json::from_slice(stats.utf8_bytes().unwrap()).expect("valid JSON");
        for field in [
            "total_physical_size",
            "total_heap_size_executable",
            "total_heap_size",
            "used_heap_size",
            "heap_size_limit",
        ] {
            assert!(doc.get(field).is_some(), "missing {field}");
        }
        assert!(doc["used_heap_size"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_heap_snapshot_is_nonempty_json() {
        let (isolate, reporter) = harness();
        let snapshot = isolate
            .submit(move |scope| reporter.heap_snapshot(scope))
            .blocking_recv()
            .expect("owner thread alive");

        assert_eq!(snapshot.tag(), TypeTag::String);
        let bytes = snapshot.utf8_bytes().unwrap();
        assert!(!bytes.is_empty());
        // The snapshot format is a JSON document starting with "snapshot".
        assert!(bytes.starts_with(b"{\"snapshot\""));
    }
}
