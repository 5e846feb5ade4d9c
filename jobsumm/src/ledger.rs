/// Categorized, de-duplicated error messages collected while summarizing a job.
///
/// Categories are free-form strings.  The summarizer uses "archive" for per-node failures, with
/// messages of the form "<node> <plugin> <message>"; callers may add their own categories.
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct ErrorLedger {
    errors: BTreeMap<String, BTreeSet<String>>,
}

impl ErrorLedger {
    pub fn new() -> ErrorLedger {
        Default::default()
    }

    /// Returns true if the message was not already present in the category.
    pub fn add(&mut self, category: &str, message: &str) -> bool {
        self.errors
            .entry(category.to_string())
            .or_default()
            .insert(message.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, category: &str) -> Option<&BTreeSet<String>> {
        self.errors.get(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.errors.keys().map(|k| k.as_str())
    }

    /// Object of category -> sorted array of messages.
    pub fn to_json(&self) -> Value {
        let mut m = serde_json::Map::new();
        for (category, msgs) in &self.errors {
            m.insert(
                category.clone(),
                Value::Array(msgs.iter().map(|s| Value::String(s.clone())).collect()),
            );
        }
        Value::Object(m)
    }
}

#[test]
fn test_ledger_dedup() {
    let mut l = ErrorLedger::new();
    assert!(l.is_empty());
    assert!(l.add("archive", "c1 network fetch failed"));
    assert!(!l.add("archive", "c1 network fetch failed"));
    assert!(l.add("archive", "c2 network fetch failed"));
    assert!(l.add("process", "boom"));
    assert!(l.get("archive").unwrap().len() == 2);
    assert!(l.categories().collect::<Vec<_>>() == vec!["archive", "process"]);
    let j = l.to_json();
    assert!(j["archive"][0] == "c1 network fetch failed");
    assert!(j["process"].as_array().unwrap().len() == 1);
}
