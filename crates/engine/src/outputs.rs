//! Output store — per-run record of every check's latest output, scoped
//! outputs for forEach children, and the full history across loops.

use std::collections::HashMap;

use parking_lot::RwLock;

use visor_domain::review::{OutputValue, ReviewSummary};
use visor_domain::scope::Scope;

#[derive(Default)]
pub struct OutputStore {
    /// (check, scope) → latest summary in that scope.
    scoped: RwLock<HashMap<(String, Scope), ReviewSummary>>,
    /// check → latest summary anywhere (last writer wins).
    latest: RwLock<HashMap<String, ReviewSummary>>,
    /// check → every summary across all loops, in completion order.
    history: RwLock<HashMap<String, Vec<ReviewSummary>>>,
    /// forEach producers: the aggregate array before fan-out.
    raw: RwLock<HashMap<String, serde_json::Value>>,
    /// Oldest entries are dropped past this many per check.
    history_cap: Option<usize>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_cap(cap: Option<usize>) -> Self {
        Self {
            history_cap: cap,
            ..Default::default()
        }
    }

    /// Commit one execution's output: set the scoped latest and append
    /// to the check's history.
    pub fn put(&self, check: &str, scope: &Scope, summary: ReviewSummary) {
        self.scoped
            .write()
            .insert((check.to_string(), scope.clone()), summary.clone());
        self.latest
            .write()
            .insert(check.to_string(), summary.clone());
        let mut history = self.history.write();
        let entries = history.entry(check.to_string()).or_default();
        entries.push(summary);
        if let Some(cap) = self.history_cap {
            if entries.len() > cap {
                let excess = entries.len() - cap;
                entries.drain(..excess);
            }
        }
    }

    /// Bind a value into one scope without touching history or the
    /// last-writer view. Used to expose a fan-out item to a child scope.
    pub fn scoped_bind(&self, check: &str, scope: &Scope, summary: ReviewSummary) {
        self.scoped
            .write()
            .insert((check.to_string(), scope.clone()), summary);
    }

    /// The value visible from `scope`: the scope's own entry, else the
    /// nearest ancestor scope's, else the last writer anywhere.
    pub fn get(&self, check: &str, scope: &Scope) -> Option<ReviewSummary> {
        {
            let scoped = self.scoped.read();
            let mut cursor = Some(scope.clone());
            while let Some(s) = cursor {
                if let Some(summary) = scoped.get(&(check.to_string(), s.clone())) {
                    return Some(summary.clone());
                }
                cursor = s.parent();
            }
        }
        self.get_latest(check)
    }

    /// Last-writer-wins view across all scopes.
    pub fn get_latest(&self, check: &str) -> Option<ReviewSummary> {
        self.latest.read().get(check).cloned()
    }

    /// The aggregate pre-fan-out array for a forEach producer; for other
    /// checks, identical to `get_latest`.
    pub fn raw(&self, check: &str) -> Option<serde_json::Value> {
        if let Some(value) = self.raw.read().get(check) {
            return Some(value.clone());
        }
        self.get_latest(check)
            .and_then(|s| s.output)
            .and_then(|o| o.as_parsed().or_else(|| Some(serde_json::Value::String(o.as_str().into_owned()))))
    }

    pub fn set_raw(&self, check: &str, value: serde_json::Value) {
        self.raw.write().insert(check.to_string(), value);
    }

    /// Ordered history across all loops.
    pub fn history(&self, check: &str) -> Vec<ReviewSummary> {
        self.history.read().get(check).cloned().unwrap_or_default()
    }

    pub fn all_histories(&self) -> HashMap<String, Vec<ReviewSummary>> {
        self.history.read().clone()
    }

    /// Checks that have committed at least one output.
    pub fn completed_checks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.latest.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// True when a check has any terminal record in or above `scope`.
    pub fn has_output(&self, check: &str, scope: &Scope) -> bool {
        self.get(check, scope).is_some()
    }

    /// Raw producer text for string coercion in templates.
    pub fn raw_text(&self, check: &str, scope: &Scope) -> Option<String> {
        match self.get(check, scope)?.output? {
            OutputValue::Text(text) => Some(text),
            OutputValue::Json(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary(value: serde_json::Value) -> ReviewSummary {
        ReviewSummary::with_output(value)
    }

    #[test]
    fn put_get_latest() {
        let store = OutputStore::new();
        let root = Scope::root();
        store.put("a", &root, summary(json!(1)));
        store.put("a", &root, summary(json!(2)));

        assert_eq!(
            store.get("a", &root).unwrap().output,
            Some(OutputValue::Json(json!(2)))
        );
        assert_eq!(store.history("a").len(), 2);
    }

    #[test]
    fn scoped_reads_fall_back_to_parent() {
        let store = OutputStore::new();
        let root = Scope::root();
        let child = root.child("items", 0);
        store.put("setup", &root, summary(json!("base")));

        // Child scope sees the root value...
        assert_eq!(
            store.get("setup", &child).unwrap().output,
            Some(OutputValue::Json(json!("base")))
        );

        // ...until the child gets its own.
        store.put("setup", &child, summary(json!("override")));
        assert_eq!(
            store.get("setup", &child).unwrap().output,
            Some(OutputValue::Json(json!("override")))
        );
        // Root unchanged.
        assert_eq!(
            store.get("setup", &root).unwrap().output,
            Some(OutputValue::Json(json!("base")))
        );
    }

    #[test]
    fn scope_isolation_between_siblings() {
        let store = OutputStore::new();
        let root = Scope::root();
        let c0 = root.child("p", 0);
        let c1 = root.child("p", 1);
        store.put("dep", &c0, summary(json!("zero")));
        store.put("dep", &c1, summary(json!("one")));

        assert_eq!(
            store.get("dep", &c0).unwrap().output,
            Some(OutputValue::Json(json!("zero")))
        );
        assert_eq!(
            store.get("dep", &c1).unwrap().output,
            Some(OutputValue::Json(json!("one")))
        );
    }

    #[test]
    fn raw_alias_prefers_aggregate() {
        let store = OutputStore::new();
        let root = Scope::root();
        store.put("p", &root, summary(json!({"id": 3})));
        store.set_raw("p", json!([{"id": 1}, {"id": 2}, {"id": 3}]));

        assert_eq!(store.raw("p").unwrap(), json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        // Non-forEach checks fall back to the latest output.
        store.put("plain", &root, summary(json!({"x": 1})));
        assert_eq!(store.raw("plain").unwrap(), json!({"x": 1}));
    }

    #[test]
    fn history_appends_in_completion_order() {
        let store = OutputStore::new();
        let root = Scope::root();
        for i in 0..3 {
            store.put("c", &root.child("p", i), summary(json!(i)));
        }
        let history = store.history("c");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].output, Some(OutputValue::Json(json!(0))));
        assert_eq!(history[2].output, Some(OutputValue::Json(json!(2))));
    }

    #[test]
    fn raw_text_only_for_text_outputs() {
        let store = OutputStore::new();
        let root = Scope::root();
        store.put("t", &root, summary(json!({"k": 1})));
        assert!(store.raw_text("t", &root).is_none());

        store.put(
            "text",
            &root,
            ReviewSummary::with_output("plain output".to_string()),
        );
        assert_eq!(store.raw_text("text", &root).unwrap(), "plain output");
    }

    #[test]
    fn history_cap_drops_oldest() {
        let store = OutputStore::with_history_cap(Some(2));
        let root = Scope::root();
        for i in 0..5 {
            store.put("c", &root, summary(json!(i)));
        }
        let history = store.history("c");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].output, Some(OutputValue::Json(json!(3))));
        assert_eq!(history[1].output, Some(OutputValue::Json(json!(4))));
    }

    #[test]
    fn completed_checks_sorted() {
        let store = OutputStore::new();
        let root = Scope::root();
        store.put("zeta", &root, summary(json!(1)));
        store.put("alpha", &root, summary(json!(2)));
        assert_eq!(store.completed_checks(), vec!["alpha", "zeta"]);
    }
}
