//! Activity registry - ids of child spans still in flight

use std::collections::BTreeSet;

/// Set of in-flight span ids
///
/// Backed by an ordered set so the fingerprint is independent of the order
/// in which activities were pushed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivityRegistry {
    ids: BTreeSet<String>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already present
    pub fn push(&mut self, span_id: &str) -> bool {
        self.ids.insert(span_id.to_string())
    }

    /// Returns false if the id was not present
    pub fn pop(&mut self, span_id: &str) -> bool {
        self.ids.remove(span_id)
    }

    pub fn contains(&self, span_id: &str) -> bool {
        self.ids.contains(span_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Sorted ids joined by `,`; empty string for an empty registry
    pub fn fingerprint(&self) -> String {
        self.ids.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }

    /// Sorted snapshot of the ids
    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut registry = ActivityRegistry::new();
        assert!(registry.push("a"));
        assert!(!registry.push("a"));
        assert!(registry.push("b"));
        assert_eq!(registry.len(), 2);

        assert!(registry.pop("a"));
        assert!(!registry.pop("a"));
        assert!(!registry.pop("missing"));
        assert_eq!(registry.ids(), vec!["b"]);
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let mut forward = ActivityRegistry::new();
        forward.push("a1");
        forward.push("b2");
        forward.push("c3");

        let mut backward = ActivityRegistry::new();
        backward.push("c3");
        backward.push("b2");
        backward.push("a1");

        assert_eq!(forward.fingerprint(), backward.fingerprint());
        assert_eq!(forward.fingerprint(), "a1,b2,c3");
    }

    #[test]
    fn test_empty_fingerprint() {
        let mut registry = ActivityRegistry::new();
        assert_eq!(registry.fingerprint(), "");
        registry.push("x");
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.fingerprint(), "");
    }

    #[test]
    fn test_size_tracks_adds_minus_removes() {
        let mut registry = ActivityRegistry::new();
        let ids: Vec<String> = (0..10).map(|i| format!("span-{}", i)).collect();
        for id in &ids {
            registry.push(id);
        }
        for id in ids.iter().step_by(3) {
            registry.pop(id);
        }
        assert_eq!(registry.len(), 10 - 4);
    }
}
