/*
    labels.rs - Label sets attached to address references

    A label set is unordered and deduplicated. Only presence or absence of a
    label is observable; iteration order is an implementation detail.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unordered, deduplicated set of free-form labels
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    pub fn new() -> Self {
        LabelSet(BTreeSet::new())
    }

    /// Add a label, returning false if it was already present
    pub fn add(&mut self, label: impl Into<String>) -> bool {
        self.0.insert(label.into())
    }

    /// Remove a label, returning false if it was absent
    pub fn remove(&mut self, label: &str) -> bool {
        self.0.remove(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        LabelSet(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> From<Vec<S>> for LabelSet {
    fn from(labels: Vec<S>) -> Self {
        labels.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_labels_deduplicate() {
        let mut labels = LabelSet::from(vec!["team:core", "deprecated", "team:core"]);
        assert_eq!(labels.len(), 2);
        assert!(!labels.add("deprecated"));
        assert!(labels.add("audited"));
        assert!(labels.contains("audited"));
    }

    #[test]
    fn test_labels_serialize_as_array() {
        let labels = LabelSet::from(vec!["b", "a"]);
        let json = serde_json::to_value(&labels).unwrap();
        assert!(json.is_array());
        assert_eq!(json.as_array().unwrap().len(), 2);

        let back: LabelSet = serde_json::from_value(serde_json::json!(["a", "a", "b"])).unwrap();
        assert_eq!(back, labels);
    }

    proptest! {
        #[test]
        fn prop_label_set_ignores_insertion_order(mut labels in proptest::collection::vec("[a-z]{1,6}", 0..12)) {
            let forward: LabelSet = labels.iter().cloned().collect();
            labels.reverse();
            let backward: LabelSet = labels.iter().cloned().collect();
            prop_assert_eq!(forward, backward);
        }
    }
}
