use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label keys that describe the instrument itself rather than a dimension.
pub const RESERVED_KEYS: [&str; 2] = ["name", "unit"];

/// Immutable set of string dimensions identifying one time series.
///
/// Keys are kept sorted, so equality and hashing follow the canonical
/// `{k=v,...}` form regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet {
    labels: BTreeMap<String, String>,
}

impl LabelSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Returns a copy with `key` set to `value`.
    pub fn and(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = self.labels.clone();
        labels.insert(key.into(), value.into());
        Self { labels }
    }

    /// Returns a copy with all of `other`'s labels layered on top.
    pub fn and_all(&self, other: &LabelSet) -> Self {
        let mut labels = self.labels.clone();
        labels.extend(other.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { labels }
    }

    pub fn without(&self, keys: &[&str]) -> Self {
        Self {
            labels: self
                .labels
                .iter()
                .filter(|(k, _)| !keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Labels with the reserved `name` and `unit` keys removed.
    pub fn dimensions(&self) -> Self {
        self.without(&RESERVED_KEYS)
    }

    /// Labels present in `self` that are absent from, or differ in, `other`.
    pub fn difference(&self, other: &LabelSet) -> Self {
        Self {
            labels: self
                .labels
                .iter()
                .filter(|(k, v)| other.labels.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Labels whose key and value agree in both sets.
    pub fn intersection(&self, other: &LabelSet) -> Self {
        Self {
            labels: self
                .labels
                .iter()
                .filter(|(k, v)| other.labels.get(*k) == Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// True when every label of `self` appears, with the same value, in `other`.
    pub fn is_subset_of(&self, other: &LabelSet) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| other.labels.get(k) == Some(v))
    }

    /// Canonical identity string: `{k=v,...}` with sorted keys, `{}` when empty.
    pub fn canonical(&self) -> String {
        let body = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{body}}}")
    }

    /// Metrics-style rendering: `{k="v",...}` with sorted keys, `{}` when empty.
    pub fn linearize_as_metrics(&self) -> String {
        let body = self
            .labels
            .iter()
            .map(|(k, v)| format!(r#"{k}="{v}""#))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{body}}}")
    }

    /// Flattens the labels into a file-system friendly token.
    ///
    /// Values of `barewords` come first (in the given order) joined by `__`;
    /// every remaining key follows, sorted, as `_key_value`.
    pub fn linearize_bare(&self, barewords: &[&str]) -> String {
        let mut parts: Vec<String> = barewords
            .iter()
            .filter_map(|word| self.labels.get(*word).cloned())
            .collect();
        parts.extend(
            self.labels
                .iter()
                .filter(|(k, _)| !barewords.contains(&k.as_str()))
                .map(|(k, v)| format!("_{k}_{v}")),
        );
        parts.join("__")
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.linearize_as_metrics())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}
