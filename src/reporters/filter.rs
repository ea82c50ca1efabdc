use std::collections::HashMap;

use parking_lot::Mutex;
use regex::Regex;

use crate::error::{ExportError, Result};
use crate::labels::LabelSet;
use crate::metrics::Sample;
use crate::registry::InstrumentId;

/// Characters that turn a pattern spec into a regular expression.
const REGEX_META_CHARS: &[char] = &[
    '.', '^', '$', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\',
];

/// Memoized verdicts are dropped wholesale past this size.
const CACHE_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseType {
    Include,
    Exclude,
}

#[derive(Debug)]
struct Clause<T> {
    kind: ClauseType,
    criterion: T,
}

/// Predicate deciding which samples a reporter emits.
///
/// Criteria are matched by instrument identity, by name pattern, or by a
/// `key=pattern;key2=pattern2` label spec. Any matching exclusion rejects.
/// Otherwise, when include clauses exist one of them must match; when none
/// exist, `default_accept` decides.
#[derive(Debug)]
pub struct InstanceFilter {
    instruments: Vec<Clause<InstrumentId>>,
    names: Vec<Clause<Regex>>,
    labels: Vec<Clause<Vec<(String, Regex)>>>,
    default_accept: bool,
    memo: Mutex<HashMap<String, bool>>,
}

impl Default for InstanceFilter {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            names: Vec::new(),
            labels: Vec::new(),
            default_accept: true,
            memo: Mutex::new(HashMap::new()),
        }
    }
}

impl InstanceFilter {
    /// Filter with no clauses; accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a filter from pattern specs, as found in configuration.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        specs
            .iter()
            .try_fold(Self::new(), |filter, spec| filter.add_pattern(spec.as_ref()))
    }

    pub fn add(mut self, instrument: InstrumentId) -> Self {
        self.instruments.push(Clause {
            kind: ClauseType::Include,
            criterion: instrument,
        });
        self
    }

    pub fn exclude(mut self, instrument: InstrumentId) -> Self {
        self.instruments.push(Clause {
            kind: ClauseType::Exclude,
            criterion: instrument,
        });
        self
    }

    /// Adds a name pattern or a label spec. A leading `!` or `-` makes it an
    /// exclusion; blank specs are ignored.
    pub fn add_pattern(mut self, spec: &str) -> Result<Self> {
        let mut body = spec.trim();
        let mut kind = ClauseType::Include;
        if let Some(rest) = body.strip_prefix('!').or_else(|| body.strip_prefix('-')) {
            kind = ClauseType::Exclude;
            body = rest.trim();
        }
        if body.is_empty() {
            return Ok(self);
        }

        if body.contains('=') {
            let patterns = parse_label_spec(spec, body)?;
            if !patterns.is_empty() {
                self.labels.push(Clause {
                    kind,
                    criterion: patterns,
                });
            }
        } else {
            self.names.push(Clause {
                kind,
                criterion: compile_smart(spec, body)?,
            });
        }
        Ok(self)
    }

    pub fn exclude_pattern(self, spec: &str) -> Result<Self> {
        self.add_pattern(&format!("!{spec}"))
    }

    /// Result when no include clause exists and nothing was excluded.
    pub fn default_accept(mut self, accept: bool) -> Self {
        self.default_accept = accept;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty() && self.names.is_empty() && self.labels.is_empty()
    }

    /// Matches a sample by its instrument, its `name` label (falling back to
    /// the sample name) and its labels.
    pub fn matches_sample(&self, sample: &Sample) -> bool {
        let labels = sample.labels();
        let name = labels.get("name").unwrap_or_else(|| sample.name());
        self.matches(Some(name), sample.instrument(), Some(labels))
    }

    pub fn matches_labels(&self, labels: &LabelSet) -> bool {
        self.matches(None, None, Some(labels))
    }

    pub fn matches(
        &self,
        name: Option<&str>,
        instrument: Option<InstrumentId>,
        labels: Option<&LabelSet>,
    ) -> bool {
        if self.is_empty() {
            return true;
        }

        let key = self.cache_key(name, instrument, labels);
        if let Some(&cached) = self.memo.lock().get(&key) {
            return cached;
        }

        let result = self.evaluate(name, instrument, labels);

        let mut memo = self.memo.lock();
        if memo.len() >= CACHE_LIMIT {
            memo.clear();
        }
        memo.insert(key, result);
        result
    }

    fn evaluate(
        &self,
        name: Option<&str>,
        instrument: Option<InstrumentId>,
        labels: Option<&LabelSet>,
    ) -> bool {
        let mut matched = Vec::new();

        if let Some(id) = instrument {
            matched.extend(
                self.instruments
                    .iter()
                    .filter(|c| c.criterion == id)
                    .map(|c| c.kind),
            );
        }
        if let Some(name) = name {
            matched.extend(
                self.names
                    .iter()
                    .filter(|c| full_match(&c.criterion, name))
                    .map(|c| c.kind),
            );
        }
        if let Some(labels) = labels {
            matched.extend(
                self.labels
                    .iter()
                    .filter(|c| matches_all(&c.criterion, labels))
                    .map(|c| c.kind),
            );
        }

        if matched.contains(&ClauseType::Exclude) {
            return false;
        }
        if self.has_include_clauses() {
            matched.contains(&ClauseType::Include)
        } else {
            self.default_accept
        }
    }

    fn has_include_clauses(&self) -> bool {
        self.instruments.iter().any(|c| c.kind == ClauseType::Include)
            || self.names.iter().any(|c| c.kind == ClauseType::Include)
            || self.labels.iter().any(|c| c.kind == ClauseType::Include)
    }

    fn cache_key(
        &self,
        name: Option<&str>,
        instrument: Option<InstrumentId>,
        labels: Option<&LabelSet>,
    ) -> String {
        let identity = name.unwrap_or("<anon>");
        let id = instrument.map(|i| i.to_string()).unwrap_or_default();
        let label_identity = match labels {
            _ if self.labels.is_empty() => "<labels-na>".to_owned(),
            Some(labels) => labels.linearize_as_metrics(),
            None => "<no-labels>".to_owned(),
        };
        format!("{identity}|{id}|{label_identity}")
    }
}

fn matches_all(patterns: &[(String, Regex)], labels: &LabelSet) -> bool {
    patterns
        .iter()
        .all(|(key, pattern)| labels.get(key).is_some_and(|v| full_match(pattern, v)))
}

/// Whole-string match, independent of how the pattern is anchored.
fn full_match(pattern: &Regex, value: &str) -> bool {
    pattern
        .find(value)
        .is_some_and(|m| m.start() == 0 && m.end() == value.len())
}

fn parse_label_spec(spec: &str, body: &str) -> Result<Vec<(String, Regex)>> {
    let mut patterns: Vec<(String, Regex)> = Vec::new();
    for segment in body.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((key, value)) = segment.split_once('=') else {
            return Err(invalid(
                spec,
                format!("label filter segment must be in key=value form: '{segment}'"),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid(
                spec,
                format!("label name may not be empty in filter segment '{segment}'"),
            ));
        }
        let value = value.trim();
        let compiled = compile_smart(spec, if value.is_empty() { ".*" } else { value })?;
        patterns.retain(|(k, _)| k != key);
        patterns.push((key.to_owned(), compiled));
    }
    Ok(patterns)
}

/// Literal text becomes an exact match; anything with a regex
/// metacharacter is compiled as a regular expression.
fn compile_smart(spec: &str, raw: &str) -> Result<Regex> {
    let trimmed = raw.trim();
    let source = if trimmed.is_empty() {
        ".*".to_owned()
    } else if trimmed.contains(REGEX_META_CHARS) {
        format!("^(?:{trimmed})$")
    } else {
        format!("^{}$", regex::escape(trimmed))
    };
    Regex::new(&source).map_err(|e| invalid(spec, e.to_string()))
}

fn invalid(spec: &str, reason: String) -> ExportError {
    ExportError::InvalidFilter {
        spec: spec.to_owned(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn literal_names_match_exactly() {
        let filter = InstanceFilter::new().add_pattern("foo").unwrap();
        assert!(filter.matches(Some("foo"), None, None));
        assert!(!filter.matches(Some("foobar"), None, None));
    }

    #[test]
    fn regex_names_match_whole_string() {
        let filter = InstanceFilter::new().add_pattern("foo.*").unwrap();
        assert!(filter.matches(Some("foo"), None, None));
        assert!(filter.matches(Some("foobar"), None, None));
        assert!(!filter.matches(Some("xfoo"), None, None));
    }

    #[test]
    fn label_specs_require_every_key() {
        let filter = InstanceFilter::new()
            .add_pattern("activity=read.*;region=us")
            .unwrap();
        assert!(filter.matches_labels(&labels(&[("activity", "read_1"), ("region", "us")])));
        assert!(!filter.matches_labels(&labels(&[("activity", "read_1")])));
        assert!(!filter.matches_labels(&labels(&[("activity", "write"), ("region", "us")])));
    }

    #[test]
    fn empty_label_value_matches_anything_present() {
        let filter = InstanceFilter::new().add_pattern("host=").unwrap();
        assert!(filter.matches_labels(&labels(&[("host", "h9")])));
        assert!(!filter.matches_labels(&labels(&[("zone", "z")])));
    }

    #[test]
    fn exclusions_win() {
        let filter = InstanceFilter::new()
            .add_pattern("ops.*")
            .unwrap()
            .add_pattern("!ops_errors")
            .unwrap();
        assert!(filter.matches(Some("ops_total"), None, None));
        assert!(!filter.matches(Some("ops_errors"), None, None));
        assert!(!filter.matches(Some("latency"), None, None));
    }

    #[test]
    fn exclusion_only_filters_default_to_accept() {
        let filter = InstanceFilter::new().add_pattern("-noise").unwrap();
        assert!(filter.matches(Some("signal"), None, None));
        assert!(!filter.matches(Some("noise"), None, None));

        let strict = InstanceFilter::new()
            .add_pattern("-noise")
            .unwrap()
            .default_accept(false);
        assert!(!strict.matches(Some("signal"), None, None));
    }

    #[test]
    fn instrument_identity_clauses() {
        let registry = crate::registry::Registry::new();
        let a = registry.counter("a", &LabelSet::empty(), "");
        let b = registry.counter("b", &LabelSet::empty(), "");
        let filter = InstanceFilter::new().add(a.id());
        assert!(filter.matches(None, Some(a.id()), None));
        assert!(!filter.matches(None, Some(b.id()), None));
    }

    #[test]
    fn malformed_specs_are_config_errors() {
        let err = InstanceFilter::new().add_pattern("a=b;c").unwrap_err();
        assert!(err.is_config());
        assert!(InstanceFilter::new().add_pattern("=x").is_err());
        assert!(InstanceFilter::new().add_pattern("(unclosed").is_err());
    }

    #[test]
    fn no_clauses_accept_everything() {
        let filter = InstanceFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(Some("anything"), None, None));
    }
}
