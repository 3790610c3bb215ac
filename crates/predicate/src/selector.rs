//! Label selector matching over exact `matchLabels` pairs.

use std::collections::BTreeMap;

/// Compiled label selector. An empty selector matches every object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectorMatcher {
    labels: BTreeMap<String, String>,
}

impl SelectorMatcher {
    pub fn match_labels<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self { labels: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn match_labels_requires_all_pairs() {
        let m = SelectorMatcher::match_labels([("app.kubernetes.io/part-of", "acm"), ("tier", "a")]);
        assert!(m.matches(&labels(&[("app.kubernetes.io/part-of", "acm"), ("tier", "a"), ("x", "y")])));
        assert!(!m.matches(&labels(&[("app.kubernetes.io/part-of", "acm")])));
        assert!(!m.matches(&labels(&[])));
    }

    #[test]
    fn value_must_match_exactly() {
        let m = SelectorMatcher::match_labels([("app.kubernetes.io/part-of", "acm")]);
        assert!(!m.matches(&labels(&[("app.kubernetes.io/part-of", "acm-other")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let m = SelectorMatcher::default();
        assert!(m.matches(&labels(&[])));
        assert!(m.matches(&labels(&[("a", "b")])));
    }
}
