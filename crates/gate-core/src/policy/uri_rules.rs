//! URI rule matching.
//!
//! Rules are compiled once when a snapshot is installed, so the per-request
//! cost is a linear walk over prepared matchers. Regex rules are
//! case-insensitive; prefix and exact rules compare bytes as-is.

use super::snapshot::{MatchType, UriRule};
use tracing::warn;

enum Matcher {
    Regex(regex::Regex),
    Prefix(String),
    Exact(String),
}

struct Compiled {
    rule: UriRule,
    matcher: Matcher,
}

/// An ordered, pre-compiled rule list. First match wins.
#[derive(Default)]
pub struct UriRuleSet {
    rules: Vec<Compiled>,
}

impl UriRuleSet {
    /// Compiles a rule list. Rules with invalid regex patterns are logged
    /// and dropped rather than failing the whole snapshot.
    #[must_use]
    pub fn compile(rules: &[UriRule]) -> Self {
        let compiled = rules
            .iter()
            .filter_map(|rule| {
                let matcher = match rule.match_type {
                    MatchType::Regex => {
                        match regex::RegexBuilder::new(&rule.pattern).case_insensitive(true).build()
                        {
                            Ok(re) => Matcher::Regex(re),
                            Err(err) => {
                                warn!(pattern = %rule.pattern, error = %err, "invalid uri rule regex, dropping rule");
                                return None;
                            }
                        }
                    }
                    MatchType::Prefix => Matcher::Prefix(rule.pattern.clone()),
                    MatchType::Exact => Matcher::Exact(rule.pattern.clone()),
                };
                Some(Compiled { rule: rule.clone(), matcher })
            })
            .collect();
        Self { rules: compiled }
    }

    /// Returns the first rule matching `path`, if any.
    #[must_use]
    pub fn first_match(&self, path: &str) -> Option<&UriRule> {
        self.rules
            .iter()
            .find(|compiled| match &compiled.matcher {
                Matcher::Regex(re) => re.is_match(path),
                Matcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
                Matcher::Exact(exact) => path == exact,
            })
            .map(|compiled| &compiled.rule)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, match_type: MatchType) -> UriRule {
        UriRule { pattern: pattern.to_string(), match_type }
    }

    #[test]
    fn test_exact_match_is_full_string() {
        let set = UriRuleSet::compile(&[rule("/health", MatchType::Exact)]);
        assert!(set.first_match("/health").is_some());
        assert!(set.first_match("/health/live").is_none());
        assert!(set.first_match("/Health").is_none());
    }

    #[test]
    fn test_prefix_match_is_byte_prefix() {
        let set = UriRuleSet::compile(&[rule("/emby/videos", MatchType::Prefix)]);
        assert!(set.first_match("/emby/videos/123/stream").is_some());
        assert!(set.first_match("/emby/video").is_none());
        assert!(set.first_match("/Emby/videos/123").is_none());
    }

    #[test]
    fn test_regex_match_is_case_insensitive() {
        let set = UriRuleSet::compile(&[rule(r"^/users/[^/]+/policy$", MatchType::Regex)]);
        assert!(set.first_match("/Users/abc/Policy").is_some());
        assert!(set.first_match("/users/abc/policy").is_some());
        assert!(set.first_match("/users/abc/policy/extra").is_none());
    }

    #[test]
    fn test_first_match_wins_in_order() {
        let set = UriRuleSet::compile(&[
            rule("/a", MatchType::Prefix),
            rule("/a/b", MatchType::Prefix),
        ]);
        let matched = set.first_match("/a/b/c").unwrap();
        assert_eq!(matched.pattern, "/a");
    }

    #[test]
    fn test_invalid_regex_is_dropped_not_fatal() {
        let set = UriRuleSet::compile(&[
            rule("([unclosed", MatchType::Regex),
            rule("/ok", MatchType::Prefix),
        ]);
        assert_eq!(set.len(), 1);
        assert!(set.first_match("/ok/path").is_some());
    }

    #[test]
    fn test_empty_set() {
        let set = UriRuleSet::compile(&[]);
        assert!(set.is_empty());
        assert!(set.first_match("/anything").is_none());
    }
}
