//! Policy snapshot: the versioned configuration bundle the pipeline reads.
//!
//! The agent's config pull loop deserializes the control-plane payload,
//! compiles the URI rule sets once, and installs the whole bundle with a
//! single pointer swap. Readers either see the old snapshot fully or the new
//! one fully; a reader holding an `Arc` across a request keeps a consistent
//! view even if a swap lands mid-request.

use super::uri_rules::UriRuleSet;
use crate::store::keys::Dimension;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

/// URI rule match semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Case-insensitive regular expression.
    Regex,
    /// Byte prefix.
    Prefix,
    /// Full-string equality.
    Exact,
}

/// One entry of the skip or block list. First match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UriRule {
    pub pattern: String,
    pub match_type: MatchType,
}

/// What to do when a rule or directive trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverAction {
    Reject,
    Throttle,
}

impl Default for OverAction {
    fn default() -> Self {
        Self::Reject
    }
}

/// One rate-limit rule. All applicable rules are checked in declaration
/// order; matching is by dimension plus apply-value, where an absent or `"*"`
/// apply-value matches any non-nil dimension value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default)]
    pub id: Option<String>,
    pub apply_to: Dimension,
    #[serde(default)]
    pub apply_value: Option<String>,
    #[serde(default)]
    pub rate_per_second: u32,
    #[serde(default)]
    pub rate_burst: u32,
    #[serde(default)]
    pub rate_per_minute: u32,
    #[serde(default)]
    pub over_action: OverAction,
    #[serde(default)]
    pub throttle_rate_bps: Option<u64>,
}

impl RateLimitRule {
    /// Effective burst: explicit burst, or the per-second rate itself.
    #[must_use]
    pub fn burst(&self) -> u32 {
        if self.rate_burst > 0 {
            self.rate_burst
        } else {
            self.rate_per_second
        }
    }

    /// Returns the key value this rule applies to for a request, or `None`
    /// when the rule does not apply.
    #[must_use]
    pub fn applies_to_value<'a>(&self, dimension_value: Option<&'a str>) -> Option<&'a str> {
        let value = dimension_value?;
        match self.apply_value.as_deref() {
            None | Some("*") => Some(value),
            Some(literal) if literal == value => Some(value),
            Some(_) => None,
        }
    }
}

/// Control-plane instruction to reject or throttle a dimension value for a
/// time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementDirective {
    pub dimension: Dimension,
    pub dimension_value: String,
    pub action: OverAction,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub throttle_rate_bps: Option<u64>,
    #[serde(default)]
    pub effective_until: Option<String>,
}

/// Fallback TTL for directives with no parseable `effective_until`.
pub const DEFAULT_ENFORCEMENT_TTL_SECS: u64 = 600;

impl EnforcementDirective {
    /// TTL derived from `effective_until` (RFC 3339), clamped to at least one
    /// second. Absent or unparseable timestamps fall back to the default.
    #[must_use]
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> u64 {
        let Some(raw) = self.effective_until.as_deref() else {
            return DEFAULT_ENFORCEMENT_TTL_SECS;
        };
        match DateTime::parse_from_rfc3339(raw) {
            Ok(until) => {
                let remaining = until.with_timezone(&Utc).signed_duration_since(now).num_seconds();
                if remaining > 0 {
                    remaining as u64
                } else {
                    1
                }
            }
            Err(err) => {
                tracing::warn!(value = raw, error = %err, "unparseable effective_until, using default TTL");
                DEFAULT_ENFORCEMENT_TTL_SECS
            }
        }
    }
}

/// Fake library counts interception settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeCounts {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fake_counts_value")]
    pub value: i64,
}

fn default_fake_counts_value() -> i64 {
    888
}

impl Default for FakeCounts {
    fn default() -> Self {
        Self { enabled: false, value: default_fake_counts_value() }
    }
}

/// Gate policy: the `lua_config` document of the control-plane payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default)]
    pub uri_skip: Vec<UriRule>,
    #[serde(default)]
    pub uri_block: Vec<UriRule>,
    #[serde(default = "default_blocked_message")]
    pub blocked_message: String,
    #[serde(default)]
    pub client_whitelist: Vec<String>,
    #[serde(default)]
    pub min_versions: HashMap<String, String>,
    #[serde(default = "default_whitelist_deny_message")]
    pub whitelist_deny_message: String,
    /// Maximum concurrent playback sessions per user; `0` disables the gate.
    #[serde(default)]
    pub max_streams: u32,
    #[serde(default = "default_stream_limit_message")]
    pub stream_limit_message: String,
    #[serde(default = "default_quota_exhausted_message")]
    pub quota_exhausted_message: String,
    #[serde(default)]
    pub fake_counts: FakeCounts,
}

fn default_blocked_message() -> String {
    "访问被拒绝".to_string()
}

fn default_whitelist_deny_message() -> String {
    "当前客户端不被允许访问".to_string()
}

fn default_stream_limit_message() -> String {
    "并发播放数量已达上限，请稍后再试".to_string()
}

fn default_quota_exhausted_message() -> String {
    "您的配额已用尽".to_string()
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            uri_skip: Vec::new(),
            uri_block: Vec::new(),
            blocked_message: default_blocked_message(),
            client_whitelist: Vec::new(),
            min_versions: HashMap::new(),
            whitelist_deny_message: default_whitelist_deny_message(),
            max_streams: 0,
            stream_limit_message: default_stream_limit_message(),
            quota_exhausted_message: default_quota_exhausted_message(),
            fake_counts: FakeCounts::default(),
        }
    }
}

/// Rate-limit rules plus enforcement directives, the `rate_limit_config`
/// document of the control-plane payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
    #[serde(default)]
    pub enforcements: Vec<EnforcementDirective>,
}

/// The installed configuration bundle, URI rules pre-compiled.
pub struct PolicySnapshot {
    pub version: u64,
    pub service_type: String,
    pub policy: GatePolicy,
    pub rate_limits: RateLimitConfig,
    skip_rules: UriRuleSet,
    block_rules: UriRuleSet,
}

impl PolicySnapshot {
    #[must_use]
    pub fn new(
        version: u64,
        service_type: String,
        policy: GatePolicy,
        rate_limits: RateLimitConfig,
    ) -> Self {
        let skip_rules = UriRuleSet::compile(&policy.uri_skip);
        let block_rules = UriRuleSet::compile(&policy.uri_block);
        Self { version, service_type, policy, rate_limits, skip_rules, block_rules }
    }

    #[must_use]
    pub fn skip_rules(&self) -> &UriRuleSet {
        &self.skip_rules
    }

    #[must_use]
    pub fn block_rules(&self) -> &UriRuleSet {
        &self.block_rules
    }
}

/// Lock-free holder of the current snapshot.
///
/// Single writer (the agent), many readers (every request). `None` means
/// cold start and the pipeline allows through.
#[derive(Default)]
pub struct ConfigCache {
    current: ArcSwapOption<PolicySnapshot>,
}

impl ConfigCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, if one has been applied.
    #[must_use]
    pub fn load(&self) -> Option<Arc<PolicySnapshot>> {
        self.current.load_full()
    }

    /// Atomically replaces the snapshot.
    pub fn install(&self, snapshot: PolicySnapshot) {
        self.current.store(Some(Arc::new(snapshot)));
    }

    /// Version of the installed snapshot; `0` before the first install.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.load().map_or(0, |s| s.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_rule_burst_defaults_to_rate() {
        let rule: RateLimitRule = serde_json::from_str(
            r#"{"apply_to": "ip", "rate_per_second": 10}"#,
        )
        .unwrap();
        assert_eq!(rule.burst(), 10);

        let rule: RateLimitRule = serde_json::from_str(
            r#"{"apply_to": "ip", "rate_per_second": 10, "rate_burst": 25}"#,
        )
        .unwrap();
        assert_eq!(rule.burst(), 25);
    }

    #[test]
    fn test_rule_apply_value_matching() {
        let wildcard: RateLimitRule =
            serde_json::from_str(r#"{"apply_to": "ip", "apply_value": "*"}"#).unwrap();
        assert_eq!(wildcard.applies_to_value(Some("1.2.3.4")), Some("1.2.3.4"));
        assert_eq!(wildcard.applies_to_value(None), None);

        let absent: RateLimitRule = serde_json::from_str(r#"{"apply_to": "user"}"#).unwrap();
        assert_eq!(absent.applies_to_value(Some("U1")), Some("U1"));

        let literal: RateLimitRule =
            serde_json::from_str(r#"{"apply_to": "user", "apply_value": "U1"}"#).unwrap();
        assert_eq!(literal.applies_to_value(Some("U1")), Some("U1"));
        assert_eq!(literal.applies_to_value(Some("U2")), None);
    }

    #[test]
    fn test_directive_ttl_from_effective_until() {
        let now = Utc::now();
        let directive = EnforcementDirective {
            dimension: Dimension::Ip,
            dimension_value: "1.2.3.4".to_string(),
            action: OverAction::Reject,
            reason: None,
            throttle_rate_bps: None,
            effective_until: Some((now + Duration::seconds(300)).to_rfc3339()),
        };
        let ttl = directive.ttl_secs(now);
        assert!((299..=301).contains(&ttl));
    }

    #[test]
    fn test_directive_ttl_fallbacks() {
        let now = Utc::now();
        let mut directive = EnforcementDirective {
            dimension: Dimension::User,
            dimension_value: "U1".to_string(),
            action: OverAction::Throttle,
            reason: None,
            throttle_rate_bps: Some(1_000_000),
            effective_until: None,
        };
        assert_eq!(directive.ttl_secs(now), DEFAULT_ENFORCEMENT_TTL_SECS);

        directive.effective_until = Some("yesterday-ish".to_string());
        assert_eq!(directive.ttl_secs(now), DEFAULT_ENFORCEMENT_TTL_SECS);

        directive.effective_until = Some((now - Duration::seconds(60)).to_rfc3339());
        assert_eq!(directive.ttl_secs(now), 1);
    }

    #[test]
    fn test_policy_deserialization_defaults() {
        let policy: GatePolicy = serde_json::from_str("{}").unwrap();
        assert!(policy.uri_skip.is_empty());
        assert!(policy.client_whitelist.is_empty());
        assert_eq!(policy.max_streams, 0);
        assert!(!policy.fake_counts.enabled);
        assert_eq!(policy.fake_counts.value, 888);
        assert!(!policy.blocked_message.is_empty());
    }

    #[test]
    fn test_policy_deserialization_full() {
        let policy: GatePolicy = serde_json::from_str(
            r#"{
                "uri_skip": [{"pattern": "/health", "match_type": "exact"}],
                "uri_block": [{"pattern": "^/debug", "match_type": "regex"}],
                "client_whitelist": ["Infuse"],
                "min_versions": {"Infuse": "7.9.0"},
                "max_streams": 2,
                "fake_counts": {"enabled": true, "value": 42}
            }"#,
        )
        .unwrap();
        assert_eq!(policy.uri_skip.len(), 1);
        assert_eq!(policy.uri_skip[0].match_type, MatchType::Exact);
        assert_eq!(policy.uri_block[0].match_type, MatchType::Regex);
        assert_eq!(policy.max_streams, 2);
        assert_eq!(policy.fake_counts.value, 42);
    }

    #[test]
    fn test_config_cache_swap_and_version() {
        let cache = ConfigCache::new();
        assert!(cache.load().is_none());
        assert_eq!(cache.version(), 0);

        cache.install(PolicySnapshot::new(
            7,
            "emby".to_string(),
            GatePolicy::default(),
            RateLimitConfig::default(),
        ));
        assert_eq!(cache.version(), 7);

        let held = cache.load().unwrap();
        cache.install(PolicySnapshot::new(
            8,
            "emby".to_string(),
            GatePolicy::default(),
            RateLimitConfig::default(),
        ));
        // A reader that grabbed the old snapshot keeps its consistent view.
        assert_eq!(held.version, 7);
        assert_eq!(cache.version(), 8);
    }
}
