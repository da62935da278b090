//! The access decision pipeline.
//!
//! Stages run strictly in order; at most one emits a denial:
//!
//! 1. URI skip list — match bypasses every later stage
//! 2. URI block list — 403
//! 3. Identity — fingerprint back-fill from the store
//! 4. Enforcement directives — 403 or throttle stash
//! 5. Local rate limiting — 429 or throttle stash
//! 6. Quota remaining mirrors — 429
//! 7. Concurrent-stream gate — 429 or session admission
//! 8. Client whitelist and minimum versions — 403
//! 9. Fake library counts interception — synthetic 200
//!
//! With no snapshot installed the pipeline allows through (cold start is
//! fail-open). Store failures inside a stage degrade to "no data": a request
//! that would otherwise pass is never failed by infrastructure.

use super::{
    rate_limit::LocalRateLimiter,
    snapshot::{ConfigCache, EnforcementDirective, OverAction, PolicySnapshot},
};
use crate::{
    identity::{self, Fingerprint},
    request::{InboundRequest, RequestContext},
    session::SessionTracker,
    store::{keys, Store},
    telemetry::{BlockedLogEntry, TelemetryBuffer},
};
use chrono::Utc;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, warn};

/// Denial shown to rate-limited clients; rules carry no message of their own.
const RATE_LIMIT_MESSAGE: &str = "请求过于频繁，请稍后再试";

/// Denial shown when an enforcement directive has no reason text.
const ENFORCEMENT_MESSAGE: &str = "访问已被管理员限制";

static COUNTS_URI: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::RegexBuilder::new(r"(/items/counts(/|$)|/users/.*/items/counts)")
        .case_insensitive(true)
        .build()
        .expect("valid pattern")
});

/// Machine-readable denial reasons, as reported in blocked telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UriBlocked,
    EnforcementReject,
    RateLimitRps,
    RateLimitRpm,
    QuotaExhausted,
    ConcurrentStreamLimit,
    ClientNotWhitelisted,
    VersionTooOld,
}

impl DenyReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UriBlocked => "uri_blocked",
            Self::EnforcementReject => "enforcement_reject",
            Self::RateLimitRps => "rate_limit_rps",
            Self::RateLimitRpm => "rate_limit_rpm",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ConcurrentStreamLimit => "concurrent_stream_limit",
            Self::ClientNotWhitelisted => "client_not_whitelisted",
            Self::VersionTooOld => "version_too_old",
        }
    }
}

/// A rendered denial.
#[derive(Debug, Clone)]
pub struct Denial {
    pub status: u16,
    pub reason: DenyReason,
    pub message: String,
}

/// Outcome of the pipeline.
#[derive(Debug, Clone)]
pub enum AccessDecision {
    /// Forward the request upstream.
    Allow,
    /// Short-circuit with the given status and message.
    Deny(Denial),
    /// Answer locally with a fake counts document; upstream is not reached.
    FakeCounts { value: i64 },
}

impl AccessDecision {
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// The per-request policy evaluator.
pub struct PolicyEngine {
    store: Arc<dyn Store>,
    config: Arc<ConfigCache>,
    limiter: Arc<LocalRateLimiter>,
    telemetry: Arc<TelemetryBuffer>,
    sessions: SessionTracker,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ConfigCache>,
        limiter: Arc<LocalRateLimiter>,
        telemetry: Arc<TelemetryBuffer>,
    ) -> Self {
        let sessions = SessionTracker::new(store.clone());
        Self { store, config, limiter, telemetry, sessions }
    }

    /// Runs the pipeline for one request.
    ///
    /// Always returns a context carrying the fingerprint for the log phase,
    /// even when the decision is a denial.
    pub async fn evaluate(&self, req: &InboundRequest) -> (AccessDecision, RequestContext) {
        let mut ctx = RequestContext {
            fingerprint: identity::extract(req),
            throttle_rate_bps: None,
            user_agent: req.header("user-agent").map(str::to_string),
        };

        let Some(snapshot) = self.config.load() else {
            debug!("no policy snapshot installed, allowing through");
            return (AccessDecision::Allow, ctx);
        };

        // Stage 1: URI skip list.
        if let Some(rule) = snapshot.skip_rules().first_match(&req.path) {
            debug!(pattern = %rule.pattern, "uri skip matched");
            return (AccessDecision::Allow, ctx);
        }

        // Stage 2: URI block list.
        if let Some(rule) = snapshot.block_rules().first_match(&req.path) {
            let denial = Denial {
                status: 403,
                reason: DenyReason::UriBlocked,
                message: snapshot.policy.blocked_message.clone(),
            };
            self.record_blocked(&ctx.fingerprint, denial.reason, Some(rule.pattern.clone()));
            return (AccessDecision::Deny(denial), ctx);
        }

        // Stage 3: identity back-fill.
        identity::back_fill(self.store.as_ref(), &mut ctx.fingerprint).await;

        // Stage 4: enforcement directives.
        let fingerprint = ctx.fingerprint.clone();
        if let Some(denial) = self.check_enforcements(&fingerprint, &mut ctx).await {
            return (AccessDecision::Deny(denial), ctx);
        }

        // Stage 5: local rate limiting.
        if let Some(denial) = self.check_rate_limits(&snapshot, &fingerprint, &mut ctx) {
            return (AccessDecision::Deny(denial), ctx);
        }

        // Stage 6: quota remaining mirrors.
        if let Some(denial) = self.check_remaining(&snapshot, &ctx.fingerprint).await {
            return (AccessDecision::Deny(denial), ctx);
        }

        // Stage 7: concurrent-stream gate.
        if let Some(denial) = self.check_stream_gate(&snapshot, &ctx.fingerprint).await {
            return (AccessDecision::Deny(denial), ctx);
        }

        // Stage 8: client whitelist.
        if let Some(denial) = self.check_whitelist(&snapshot, &ctx.fingerprint) {
            return (AccessDecision::Deny(denial), ctx);
        }

        // Stage 9: fake counts interception.
        if snapshot.policy.fake_counts.enabled && COUNTS_URI.is_match(&req.path) {
            debug!(path = %req.path, "intercepting counts request");
            return (
                AccessDecision::FakeCounts { value: snapshot.policy.fake_counts.value },
                ctx,
            );
        }

        (AccessDecision::Allow, ctx)
    }

    /// Dimension/value pairs present on this fingerprint, ip first.
    fn dimensions(fp: &Fingerprint) -> Vec<(keys::Dimension, String)> {
        let mut dims = vec![(keys::Dimension::Ip, fp.client_ip.clone())];
        if let Some(user_id) = &fp.user_id {
            dims.push((keys::Dimension::User, user_id.clone()));
        }
        if let Some(device_id) = &fp.device_id {
            dims.push((keys::Dimension::Device, device_id.clone()));
        }
        dims
    }

    async fn check_enforcements(
        &self,
        fp: &Fingerprint,
        ctx: &mut RequestContext,
    ) -> Option<Denial> {
        for (dimension, value) in Self::dimensions(fp) {
            let key = keys::enforce(dimension, &value);
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    error!(key = %key, error = %err, "enforcement lookup failed, skipping");
                    continue;
                }
            };
            let directive: EnforcementDirective = match serde_json::from_str(&raw) {
                Ok(directive) => directive,
                Err(err) => {
                    warn!(key = %key, error = %err, "undecodable enforcement directive, ignoring");
                    continue;
                }
            };
            match directive.action {
                OverAction::Reject => {
                    let message = directive
                        .reason
                        .clone()
                        .unwrap_or_else(|| ENFORCEMENT_MESSAGE.to_string());
                    self.record_blocked(fp, DenyReason::EnforcementReject, directive.reason);
                    return Some(Denial {
                        status: 403,
                        reason: DenyReason::EnforcementReject,
                        message,
                    });
                }
                OverAction::Throttle => {
                    if let Some(bps) = directive.throttle_rate_bps {
                        stash_throttle(ctx, bps);
                    }
                }
            }
        }
        None
    }

    fn check_rate_limits(
        &self,
        snapshot: &PolicySnapshot,
        fp: &Fingerprint,
        ctx: &mut RequestContext,
    ) -> Option<Denial> {
        for (index, rule) in snapshot.rate_limits.rules.iter().enumerate() {
            let dimension_value = match rule.apply_to {
                keys::Dimension::Ip => Some(fp.client_ip.as_str()),
                keys::Dimension::User => fp.user_id.as_deref(),
                keys::Dimension::Device => fp.device_id.as_deref(),
                keys::Dimension::Global => Some("global"),
            };
            let Some(value) = rule.applies_to_value(dimension_value) else {
                continue;
            };
            let rule_key = rule
                .id
                .clone()
                .unwrap_or_else(|| index.to_string());

            let mut tripped = None;
            if rule.rate_per_second > 0 {
                let key = format!("rl:{rule_key}:{}:{value}:s", rule.apply_to);
                if !self.limiter.check_per_second(&key, rule.rate_per_second, rule.burst()) {
                    tripped = Some(DenyReason::RateLimitRps);
                }
            }
            if tripped.is_none() && rule.rate_per_minute > 0 {
                let key = format!("rl:{rule_key}:{}:{value}:m", rule.apply_to);
                if !self.limiter.check_per_minute(&key, rule.rate_per_minute) {
                    tripped = Some(DenyReason::RateLimitRpm);
                }
            }

            if let Some(reason) = tripped {
                self.record_blocked(fp, reason, Some(format!("rule {rule_key}")));
                match rule.over_action {
                    OverAction::Reject => {
                        return Some(Denial {
                            status: 429,
                            reason,
                            message: RATE_LIMIT_MESSAGE.to_string(),
                        });
                    }
                    OverAction::Throttle => {
                        if let Some(bps) = rule.throttle_rate_bps {
                            stash_throttle(ctx, bps);
                        }
                    }
                }
            }
        }
        None
    }

    async fn check_remaining(
        &self,
        snapshot: &PolicySnapshot,
        fp: &Fingerprint,
    ) -> Option<Denial> {
        let dims = Self::dimensions(fp);
        let mut mirror_keys = Vec::with_capacity(dims.len() * 6);
        for (dimension, value) in &dims {
            for kind in [keys::QuotaKind::Req, keys::QuotaKind::Bw] {
                for period in keys::MIRROR_PERIODS {
                    mirror_keys.push(keys::remain(kind, *dimension, value, period));
                }
            }
        }

        let values = match self.store.mget(&mirror_keys).await {
            Ok(values) => values,
            Err(err) => {
                error!(error = %err, "remaining mirror read failed, allowing");
                return None;
            }
        };

        // Per dimension and kind, the minimum present value decides. A nil
        // mirror means no quota is configured on that axis.
        for (chunk, (dimension, _)) in values.chunks(6).zip(&dims) {
            for (kind_index, kind) in ["req", "bw"].into_iter().enumerate() {
                let min = chunk[kind_index * 3..kind_index * 3 + 3]
                    .iter()
                    .filter_map(|v| v.as_deref())
                    .filter_map(|raw| raw.parse::<i64>().ok())
                    .min();
                if let Some(min) = min {
                    if min <= 0 {
                        debug!(dimension = %dimension, kind, min, "quota exhausted");
                        self.record_blocked(
                            fp,
                            DenyReason::QuotaExhausted,
                            Some(format!("{dimension}:{kind}")),
                        );
                        return Some(Denial {
                            status: 429,
                            reason: DenyReason::QuotaExhausted,
                            message: snapshot.policy.quota_exhausted_message.clone(),
                        });
                    }
                }
            }
        }
        None
    }

    async fn check_stream_gate(
        &self,
        snapshot: &PolicySnapshot,
        fp: &Fingerprint,
    ) -> Option<Denial> {
        let max_streams = snapshot.policy.max_streams;
        if max_streams == 0 {
            return None;
        }
        let (Some(user_id), Some(psid)) = (fp.user_id.as_deref(), fp.play_session_id.as_deref())
        else {
            return None;
        };

        match self.sessions.exists(user_id, psid).await {
            Ok(true) => return None, // continuation of an admitted session
            Ok(false) => {}
            Err(err) => {
                error!(error = %err, "session existence check failed, allowing");
                return None;
            }
        }

        let active = match self.sessions.count_for_user(user_id).await {
            Ok(count) => count,
            Err(err) => {
                error!(error = %err, "session count failed, allowing");
                return None;
            }
        };

        if active >= max_streams as usize {
            self.record_blocked(
                fp,
                DenyReason::ConcurrentStreamLimit,
                Some(format!("{active}/{max_streams}")),
            );
            return Some(Denial {
                status: 429,
                reason: DenyReason::ConcurrentStreamLimit,
                message: snapshot.policy.stream_limit_message.clone(),
            });
        }

        if let Err(err) = self.sessions.admit(user_id, psid, fp).await {
            error!(error = %err, "session admission write failed");
        }
        None
    }

    fn check_whitelist(&self, snapshot: &PolicySnapshot, fp: &Fingerprint) -> Option<Denial> {
        let whitelist = &snapshot.policy.client_whitelist;
        if whitelist.is_empty() {
            return None;
        }

        let Some(client_name) = fp
            .client_name
            .as_deref()
            .filter(|name| whitelist.iter().any(|allowed| allowed == name))
        else {
            self.record_blocked(fp, DenyReason::ClientNotWhitelisted, fp.client_name.clone());
            return Some(Denial {
                status: 403,
                reason: DenyReason::ClientNotWhitelisted,
                message: snapshot.policy.whitelist_deny_message.clone(),
            });
        };

        if let Some(required) = snapshot.policy.min_versions.get(client_name) {
            if !identity::is_sufficient(fp.client_version.as_deref(), required) {
                self.record_blocked(
                    fp,
                    DenyReason::VersionTooOld,
                    fp.client_version.clone(),
                );
                return Some(Denial {
                    status: 403,
                    reason: DenyReason::VersionTooOld,
                    message: format!("请使用 {client_name} {required} 或更高版本进行访问"),
                });
            }
        }
        None
    }

    fn record_blocked(&self, fp: &Fingerprint, reason: DenyReason, detail: Option<String>) {
        self.telemetry.push_blocked(BlockedLogEntry {
            timestamp: Utc::now(),
            client_ip: fp.client_ip.clone(),
            uri: fp.uri.clone(),
            method: fp.method.clone(),
            reason: reason.as_str().to_string(),
            detail,
            client_name: fp.client_name.clone(),
            device_id: fp.device_id.clone(),
            user_id: fp.user_id.clone(),
        });
    }
}

/// Keeps the strictest throttle when several layers ask for one.
fn stash_throttle(ctx: &mut RequestContext, bps: u64) {
    ctx.throttle_rate_bps = Some(match ctx.throttle_rate_bps {
        Some(existing) => existing.min(bps),
        None => bps,
    });
}
