//! Store key shapes.
//!
//! Every key written to or read from the store is produced here; no other
//! module formats keys by hand. Keeping the shapes in one place is what makes
//! the pattern scans in the agent loops trustworthy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Axis a rule, directive or counter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Ip,
    User,
    Device,
    Global,
}

impl Dimension {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::User => "user",
            Self::Device => "device",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

/// Periods counters are written for. Weekly headroom exists only as a
/// control-plane mirror, so no weekly counter key is ever created.
pub const COUNTER_PERIODS: [Period; 2] = [Period::Daily, Period::Monthly];

/// Periods remaining-capacity mirrors are read and decremented for.
pub const MIRROR_PERIODS: [Period; 3] = [Period::Daily, Period::Weekly, Period::Monthly];

impl Period {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Counter key TTL in seconds: one day, or 31 days for monthly.
    #[must_use]
    pub fn counter_ttl_secs(self) -> u64 {
        match self {
            Self::Daily => 86_400,
            Self::Weekly => 604_800,
            Self::Monthly => 2_678_400,
        }
    }

    /// UTC period key: `yyyy-mm-dd` for daily, `yyyy-Www` for weekly,
    /// `yyyy-mm` for monthly.
    #[must_use]
    pub fn key_for(self, now: DateTime<Utc>) -> String {
        match self {
            Self::Daily => now.format("%Y-%m-%d").to_string(),
            Self::Weekly => now.format("%G-W%V").to_string(),
            Self::Monthly => now.format("%Y-%m").to_string(),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter kind: request count or bandwidth bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Req,
    Bw,
}

impl QuotaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Req => "req",
            Self::Bw => "bw",
        }
    }
}

/// TTL for token mappings and device-user fallbacks: 7 days.
pub const IDENTITY_TTL_SECS: u64 = 7 * 86_400;

/// TTL for active playback sessions, refreshed on every streaming request.
pub const SESSION_TTL_SECS: u64 = 90;

/// TTL for remaining-capacity mirrors written by the quota sync loop.
pub const REMAIN_TTL_SECS: u64 = 600;

/// TTL for queued login reports awaiting upload.
pub const TOKEN_REPORT_TTL_SECS: u64 = 600;

#[must_use]
pub fn token_map(token: &str) -> String {
    format!("token_map:{token}")
}

#[must_use]
pub fn device_user(device_id: &str) -> String {
    format!("device_user:{device_id}")
}

#[must_use]
pub fn active_session(user_id: &str, play_session_id: &str) -> String {
    format!("active_session:{user_id}:{play_session_id}")
}

/// Pattern matching every active session for one user.
#[must_use]
pub fn active_session_pattern(user_id: &str) -> String {
    format!("active_session:{user_id}:*")
}

/// Pattern matching every active session on this store.
pub const ALL_SESSIONS_PATTERN: &str = "active_session:*";

#[must_use]
pub fn enforce(dimension: Dimension, value: &str) -> String {
    format!("enforce:{dimension}:{value}")
}

/// Pattern matching every enforcement directive.
pub const ALL_ENFORCE_PATTERN: &str = "enforce:*";

#[must_use]
pub fn quota(kind: QuotaKind, dimension: Dimension, value: &str, period: Period, period_key: &str) -> String {
    format!("quota:{}:{dimension}:{value}:{period}:{period_key}", kind.as_str())
}

/// Pattern matching every request counter; bandwidth counterparts are derived
/// with [`bw_counterpart`].
pub const ALL_QUOTA_REQ_PATTERN: &str = "quota:req:*";

/// Maps a `quota:req:...` key to its `quota:bw:...` counterpart.
#[must_use]
pub fn bw_counterpart(req_key: &str) -> Option<String> {
    req_key.strip_prefix("quota:req:").map(|rest| format!("quota:bw:{rest}"))
}

#[must_use]
pub fn remain(kind: QuotaKind, dimension: Dimension, value: &str, period: Period) -> String {
    format!("remain:{}:{dimension}:{value}:{period}", kind.as_str())
}

#[must_use]
pub fn token_report(now: DateTime<Utc>, nonce: u32) -> String {
    format!("token_report:{}:{nonce}", now.timestamp())
}

/// Pattern matching every queued login report.
pub const ALL_TOKEN_REPORT_PATTERN: &str = "token_report:*";

/// Decomposed `quota:<kind>:<dim>:<val>:<period>:<period_key>` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaKeyParts {
    pub kind: QuotaKind,
    pub dimension: Dimension,
    pub value: String,
    pub period: Period,
    pub period_key: String,
}

/// Parses a quota counter key back into its parts.
///
/// The value segment may itself contain `:` (IPv6 addresses), so the period
/// and period key are taken from the right.
#[must_use]
pub fn parse_quota_key(key: &str) -> Option<QuotaKeyParts> {
    let rest = key.strip_prefix("quota:")?;
    let (kind_str, rest) = rest.split_once(':')?;
    let kind = match kind_str {
        "req" => QuotaKind::Req,
        "bw" => QuotaKind::Bw,
        _ => return None,
    };
    let (dim_str, rest) = rest.split_once(':')?;
    let dimension = match dim_str {
        "ip" => Dimension::Ip,
        "user" => Dimension::User,
        "device" => Dimension::Device,
        "global" => Dimension::Global,
        _ => return None,
    };
    let (rest, period_key) = rest.rsplit_once(':')?;
    let (value, period_str) = rest.rsplit_once(':')?;
    let period = match period_str {
        "daily" => Period::Daily,
        "weekly" => Period::Weekly,
        "monthly" => Period::Monthly,
        _ => return None,
    };
    if value.is_empty() || period_key.is_empty() {
        return None;
    }
    Some(QuotaKeyParts {
        kind,
        dimension,
        value: value.to_string(),
        period,
        period_key: period_key.to_string(),
    })
}

/// Extracts `(user_id, play_session_id)` from an `active_session:` key.
#[must_use]
pub fn parse_session_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix("active_session:")?;
    let (user_id, psid) = rest.split_once(':')?;
    if user_id.is_empty() || psid.is_empty() {
        return None;
    }
    Some((user_id.to_string(), psid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_keys_are_utc() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(Period::Daily.key_for(ts), "2025-03-09");
        assert_eq!(Period::Monthly.key_for(ts), "2025-03");
        assert_eq!(Period::Weekly.key_for(ts), "2025-W10");
    }

    #[test]
    fn test_counter_ttls() {
        assert_eq!(Period::Daily.counter_ttl_secs(), 86_400);
        assert_eq!(Period::Monthly.counter_ttl_secs(), 2_678_400);
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(token_map("T1"), "token_map:T1");
        assert_eq!(device_user("D1"), "device_user:D1");
        assert_eq!(active_session("U1", "P1"), "active_session:U1:P1");
        assert_eq!(active_session_pattern("U1"), "active_session:U1:*");
        assert_eq!(enforce(Dimension::Ip, "1.2.3.4"), "enforce:ip:1.2.3.4");
        assert_eq!(
            quota(QuotaKind::Req, Dimension::User, "U1", Period::Daily, "2025-03-09"),
            "quota:req:user:U1:daily:2025-03-09"
        );
        assert_eq!(
            remain(QuotaKind::Bw, Dimension::Device, "D1", Period::Monthly),
            "remain:bw:device:D1:monthly"
        );
    }

    #[test]
    fn test_bw_counterpart() {
        assert_eq!(
            bw_counterpart("quota:req:ip:1.2.3.4:daily:2025-03-09").as_deref(),
            Some("quota:bw:ip:1.2.3.4:daily:2025-03-09")
        );
        assert_eq!(bw_counterpart("quota:bw:ip:1.2.3.4:daily:2025-03-09"), None);
    }

    #[test]
    fn test_parse_quota_key_round_trip() {
        let key = quota(QuotaKind::Req, Dimension::Ip, "1.2.3.4", Period::Daily, "2025-03-09");
        let parts = parse_quota_key(&key).unwrap();
        assert_eq!(parts.kind, QuotaKind::Req);
        assert_eq!(parts.dimension, Dimension::Ip);
        assert_eq!(parts.value, "1.2.3.4");
        assert_eq!(parts.period, Period::Daily);
        assert_eq!(parts.period_key, "2025-03-09");
    }

    #[test]
    fn test_parse_quota_key_ipv6_value() {
        let key = quota(QuotaKind::Bw, Dimension::Ip, "2001:db8::1", Period::Monthly, "2025-03");
        let parts = parse_quota_key(&key).unwrap();
        assert_eq!(parts.value, "2001:db8::1");
        assert_eq!(parts.period, Period::Monthly);
        assert_eq!(parts.period_key, "2025-03");
    }

    #[test]
    fn test_parse_quota_key_rejects_garbage() {
        assert!(parse_quota_key("quota:req:ip").is_none());
        assert!(parse_quota_key("remain:req:ip:x:daily").is_none());
        assert!(parse_quota_key("quota:xyz:ip:x:daily:2025-03-09").is_none());
    }

    #[test]
    fn test_parse_session_key() {
        assert_eq!(
            parse_session_key("active_session:U1:P1"),
            Some(("U1".to_string(), "P1".to_string()))
        );
        assert!(parse_session_key("active_session:U1").is_none());
        assert!(parse_session_key("token_map:T").is_none());
    }
}
