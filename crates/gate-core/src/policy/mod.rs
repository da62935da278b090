//! Policy configuration and the access decision pipeline.

pub mod engine;
pub mod rate_limit;
pub mod snapshot;
pub mod uri_rules;

pub use engine::{AccessDecision, Denial, DenyReason, PolicyEngine};
pub use rate_limit::LocalRateLimiter;
pub use snapshot::{
    ConfigCache, EnforcementDirective, FakeCounts, GatePolicy, MatchType, OverAction,
    PolicySnapshot, RateLimitConfig, RateLimitRule, UriRule,
};
