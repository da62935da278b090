use thiserror::Error;

/// Errors produced by gateway subsystems.
///
/// The taxonomy matters more than the messages: callers on the request hot
/// path collapse most of these into "no data" (the request proceeds), while
/// the agent loops log and retry on their next tick. Only
/// [`GateError::FatalBootstrap`] is allowed to terminate the process.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GateError {
    /// No policy snapshot has been applied yet (cold start).
    #[error("no policy snapshot applied")]
    ConfigMissing,

    /// Store operation failed transiently (connect, timeout, protocol).
    #[error("store error: {0}")]
    StoreTransient(String),

    /// Control plane could not be reached or returned a non-success status.
    #[error("control plane unreachable: {0}")]
    ControlPlaneUnreachable(String),

    /// Upstream media server API call failed.
    #[error("upstream API error: {0}")]
    UpstreamApi(String),

    /// A payload (config, directive, captured body) could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Mandatory configuration is missing or the store rejected the first
    /// connect. The process exits non-zero.
    #[error("fatal bootstrap failure: {0}")]
    FatalBootstrap(String),
}

impl GateError {
    /// Returns `true` if the error is expected to clear on its own and the
    /// operation should simply be retried on the next tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreTransient(_) | Self::ControlPlaneUnreachable(_) | Self::UpstreamApi(_)
        )
    }

    /// Returns `true` if a request-path caller should treat this error as
    /// "no data" and allow the request through.
    ///
    /// Stages 4, 6 and 7 of the pipeline never fail a request that would
    /// otherwise pass; only an explicit policy denial does that.
    #[must_use]
    pub fn fails_open(&self) -> bool {
        matches!(self, Self::ConfigMissing | Self::StoreTransient(_) | Self::Parse(_))
    }

    /// Returns `true` if the process must exit non-zero.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalBootstrap(_))
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
