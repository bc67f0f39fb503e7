//! Error taxonomy for the bot core.
//!
//! Every failure a turn can hit maps to one of these variants. The Display
//! form is operator-facing; user-facing wording lives in [`super::reply`] so
//! that raw ARNs and credential material never reach the chat thread.

use super::directory::AccountRecord;
use thiserror::Error;

/// Which hop of the bridge chain an STS failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleHop {
    Bridge,
    Target,
}

impl std::fmt::Display for RoleHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleHop::Bridge => write!(f, "bridge"),
            RoleHop::Target => write!(f, "target"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BotError {
    /// The account metadata backend could not be reached after bounded retries.
    #[error("account directory unavailable: {0}")]
    DirectoryUnavailable(#[source] anyhow::Error),

    /// No account matched the user's reference.
    #[error("no account matched reference '{reference}'")]
    NotFound { reference: String },

    /// Multiple accounts matched; the caller must ask the user to pick one.
    /// This is the only error that expects a user response rather than
    /// terminating the turn.
    #[error("reference '{reference}' matched {} accounts", candidates.len())]
    Ambiguous {
        reference: String,
        candidates: Vec<AccountRecord>,
    },

    /// STS refused the assume-role call. Never retried.
    #[error("assume-role denied on {hop} hop for account {account_id}")]
    AssumeRoleDenied { hop: RoleHop, account_id: String },

    /// The bridge hop could not be completed after bounded retries.
    #[error("bridge role unreachable for account {account_id}")]
    BridgeUnreachable { account_id: String },

    /// The target role rejected the supplied external id.
    #[error("external id mismatch for account {account_id}")]
    ExternalIdMismatch { account_id: String },

    /// Credentials were expired at the point of use. Fail closed, never
    /// retry with stale material.
    #[error("credentials expired for account {account_id}")]
    CredentialsExpired { account_id: String },

    /// Rate limited beyond the bounded retry budget.
    #[error("rate limited during {operation}")]
    RateLimited { operation: String },

    /// Query window wider than the configured maximum; rejected before any
    /// network call.
    #[error("query window of {window_days} days exceeds the {max_days}-day maximum")]
    QueryTooBroad { window_days: i64, max_days: i64 },

    /// A bounded network operation ran past its deadline.
    #[error("timed out during {operation}")]
    InternalTimeout { operation: String },

    /// Malformed query parameters (start after end, zero max events).
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },
}

impl BotError {
    /// Short stable label for structured operator logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BotError::DirectoryUnavailable(_) => "directory_unavailable",
            BotError::NotFound { .. } => "not_found",
            BotError::Ambiguous { .. } => "ambiguous",
            BotError::AssumeRoleDenied { .. } => "assume_role_denied",
            BotError::BridgeUnreachable { .. } => "bridge_unreachable",
            BotError::ExternalIdMismatch { .. } => "external_id_mismatch",
            BotError::CredentialsExpired { .. } => "credentials_expired",
            BotError::RateLimited { .. } => "rate_limited",
            BotError::QueryTooBroad { .. } => "query_too_broad",
            BotError::InternalTimeout { .. } => "internal_timeout",
            BotError::InvalidQuery { .. } => "invalid_query",
        }
    }

    /// Whether the turn should wait for a user reply instead of ending.
    pub fn expects_user_response(&self) -> bool {
        matches!(self, BotError::Ambiguous { .. })
    }
}
