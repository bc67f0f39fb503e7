//! AWS SDK error classification and bounded backoff.
//!
//! The broker and the query engine share one policy: transient errors
//! (throttling, timeouts, network issues) are retried a small fixed number of
//! times with exponential backoff and jitter; authorization failures are never
//! retried. Classification works on the error's string form because the SDK
//! surfaces service errors through several layers of wrapping.

use rand::Rng;
use std::time::Duration;

/// Coarse classification of an AWS SDK error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsErrorClass {
    /// Rate limiting; retryable with backoff.
    Throttled,
    /// Request or connect timeout; retryable.
    Timeout,
    /// Connectivity or DNS failure; retryable.
    Network,
    /// AWS-side 5xx; retryable.
    ServiceUnavailable,
    /// Authorization failure; never retried.
    AccessDenied,
    /// Session token past its expiry.
    ExpiredToken,
    /// Everything else; not retried.
    Other,
}

impl AwsErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            AwsErrorClass::Throttled
                | AwsErrorClass::Timeout
                | AwsErrorClass::Network
                | AwsErrorClass::ServiceUnavailable
        )
    }
}

/// Classify an error from its anyhow wrapper.
pub fn classify(error: &anyhow::Error) -> AwsErrorClass {
    // The Display form of SDK errors often collapses to "service error"; the
    // Debug form keeps the error code.
    let display = error.to_string();
    let detail = if display.contains("service error") {
        format!("{:?}", error)
    } else {
        display
    };
    classify_str(&detail)
}

/// Classify an error from its string representation.
pub fn classify_str(error_str: &str) -> AwsErrorClass {
    if error_str.contains("ExpiredToken") || error_str.contains("TokenRefreshRequired") {
        return AwsErrorClass::ExpiredToken;
    }

    if error_str.contains("AccessDenied")
        || error_str.contains("UnauthorizedOperation")
        || error_str.contains("AuthFailure")
        || error_str.contains("InvalidClientTokenId")
        || error_str.contains("SignatureDoesNotMatch")
    {
        return AwsErrorClass::AccessDenied;
    }

    if error_str.contains("ThrottlingException")
        || error_str.contains("Throttling")
        || error_str.contains("TooManyRequestsException")
        || error_str.contains("RequestLimitExceeded")
        || error_str.contains("RateExceeded")
    {
        return AwsErrorClass::Throttled;
    }

    if error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("TimeoutError")
        || error_str.contains("deadline exceeded")
    {
        return AwsErrorClass::Timeout;
    }

    if error_str.contains("DispatchFailure")
        || error_str.contains("connection")
        || error_str.contains("Connection")
        || error_str.contains("dns error")
        || error_str.contains("DNS")
    {
        return AwsErrorClass::Network;
    }

    if error_str.contains("ServiceUnavailable")
        || error_str.contains("InternalServerError")
        || error_str.contains("InternalError")
        || error_str.contains("InternalFailure")
    {
        return AwsErrorClass::ServiceUnavailable;
    }

    AwsErrorClass::Other
}

/// Exponential backoff delay for a zero-based attempt index, with jitter.
///
/// Delay doubles per attempt from `base`, capped at 10s, with up to 25%
/// random jitter added so concurrent retries fan out.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(6));
    let capped = exp.min(Duration::from_secs(10));
    let jitter_ns = (capped.as_nanos() as u64 / 4).max(1);
    capped + Duration::from_nanos(rand::thread_rng().gen_range(0..jitter_ns))
}
