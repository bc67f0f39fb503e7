//! Deterministic request parsing.
//!
//! The language model proper is an external collaborator; this module is the
//! structured fallback the orchestrator can rely on without it: strip the
//! platform mention, pull out an account reference, a time window, and a
//! request shape.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@[A-Z0-9]+>").expect("mention regex"));
static ACCOUNT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{12})\b").expect("account id regex"));
static QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]{2,64})"|'([^']{2,64})'"#).expect("quoted regex"));
static ACCOUNT_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\baccount\s+(?:named\s+)?([A-Za-z][\w.&-]*(?:\s+[A-Za-z][\w.&-]*)?)")
        .expect("account name regex")
});
// Capitalized-only, so "in the" or "for now" never reads as a name.
static PREPOSITION_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:in|for|of|on|at)\s+([A-Z][\w.&-]*(?:\s+[A-Z][\w.&-]*)*)")
        .expect("preposition name regex")
});
static RELATIVE_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d+)\s*(minute|hour|day|week)s?\s+ago\b").expect("relative time regex")
});
static USERNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\buser(?:name)?\s+([A-Za-z][\w.@+-]+)").expect("username regex")
});

/// Event names a security review classifies as sensitive. Curated for IAM
/// tampering, network exposure, key management, trail tampering, and bucket
/// policy changes.
pub const SECURITY_EVENT_NAMES: &[&str] = &[
    // IAM
    "CreateUser",
    "DeleteUser",
    "CreateAccessKey",
    "DeleteAccessKey",
    "CreateRole",
    "DeleteRole",
    "AttachUserPolicy",
    "DetachUserPolicy",
    "AttachRolePolicy",
    "DetachRolePolicy",
    "PutUserPolicy",
    "PutRolePolicy",
    "CreateLoginProfile",
    "UpdateLoginProfile",
    "DeleteLoginProfile",
    "DeactivateMFADevice",
    // Security groups and network
    "AuthorizeSecurityGroupIngress",
    "AuthorizeSecurityGroupEgress",
    "RevokeSecurityGroupIngress",
    "CreateSecurityGroup",
    "DeleteSecurityGroup",
    // KMS
    "ScheduleKeyDeletion",
    "DisableKey",
    "PutKeyPolicy",
    // CloudTrail tampering
    "StopLogging",
    "DeleteTrail",
    "UpdateTrail",
    // S3 exposure
    "PutBucketPolicy",
    "DeleteBucketPolicy",
    "PutBucketAcl",
    "DeleteBucketPublicAccessBlock",
];

/// What the user is asking for, without account or time parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestIntent {
    Help,
    /// Look up which account a reference maps to, nothing more.
    FindAccount,
    /// Console sign-in history; recorded in us-east-1.
    ConsoleLogins,
    /// Events that failed with an error code.
    ErrorEvents,
    /// Security-sensitive event review over the curated name set.
    SecurityReview,
    /// Plain event lookup, optionally narrowed by name or user.
    LookupEvents {
        event_name: Option<String>,
        username: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub intent: RequestIntent,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Whether the text named the window itself, as opposed to the intent's
    /// default lookback being applied.
    pub explicit_window: bool,
}

/// Remove platform mention tokens like `<@U0123ABCD>`.
pub fn strip_mentions(text: &str) -> String {
    MENTION_RE.replace_all(text, "").trim().to_string()
}

/// Pull an account reference out of free text: a 12-digit id anywhere, a
/// quoted name, or a name following the word "account".
pub fn extract_account_reference(text: &str) -> Option<String> {
    if let Some(captures) = ACCOUNT_ID_RE.captures(text) {
        return Some(captures[1].to_string());
    }
    if let Some(captures) = QUOTED_RE.captures(text) {
        let name = captures.get(1).or_else(|| captures.get(2))?;
        return Some(name.as_str().trim().to_string());
    }
    if let Some(captures) = ACCOUNT_NAME_RE.captures(text) {
        return Some(captures[1].trim().to_string());
    }
    if let Some(captures) = PREPOSITION_NAME_RE.captures(text) {
        return Some(captures[1].trim().to_string());
    }
    None
}

/// Parse a human time expression relative to `now`. Supports "now", "today",
/// "yesterday", "N minutes/hours/days/weeks ago", and ISO dates.
pub fn parse_time_expr(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = text.trim().to_lowercase();
    match trimmed.as_str() {
        "now" => return Some(now),
        "today" => return midnight(now.date_naive(), now),
        "yesterday" => return midnight(now.date_naive() - Duration::days(1), now),
        _ => {}
    }

    if let Some(captures) = RELATIVE_TIME_RE.captures(&trimmed) {
        let amount: i64 = captures[1].parse().ok()?;
        let delta = match &captures[2] {
            "minute" => Duration::minutes(amount),
            "hour" => Duration::hours(amount),
            "day" => Duration::days(amount),
            "week" => Duration::weeks(amount),
            _ => return None,
        };
        return Some(now - delta);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&trimmed, "%Y-%m-%d") {
        return midnight(date, now);
    }
    None
}

fn midnight(date: NaiveDate, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).single()
}

/// Find a query window in the text; `default_lookback` applies when nothing
/// is named. End is always now. The bool reports whether the window came
/// from the text.
fn extract_window(
    text: &str,
    now: DateTime<Utc>,
    default_lookback: Duration,
) -> (DateTime<Utc>, DateTime<Utc>, bool) {
    let lowered = text.to_lowercase();
    if let Some(captures) = RELATIVE_TIME_RE.captures(&lowered) {
        if let Some(start) = parse_time_expr(&captures[0], now) {
            return (start, now, true);
        }
    }
    if lowered.contains("yesterday") {
        if let (Some(start), Some(end)) = (
            midnight(now.date_naive() - Duration::days(1), now),
            midnight(now.date_naive(), now),
        ) {
            return (start, end, true);
        }
    }
    if lowered.contains("today") {
        if let Some(start) = midnight(now.date_naive(), now) {
            return (start, now, true);
        }
    }
    (now - default_lookback, now, false)
}

/// Classify a cleaned message into a structured request.
pub fn parse_request(text: &str, now: DateTime<Utc>) -> ParsedRequest {
    let cleaned = strip_mentions(text);
    let lowered = cleaned.to_lowercase();

    if cleaned.is_empty() || lowered == "help" {
        return ParsedRequest {
            intent: RequestIntent::Help,
            start_time: now,
            end_time: now,
            explicit_window: false,
        };
    }

    let (intent, default_lookback) = if lowered.contains("which account")
        || lowered.contains("find account")
        || lowered.contains("search account")
        || lowered.contains("look up account")
    {
        (RequestIntent::FindAccount, Duration::days(1))
    } else if lowered.contains("login") || lowered.contains("console") || lowered.contains("sign-in")
    {
        (RequestIntent::ConsoleLogins, Duration::days(7))
    } else if lowered.contains("error") || lowered.contains("denied") || lowered.contains("failed")
    {
        (RequestIntent::ErrorEvents, Duration::days(1))
    } else if lowered.contains("security")
        || lowered.contains("audit")
        || lowered.contains("review")
        || lowered.contains("suspicious")
    {
        (RequestIntent::SecurityReview, Duration::days(7))
    } else {
        let username = USERNAME_RE
            .captures(&cleaned)
            .map(|c| c[1].to_string());
        let event_name = extract_event_name(&cleaned);
        (
            RequestIntent::LookupEvents {
                event_name,
                username,
            },
            Duration::days(1),
        )
    };

    let (start_time, end_time, explicit_window) = extract_window(&cleaned, now, default_lookback);
    ParsedRequest {
        intent,
        start_time,
        end_time,
        explicit_window,
    }
}

/// A CamelCase API event name mentioned verbatim, e.g. "CreateUser".
fn extract_event_name(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .find(|w| {
            w.len() > 5
                && w.chars().next().is_some_and(|c| c.is_ascii_uppercase())
                && w.chars().skip(1).any(|c| c.is_ascii_uppercase())
                && w.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(str::to_string)
}
