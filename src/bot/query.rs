//! CloudTrail query engine.
//!
//! Pages through the event-lookup API with continuation tokens, normalizes
//! events into a bounded digest, and prefers clearly-labeled partial answers
//! over opaque timeouts: when the wall-clock budget or the rate-limit retry
//! budget runs out, whatever was gathered so far comes back with
//! `truncated = true`.

use super::broker::TemporaryCredentials;
use super::clock::Clock;
use super::error::BotError;
use super::sdk_errors::{backoff_delay, classify, AwsErrorClass};
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// CloudTrail accepts at most one lookup attribute per call; extra entries
/// are applied client-side where possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupAttribute {
    pub key: String,
    pub value: String,
}

/// One structured query against a target account's event history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub account_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub event_name_filters: BTreeSet<String>,
    pub lookup_attributes: Vec<LookupAttribute>,
    /// Keep only events that carry an error code.
    pub errors_only: bool,
    pub max_events: usize,
}

/// Normalized CloudTrail event, produced fresh per query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDigestItem {
    pub event_time: DateTime<Utc>,
    pub event_name: String,
    pub event_source: String,
    pub source_ip_address: Option<String>,
    pub user_identity: String,
    pub error_code: Option<String>,
    pub mfa_used: Option<bool>,
}

/// Bounded digest for one query.
#[derive(Debug, Clone, Default)]
pub struct EventDigest {
    pub items: Vec<EventDigestItem>,
    pub truncated: bool,
}

/// Raw event as returned by one page of the lookup API.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    pub event_time: Option<DateTime<Utc>>,
    pub event_name: Option<String>,
    pub event_source: Option<String>,
    pub username: Option<String>,
    /// The embedded CloudTrailEvent JSON payload, if present.
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    pub next_token: Option<String>,
}

/// CloudTrail-compatible event-lookup API seam.
#[async_trait]
pub trait LookupEventsApi: Send + Sync {
    async fn lookup_page(
        &self,
        spec: &QuerySpec,
        next_token: Option<&str>,
        page_size: i32,
    ) -> Result<EventPage>;
}

/// Production backend over an `aws_sdk_cloudtrail` client signed with the
/// acquired target-account credentials.
pub struct CloudTrailLookupApi {
    client: aws_sdk_cloudtrail::Client,
}

impl CloudTrailLookupApi {
    pub async fn connect(credentials: &TemporaryCredentials, region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials.to_aws_credentials())
            .load()
            .await;
        Self {
            client: aws_sdk_cloudtrail::Client::new(&config),
        }
    }
}

#[async_trait]
impl LookupEventsApi for CloudTrailLookupApi {
    async fn lookup_page(
        &self,
        spec: &QuerySpec,
        next_token: Option<&str>,
        page_size: i32,
    ) -> Result<EventPage> {
        let mut request = self
            .client
            .lookup_events()
            .start_time(aws_smithy_types::DateTime::from_millis(
                spec.start_time.timestamp_millis(),
            ))
            .end_time(aws_smithy_types::DateTime::from_millis(
                spec.end_time.timestamp_millis(),
            ))
            .max_results(page_size);

        // The API supports a single attribute; the engine filters the rest.
        if let Some(attr) = spec.lookup_attributes.first() {
            let lookup_attr = aws_sdk_cloudtrail::types::LookupAttribute::builder()
                .attribute_key(aws_sdk_cloudtrail::types::LookupAttributeKey::from(
                    attr.key.as_str(),
                ))
                .attribute_value(&attr.value)
                .build()?;
            request = request.lookup_attributes(lookup_attr);
        }

        if let Some(token) = next_token {
            request = request.next_token(token);
        }

        let response = request.send().await?;

        let events = response
            .events
            .unwrap_or_default()
            .into_iter()
            .map(|event| RawEvent {
                event_time: event.event_time.and_then(|t| {
                    DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())
                }),
                event_name: event.event_name,
                event_source: event.event_source,
                username: event.username,
                payload: event.cloud_trail_event,
            })
            .collect();

        Ok(EventPage {
            events,
            next_token: response.next_token,
        })
    }
}

/// Executes validated query specs against a lookup backend.
pub struct QueryEngine {
    clock: Arc<dyn Clock>,
    max_window: chrono::Duration,
    max_events_cap: usize,
    budget: Duration,
    retry_attempts: u32,
}

impl QueryEngine {
    pub fn new(
        clock: Arc<dyn Clock>,
        max_window_days: i64,
        max_events_cap: usize,
        budget: Duration,
        retry_attempts: u32,
    ) -> Self {
        Self {
            clock,
            max_window: chrono::Duration::days(max_window_days),
            max_events_cap,
            budget,
            retry_attempts: retry_attempts.max(1),
        }
    }

    /// Reject malformed or too-costly specs before any network call.
    fn validate(&self, spec: &QuerySpec) -> Result<(), BotError> {
        if spec.start_time > spec.end_time {
            return Err(BotError::InvalidQuery {
                reason: "start time is after end time".to_string(),
            });
        }
        if spec.max_events == 0 {
            return Err(BotError::InvalidQuery {
                reason: "max events must be positive".to_string(),
            });
        }
        let window = spec.end_time - spec.start_time;
        if window > self.max_window {
            return Err(BotError::QueryTooBroad {
                window_days: window.num_days(),
                max_days: self.max_window.num_days(),
            });
        }
        Ok(())
    }

    /// Run the query; canonical order is event time descending, stable
    /// within identical timestamps.
    pub async fn execute(
        &self,
        api: &dyn LookupEventsApi,
        spec: &QuerySpec,
        credentials: &TemporaryCredentials,
    ) -> Result<EventDigest, BotError> {
        self.validate(spec)?;

        // Fail closed on stale material instead of retrying with it.
        if credentials.is_expired(self.clock.now()) {
            return Err(BotError::CredentialsExpired {
                account_id: spec.account_id.clone(),
            });
        }

        let max_events = spec.max_events.min(self.max_events_cap);
        let deadline = Instant::now() + self.budget;

        let mut items: Vec<EventDigestItem> = Vec::new();
        let mut next_token: Option<String> = None;
        let mut truncated = false;

        'pages: loop {
            let remaining = max_events.saturating_sub(items.len());
            if remaining == 0 {
                break;
            }
            let page_size = remaining.min(50) as i32;

            let page = {
                let mut attempt = 0u32;
                loop {
                    let remaining_budget = deadline.saturating_duration_since(Instant::now());
                    if remaining_budget.is_zero() {
                        debug!(account_id = %spec.account_id, "Query budget exhausted");
                        truncated = true;
                        break 'pages;
                    }
                    // A hung page call must not outlive the budget either.
                    let outcome = tokio::time::timeout(
                        remaining_budget,
                        api.lookup_page(spec, next_token.as_deref(), page_size),
                    )
                    .await;
                    match outcome {
                        Err(_elapsed) => {
                            debug!(
                                account_id = %spec.account_id,
                                "Query budget exhausted mid-call"
                            );
                            truncated = true;
                            break 'pages;
                        }
                        Ok(Ok(page)) => break page,
                        Ok(Err(e)) => match classify(&e) {
                            AwsErrorClass::ExpiredToken => {
                                return Err(BotError::CredentialsExpired {
                                    account_id: spec.account_id.clone(),
                                });
                            }
                            class if class.is_transient() => {
                                attempt += 1;
                                if attempt >= self.retry_attempts {
                                    // Bounded attempts exhausted; an analyst
                                    // benefits from whatever was gathered.
                                    warn!(
                                        account_id = %spec.account_id,
                                        error = %e,
                                        "Retries exhausted, returning partial digest"
                                    );
                                    truncated = true;
                                    break 'pages;
                                }
                                let delay =
                                    backoff_delay(attempt - 1, Duration::from_millis(300));
                                debug!(
                                    account_id = %spec.account_id,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    "Transient lookup failure, backing off"
                                );
                                tokio::time::sleep(delay).await;
                            }
                            _ => {
                                warn!(
                                    account_id = %spec.account_id,
                                    error = %e,
                                    "Lookup failed, returning partial digest"
                                );
                                truncated = true;
                                break 'pages;
                            }
                        },
                    }
                }
            };

            for raw in &page.events {
                if let Some(item) = normalize_event(raw) {
                    if !passes_filters(spec, &item) {
                        continue;
                    }
                    items.push(item);
                    if items.len() >= max_events {
                        break;
                    }
                }
            }

            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }

        // Stable sort keeps original API order within equal timestamps.
        items.sort_by(|a, b| b.event_time.cmp(&a.event_time));
        items.truncate(max_events);

        info!(
            account_id = %spec.account_id,
            count = items.len(),
            truncated,
            "Query completed"
        );
        Ok(EventDigest { items, truncated })
    }
}

fn passes_filters(spec: &QuerySpec, item: &EventDigestItem) -> bool {
    if !spec.event_name_filters.is_empty() && !spec.event_name_filters.contains(&item.event_name) {
        return false;
    }
    if spec.errors_only && item.error_code.is_none() {
        return false;
    }
    true
}

/// Normalize one raw event; events without a timestamp are dropped.
pub fn normalize_event(raw: &RawEvent) -> Option<EventDigestItem> {
    let event_time = raw.event_time?;
    let payload: serde_json::Value = raw
        .payload
        .as_deref()
        .and_then(|p| serde_json::from_str(p).ok())
        .unwrap_or(serde_json::Value::Null);

    let source_ip_address = payload
        .get("sourceIPAddress")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let error_code = payload
        .get("errorCode")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mfa_used = payload
        .get("additionalEventData")
        .and_then(|d| d.get("MFAUsed"))
        .and_then(|v| v.as_str())
        .and_then(|v| match v {
            "Yes" => Some(true),
            "No" => Some(false),
            _ => None,
        });

    let user_identity = raw
        .username
        .clone()
        .or_else(|| summarize_user_identity(payload.get("userIdentity")))
        .unwrap_or_else(|| "unknown".to_string());

    Some(EventDigestItem {
        event_time,
        event_name: raw.event_name.clone().unwrap_or_else(|| "Unknown".to_string()),
        event_source: raw
            .event_source
            .clone()
            .or_else(|| {
                payload
                    .get("eventSource")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unknown".to_string()),
        source_ip_address,
        user_identity,
        error_code,
        mfa_used,
    })
}

/// Short identity summary: "Root", "IAMUser/alice", "AssumedRole/audit".
fn summarize_user_identity(identity: Option<&serde_json::Value>) -> Option<String> {
    let identity = identity?;
    let identity_type = identity.get("type").and_then(|v| v.as_str())?;
    let name = identity
        .get("userName")
        .and_then(|v| v.as_str())
        .or_else(|| {
            identity
                .get("arn")
                .and_then(|v| v.as_str())
                .and_then(|arn| arn.rsplit('/').next())
        });
    Some(match name {
        Some(name) if identity_type != "Root" => format!("{}/{}", identity_type, name),
        _ => identity_type.to_string(),
    })
}

/// True when the event's user identity is the account root.
pub fn is_root_activity(item: &EventDigestItem) -> bool {
    item.user_identity == "Root"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn fresh_credentials() -> TemporaryCredentials {
        TemporaryCredentials {
            access_key_id: "ASIAEXAMPLE".to_string(),
            secret_access_key: "k".to_string(),
            session_token: "t".to_string(),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
        }
    }

    fn spec(start: DateTime<Utc>, end: DateTime<Utc>, max_events: usize) -> QuerySpec {
        QuerySpec {
            account_id: "123456789012".to_string(),
            start_time: start,
            end_time: end,
            event_name_filters: BTreeSet::new(),
            lookup_attributes: Vec::new(),
            errors_only: false,
            max_events,
        }
    }

    fn raw(name: &str, at: DateTime<Utc>) -> RawEvent {
        RawEvent {
            event_time: Some(at),
            event_name: Some(name.to_string()),
            event_source: Some("iam.amazonaws.com".to_string()),
            username: Some("alice".to_string()),
            payload: None,
        }
    }

    fn engine() -> QueryEngine {
        QueryEngine::new(
            Arc::new(ManualClock::new(Utc::now())),
            90,
            1000,
            Duration::from_secs(30),
            3,
        )
    }

    /// Scripted page source; errors are returned before pages.
    struct ScriptedApi {
        responses: Mutex<Vec<Result<EventPage>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<EventPage>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LookupEventsApi for ScriptedApi {
        async fn lookup_page(
            &self,
            _spec: &QuerySpec,
            _next_token: Option<&str>,
            _page_size: i32,
        ) -> Result<EventPage> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(EventPage::default());
            }
            responses.remove(0)
        }
    }

    #[tokio::test]
    async fn window_over_maximum_is_rejected_before_any_call() {
        let now = Utc::now();
        let api = ScriptedApi::new(vec![]);
        let err = engine()
            .execute(
                &api,
                &spec(now - chrono::Duration::days(100), now, 50),
                &fresh_credentials(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::QueryTooBroad { .. }));
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn start_after_end_is_rejected() {
        let now = Utc::now();
        let api = ScriptedApi::new(vec![]);
        let err = engine()
            .execute(
                &api,
                &spec(now, now - chrono::Duration::hours(1), 50),
                &fresh_credentials(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn expired_credentials_fail_closed() {
        let now = Utc::now();
        let api = ScriptedApi::new(vec![]);
        let stale = TemporaryCredentials {
            expires_at: now - chrono::Duration::minutes(1),
            ..fresh_credentials()
        };
        let err = engine()
            .execute(&api, &spec(now - chrono::Duration::days(1), now, 50), &stale)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::CredentialsExpired { .. }));
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn paginates_until_exhaustion_and_sorts_descending() {
        let now = Utc::now();
        let t = |mins: i64| now - chrono::Duration::minutes(mins);
        let api = ScriptedApi::new(vec![
            Ok(EventPage {
                events: vec![raw("CreateUser", t(1)), raw("DeleteUser", t(5))],
                next_token: Some("page2".to_string()),
            }),
            Ok(EventPage {
                events: vec![raw("CreateRole", t(3))],
                next_token: None,
            }),
        ]);

        let digest = engine()
            .execute(
                &api,
                &spec(now - chrono::Duration::days(1), now, 50),
                &fresh_credentials(),
            )
            .await
            .unwrap();

        assert!(!digest.truncated);
        let names: Vec<&str> = digest.items.iter().map(|i| i.event_name.as_str()).collect();
        assert_eq!(names, vec!["CreateUser", "CreateRole", "DeleteUser"]);
        assert_eq!(api.call_count(), 2);
    }

    #[tokio::test]
    async fn never_returns_more_than_max_events() {
        let now = Utc::now();
        let events: Vec<RawEvent> = (0..30)
            .map(|i| raw("ConsoleLogin", now - chrono::Duration::minutes(i)))
            .collect();
        let api = ScriptedApi::new(vec![Ok(EventPage {
            events,
            next_token: Some("more".to_string()),
        })]);

        let digest = engine()
            .execute(
                &api,
                &spec(now - chrono::Duration::days(1), now, 10),
                &fresh_credentials(),
            )
            .await
            .unwrap();
        assert_eq!(digest.items.len(), 10);
    }

    #[tokio::test]
    async fn stable_order_within_identical_timestamps() {
        let now = Utc::now();
        let at = now - chrono::Duration::minutes(10);
        let api = ScriptedApi::new(vec![Ok(EventPage {
            events: vec![raw("First", at), raw("Second", at), raw("Third", at)],
            next_token: None,
        })]);

        let digest = engine()
            .execute(
                &api,
                &spec(now - chrono::Duration::days(1), now, 50),
                &fresh_credentials(),
            )
            .await
            .unwrap();
        let names: Vec<&str> = digest.items.iter().map(|i| i.event_name.as_str()).collect();
        assert_eq!(names, vec!["First", "Second", "Third"]);
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_returns_partial_with_truncation_marker() {
        let now = Utc::now();
        let api = ScriptedApi::new(vec![
            Ok(EventPage {
                events: vec![raw("CreateUser", now - chrono::Duration::minutes(1))],
                next_token: Some("page2".to_string()),
            }),
            Err(anyhow::anyhow!("ThrottlingException: Rate exceeded")),
            Err(anyhow::anyhow!("ThrottlingException: Rate exceeded")),
            Err(anyhow::anyhow!("ThrottlingException: Rate exceeded")),
        ]);

        let engine = QueryEngine::new(
            Arc::new(ManualClock::new(Utc::now())),
            90,
            1000,
            Duration::from_secs(30),
            3,
        );
        let digest = engine
            .execute(
                &api,
                &spec(now - chrono::Duration::days(1), now, 50),
                &fresh_credentials(),
            )
            .await
            .unwrap();

        assert!(digest.truncated);
        assert_eq!(digest.items.len(), 1);
    }

    /// First page is instant, every later page stalls.
    struct StallingApi {
        first_page: EventPage,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl LookupEventsApi for StallingApi {
        async fn lookup_page(
            &self,
            _spec: &QuerySpec,
            _next_token: Option<&str>,
            _page_size: i32,
        ) -> Result<EventPage> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == 1 {
                return Ok(self.first_page.clone());
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(EventPage::default())
        }
    }

    #[tokio::test]
    async fn budget_expiry_returns_partial_prefix_with_truncation_marker() {
        let now = Utc::now();
        let api = StallingApi {
            first_page: EventPage {
                events: vec![raw("CreateUser", now - chrono::Duration::minutes(1))],
                next_token: Some("page2".to_string()),
            },
            calls: Mutex::new(0),
        };

        let engine = QueryEngine::new(
            Arc::new(ManualClock::new(now)),
            90,
            1000,
            Duration::from_millis(100),
            3,
        );
        let started = std::time::Instant::now();
        let digest = engine
            .execute(
                &api,
                &spec(now - chrono::Duration::days(1), now, 50),
                &fresh_credentials(),
            )
            .await
            .unwrap();

        // The hung second page is cut off at the budget, not awaited.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(digest.truncated);
        assert_eq!(digest.items.len(), 1);
        assert_eq!(digest.items[0].event_name, "CreateUser");
    }

    #[tokio::test]
    async fn event_name_filters_apply_client_side() {
        let now = Utc::now();
        let api = ScriptedApi::new(vec![Ok(EventPage {
            events: vec![
                raw("CreateUser", now - chrono::Duration::minutes(1)),
                raw("ListBuckets", now - chrono::Duration::minutes(2)),
                raw("DeleteUser", now - chrono::Duration::minutes(3)),
            ],
            next_token: None,
        })]);

        let mut spec = spec(now - chrono::Duration::days(1), now, 50);
        spec.event_name_filters =
            BTreeSet::from(["CreateUser".to_string(), "DeleteUser".to_string()]);

        let digest = engine()
            .execute(&api, &spec, &fresh_credentials())
            .await
            .unwrap();
        let names: Vec<&str> = digest.items.iter().map(|i| i.event_name.as_str()).collect();
        assert_eq!(names, vec!["CreateUser", "DeleteUser"]);
    }

    #[tokio::test]
    async fn errors_only_keeps_events_with_error_codes() {
        let now = Utc::now();
        let mut denied = raw("PutBucketPolicy", now - chrono::Duration::minutes(1));
        denied.payload = Some(r#"{"errorCode":"AccessDenied"}"#.to_string());
        let api = ScriptedApi::new(vec![Ok(EventPage {
            events: vec![denied, raw("ListBuckets", now - chrono::Duration::minutes(2))],
            next_token: None,
        })]);

        let mut spec = spec(now - chrono::Duration::days(1), now, 50);
        spec.errors_only = true;

        let digest = engine()
            .execute(&api, &spec, &fresh_credentials())
            .await
            .unwrap();
        assert_eq!(digest.items.len(), 1);
        assert_eq!(digest.items[0].error_code.as_deref(), Some("AccessDenied"));
    }

    #[test]
    fn normalizes_payload_fields() {
        let raw = RawEvent {
            event_time: Some(Utc::now()),
            event_name: Some("ConsoleLogin".to_string()),
            event_source: None,
            username: None,
            payload: Some(
                r#"{
                    "eventSource": "signin.amazonaws.com",
                    "sourceIPAddress": "198.51.100.7",
                    "userIdentity": {"type": "IAMUser", "userName": "alice"},
                    "additionalEventData": {"MFAUsed": "Yes"}
                }"#
                .to_string(),
            ),
        };
        let item = normalize_event(&raw).unwrap();
        assert_eq!(item.event_source, "signin.amazonaws.com");
        assert_eq!(item.source_ip_address.as_deref(), Some("198.51.100.7"));
        assert_eq!(item.user_identity, "IAMUser/alice");
        assert_eq!(item.mfa_used, Some(true));
        assert_eq!(item.error_code, None);
    }

    #[test]
    fn root_identity_is_flagged() {
        let raw = RawEvent {
            event_time: Some(Utc::now()),
            event_name: Some("CreateAccessKey".to_string()),
            event_source: None,
            username: None,
            payload: Some(r#"{"userIdentity": {"type": "Root"}}"#.to_string()),
        };
        let item = normalize_event(&raw).unwrap();
        assert!(is_root_activity(&item));
    }

    #[test]
    fn events_without_timestamps_are_dropped() {
        let raw = RawEvent::default();
        assert!(normalize_event(&raw).is_none());
    }
}
