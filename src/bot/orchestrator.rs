//! Turn orchestration.
//!
//! One inbound message is one turn: gate on mention, serialize per thread,
//! resolve the account, chain credentials, run the query, render the reply.
//! Credentials are acquired fresh inside each turn and dropped at its end;
//! nothing credential-shaped survives in the session.

use super::broker::{CredentialBroker, TemporaryCredentials};
use super::clock::Clock;
use super::config::BotConfig;
use super::directory::{AccountDirectory, AccountRecord};
use super::error::BotError;
use super::intent::{self, ParsedRequest, RequestIntent, SECURITY_EVENT_NAMES};
use super::query::{LookupAttribute, LookupEventsApi, QueryEngine, QuerySpec};
use super::reply;
use super::session::{self, ContinuationDecision, Role, SessionStore};
use super::transport::{ChatTransport, InboundEvent};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Console sign-in events are recorded in us-east-1 regardless of where the
/// account otherwise operates.
const SIGNIN_REGION: &str = "us-east-1";

/// Builds a per-account lookup client from freshly acquired credentials.
/// Seam for tests; production connects a real CloudTrail client.
#[async_trait]
pub trait CloudTrailConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &TemporaryCredentials,
        region: &str,
    ) -> Arc<dyn LookupEventsApi>;
}

/// Production connector over `aws_sdk_cloudtrail`.
pub struct AwsCloudTrailConnector;

#[async_trait]
impl CloudTrailConnector for AwsCloudTrailConnector {
    async fn connect(
        &self,
        credentials: &TemporaryCredentials,
        region: &str,
    ) -> Arc<dyn LookupEventsApi> {
        Arc::new(super::query::CloudTrailLookupApi::connect(credentials, region).await)
    }
}

pub struct Orchestrator {
    config: BotConfig,
    directory: Arc<AccountDirectory>,
    broker: Arc<CredentialBroker>,
    engine: Arc<QueryEngine>,
    sessions: Arc<SessionStore>,
    transport: Arc<dyn ChatTransport>,
    connector: Arc<dyn CloudTrailConnector>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BotConfig,
        directory: Arc<AccountDirectory>,
        broker: Arc<CredentialBroker>,
        engine: Arc<QueryEngine>,
        sessions: Arc<SessionStore>,
        transport: Arc<dyn ChatTransport>,
        connector: Arc<dyn CloudTrailConnector>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            directory,
            broker,
            engine,
            sessions,
            transport,
            connector,
            clock,
            shutdown,
        }
    }

    /// Process one inbound event end to end. Turns for the same thread are
    /// serialized on the session's lock; distinct threads run concurrently.
    pub async fn handle_event(self: Arc<Self>, event: InboundEvent) {
        // Channel chatter that neither mentions the bot nor belongs to a
        // live thread is not ours.
        if !event.is_mention && !self.sessions.contains(&event.thread_id).await {
            debug!(thread_id = %event.thread_id, "Ignoring message without mention or session");
            return;
        }

        let lock = self.sessions.turn_lock(&event.thread_id).await;
        let _turn = lock.lock().await;

        if self.shutdown.is_cancelled() {
            info!(thread_id = %event.thread_id, "Shutting down, dropping queued turn");
            return;
        }

        let text = intent::strip_mentions(&event.text);
        self.sessions
            .update(&event.thread_id, |s| {
                s.turn_count += 1;
                s.push_history(Role::User, text.clone());
            })
            .await;

        let reply_text = match self.run_turn(&event.thread_id, &text).await {
            Ok(reply_text) => reply_text,
            Err(error) => {
                warn!(
                    thread_id = %event.thread_id,
                    error_kind = error.kind(),
                    error = %error,
                    "Turn failed"
                );
                reply::render_error(&error)
            }
        };

        self.sessions
            .update(&event.thread_id, |s| {
                s.push_history(Role::Assistant, reply_text.clone());
            })
            .await;

        // Replies queued behind a shutdown are suppressed, not half-sent.
        if self.shutdown.is_cancelled() {
            info!(thread_id = %event.thread_id, "Shutting down, suppressing reply");
            return;
        }
        for chunk in reply::chunk_reply(&reply_text) {
            if let Err(e) = self.transport.send_reply(&event.thread_id, &chunk).await {
                warn!(thread_id = %event.thread_id, error = %e, "Failed to deliver reply");
                return;
            }
        }
    }

    async fn run_turn(&self, thread_id: &str, text: &str) -> Result<String, BotError> {
        let parsed = intent::parse_request(text, self.clock.now());

        if parsed.intent == RequestIntent::Help {
            return Ok(reply::help_text());
        }

        if parsed.intent == RequestIntent::FindAccount {
            let reference = match intent::extract_account_reference(text) {
                Some(reference) => reference,
                None => return Ok(reply::needs_account_prompt()),
            };
            let account = self.directory.resolve(&reference).await?;
            return Ok(reply::account_resolved(&account));
        }

        let account = self.account_for_turn(thread_id, text).await?;
        let account = match account {
            Some(account) => account,
            None => return Ok(reply::needs_account_prompt()),
        };

        let (mut spec, region) = self.build_spec(&account.account_id, &parsed);
        let region = region.as_str();

        // A follow-up that names no window keeps the span of the previous
        // query in this thread. Switching accounts cleared the stored spec,
        // so this only applies to genuine continuations.
        if !parsed.explicit_window {
            let session = self.sessions.get_or_create(thread_id).await;
            if let Some(last) = session.last_query_spec {
                spec.start_time = spec.end_time - (last.end_time - last.start_time);
            }
        }

        info!(
            thread_id,
            account_id = %account.account_id,
            intent = ?parsed.intent,
            start = %spec.start_time,
            end = %spec.end_time,
            "Running query turn"
        );

        // Fresh chain per turn; the credentials never outlive this scope.
        let credentials = self.broker.acquire(&account, thread_id).await?;
        let api = self.connector.connect(&credentials, region).await;
        let digest = self.engine.execute(api.as_ref(), &spec, &credentials).await?;

        self.sessions
            .update(thread_id, |s| {
                s.last_query_spec = Some(spec.clone());
            })
            .await;

        Ok(reply::render_digest(&account, &digest))
    }

    /// Settle which account this turn targets, updating the session when a
    /// new resolution happens. `None` means the user has to name one first.
    async fn account_for_turn(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<Option<AccountRecord>, BotError> {
        let session = self.sessions.get_or_create(thread_id).await;
        let decision = session::decide_continuation(&session, text);

        let reference = match decision {
            ContinuationDecision::Continue => return Ok(session.resolved_account),
            ContinuationDecision::NeedsAccount => return Ok(None),
            ContinuationDecision::SwitchAccount(reference)
            | ContinuationDecision::ResolveFirst(reference) => reference,
        };

        let account = self.directory.resolve(&reference).await?;
        debug!(
            thread_id,
            account_id = %account.account_id,
            "Resolved account for thread"
        );
        self.sessions
            .update(thread_id, |s| {
                s.resolved_account = Some(account.clone());
                // A new account invalidates the previous query context.
                s.last_query_spec = None;
            })
            .await;
        Ok(Some(account))
    }

    fn build_spec(&self, account_id: &str, parsed: &ParsedRequest) -> (QuerySpec, String) {
        let mut spec = QuerySpec {
            account_id: account_id.to_string(),
            start_time: parsed.start_time,
            end_time: parsed.end_time,
            event_name_filters: BTreeSet::new(),
            lookup_attributes: Vec::new(),
            errors_only: false,
            max_events: self.config.default_max_events,
        };
        let mut region = self.config.region.clone();

        match &parsed.intent {
            RequestIntent::ConsoleLogins => {
                spec.lookup_attributes.push(LookupAttribute {
                    key: "EventName".to_string(),
                    value: "ConsoleLogin".to_string(),
                });
                region = SIGNIN_REGION.to_string();
            }
            RequestIntent::ErrorEvents => {
                spec.errors_only = true;
            }
            RequestIntent::SecurityReview => {
                spec.event_name_filters =
                    SECURITY_EVENT_NAMES.iter().map(|n| n.to_string()).collect();
                spec.max_events = self.config.max_events_cap;
            }
            RequestIntent::LookupEvents {
                event_name,
                username,
            } => {
                if let Some(name) = event_name {
                    spec.lookup_attributes.push(LookupAttribute {
                        key: "EventName".to_string(),
                        value: name.clone(),
                    });
                }
                if let Some(user) = username {
                    spec.lookup_attributes.push(LookupAttribute {
                        key: "Username".to_string(),
                        value: user.clone(),
                    });
                }
            }
            RequestIntent::Help | RequestIntent::FindAccount => {}
        }

        (spec, region)
    }

    /// Periodic sweep of stale sessions and directory cache entries. Runs
    /// until shutdown is signaled.
    pub async fn run_maintenance(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let sessions = self.sessions.evict_stale().await;
                    let cache_entries = self.directory.evict_stale().await;
                    if sessions + cache_entries > 0 {
                        debug!(sessions, cache_entries, "Maintenance sweep evicted entries");
                    }
                }
            }
        }
    }
}
