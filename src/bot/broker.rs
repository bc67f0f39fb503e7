//! Credential broker: bridge role chaining.
//!
//! Every acquisition performs a fresh two-hop assumption: baseline identity →
//! bridge role → target role. No hop's output is cached or shared across chat
//! threads; a leaked credential expires in minutes and is scoped to exactly
//! one account. Transient STS errors are retried with bounded backoff;
//! authorization failures are reported immediately.

use super::clock::Clock;
use super::directory::AccountRecord;
use super::error::{BotError, RoleHop};
use super::sdk_errors::{backoff_delay, classify, AwsErrorClass};
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Short-lived credentials for one target account. Never persisted, never
/// logged in full.
#[derive(Clone)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TemporaryCredentials {
    /// Expired or within a one-minute safety margin of expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::minutes(1) >= self.expires_at
    }

    /// AWS SDK credentials for building per-account service clients.
    pub fn to_aws_credentials(&self) -> Credentials {
        Credentials::from_keys(
            &self.access_key_id,
            &self.secret_access_key,
            Some(self.session_token.clone()),
        )
    }
}

// Secret material must be redacted in any trace.
impl std::fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One assume-role invocation.
#[derive(Debug, Clone)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration_secs: i32,
    /// Credentials to call STS with; None means the bot's baseline identity.
    pub source: Option<TemporaryCredentials>,
}

/// STS-compatible API seam.
#[async_trait]
pub trait StsApi: Send + Sync {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<TemporaryCredentials>;
}

/// Production STS backend. A fresh client is built per hop because the second
/// hop must sign with the bridge session's credentials.
pub struct AwsStsApi {
    region: String,
}

impl AwsStsApi {
    pub fn new(region: String) -> Self {
        Self { region }
    }
}

#[async_trait]
impl StsApi for AwsStsApi {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<TemporaryCredentials> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));
        if let Some(source) = &request.source {
            loader = loader.credentials_provider(source.to_aws_credentials());
        }
        let config = loader.load().await;
        let client = aws_sdk_sts::Client::new(&config);

        let output = client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .duration_seconds(request.duration_secs)
            .set_external_id(request.external_id.clone())
            .send()
            .await?;

        let credentials = output
            .credentials
            .ok_or_else(|| anyhow::anyhow!("AssumeRole response carried no credentials"))?;

        let expiration = credentials.expiration;
        let expires_at = DateTime::<Utc>::from_timestamp(
            expiration.secs(),
            expiration.subsec_nanos(),
        )
        .ok_or_else(|| anyhow::anyhow!("AssumeRole returned an unrepresentable expiration"))?;

        Ok(TemporaryCredentials {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            session_token: credentials.session_token,
            expires_at,
        })
    }
}

/// Performs the two-hop bridge chain for one account.
pub struct CredentialBroker {
    sts: Arc<dyn StsApi>,
    clock: Arc<dyn Clock>,
    hop_timeout: Duration,
    session_duration_secs: i32,
    retry_attempts: u32,
}

impl CredentialBroker {
    pub fn new(
        sts: Arc<dyn StsApi>,
        clock: Arc<dyn Clock>,
        hop_timeout: Duration,
        session_duration_secs: i32,
        retry_attempts: u32,
    ) -> Self {
        Self {
            sts,
            clock,
            hop_timeout,
            session_duration_secs,
            retry_attempts: retry_attempts.max(1),
        }
    }

    /// Acquire target-account credentials via the fixed two-hop chain.
    pub async fn acquire(
        &self,
        account: &AccountRecord,
        thread_id: &str,
    ) -> Result<TemporaryCredentials, BotError> {
        let session_name = session_name_for_thread(thread_id);

        debug!(
            account_id = %account.account_id,
            session_name = %session_name,
            "Starting bridge role chain"
        );

        // Hop 1: baseline identity assumes the bridge role.
        let bridge_request = AssumeRoleRequest {
            role_arn: account.bridge_role_arn.clone(),
            session_name: session_name.clone(),
            external_id: None,
            duration_secs: self.session_duration_secs,
            source: None,
        };
        let bridge_session = self
            .assume_with_retry(&bridge_request, RoleHop::Bridge, &account.account_id)
            .await?;

        // Hop 2: bridge session assumes the target role.
        let target_request = AssumeRoleRequest {
            role_arn: account.target_role_arn.clone(),
            session_name,
            external_id: account.external_id.clone(),
            duration_secs: self.session_duration_secs,
            source: Some(bridge_session),
        };
        let target_session = self
            .assume_with_retry(&target_request, RoleHop::Target, &account.account_id)
            .await?;

        // Fail closed: never hand out stale material.
        let now = self.clock.now();
        if target_session.is_expired(now) {
            return Err(BotError::CredentialsExpired {
                account_id: account.account_id.clone(),
            });
        }

        info!(
            account_id = %account.account_id,
            expires_at = %target_session.expires_at,
            "Acquired target-account credentials"
        );
        Ok(target_session)
    }

    async fn assume_with_retry(
        &self,
        request: &AssumeRoleRequest,
        hop: RoleHop,
        account_id: &str,
    ) -> Result<TemporaryCredentials, BotError> {
        let mut throttled = false;
        for attempt in 0..self.retry_attempts {
            match tokio::time::timeout(self.hop_timeout, self.sts.assume_role(request)).await {
                Ok(Ok(credentials)) => {
                    debug!(account_id, hop = %hop, "Assume-role hop succeeded");
                    return Ok(credentials);
                }
                Ok(Err(e)) => match classify(&e) {
                    AwsErrorClass::AccessDenied => {
                        // Authorization failures are never retried.
                        let mentions_external_id =
                            format!("{:?}", e).contains("ExternalId");
                        warn!(
                            account_id,
                            hop = %hop,
                            error = %e,
                            "Assume-role denied"
                        );
                        if hop == RoleHop::Target
                            && request.external_id.is_some()
                            && mentions_external_id
                        {
                            return Err(BotError::ExternalIdMismatch {
                                account_id: account_id.to_string(),
                            });
                        }
                        return Err(BotError::AssumeRoleDenied {
                            hop,
                            account_id: account_id.to_string(),
                        });
                    }
                    class if class.is_transient() => {
                        throttled |= class == AwsErrorClass::Throttled;
                        warn!(
                            account_id,
                            hop = %hop,
                            attempt = attempt + 1,
                            error = %e,
                            "Transient assume-role failure"
                        );
                        if attempt + 1 < self.retry_attempts {
                            tokio::time::sleep(backoff_delay(attempt, Duration::from_millis(250)))
                                .await;
                        }
                    }
                    _ => {
                        warn!(account_id, hop = %hop, error = %e, "Assume-role failed");
                        return Err(unreachable_error(hop, account_id));
                    }
                },
                Err(_elapsed) => {
                    warn!(
                        account_id,
                        hop = %hop,
                        attempt = attempt + 1,
                        "Assume-role hop timed out"
                    );
                }
            }
        }

        if throttled {
            return Err(BotError::RateLimited {
                operation: "AssumeRole".to_string(),
            });
        }
        Err(unreachable_error(hop, account_id))
    }
}

fn unreachable_error(hop: RoleHop, account_id: &str) -> BotError {
    match hop {
        RoleHop::Bridge => BotError::BridgeUnreachable {
            account_id: account_id.to_string(),
        },
        RoleHop::Target => BotError::InternalTimeout {
            operation: "AssumeRole".to_string(),
        },
    }
}

/// Role session name encoding the requesting thread for audit traceability.
/// STS allows `[\w+=,.@-]{2,64}`.
pub fn session_name_for_thread(thread_id: &str) -> String {
    let sanitized: String = thread_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '+' | '=' | ',' | '.' | '@' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut name = format!("trailwatch-{}", sanitized);
    name.truncate(64);
    name
}
