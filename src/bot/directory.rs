//! Account directory: resolves a human-supplied account reference to the
//! metadata needed for the bridge-role chain.
//!
//! An exact 12-digit account id wins outright. Anything else goes through
//! case-insensitive fuzzy matching against display names, ranked by score with
//! ties broken by shortest name. Multiple surviving candidates are never
//! silently collapsed; the caller gets the list back to put in front of the
//! user.

use super::clock::Clock;
use super::error::BotError;
use super::params::ParameterStore;
use super::sdk_errors::backoff_delay;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Immutable metadata for one reachable AWS account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: String,
    pub display_name: String,
    pub bridge_role_arn: String,
    pub target_role_arn: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// External metadata store. Could be a database, parameter store, or static
/// config; the directory treats it as a pure lookup function.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    /// Return every record that could plausibly match the reference.
    async fn lookup(&self, reference: &str) -> Result<Vec<AccountRecord>>;
}

/// Backend over a static JSON document of account records.
pub struct StaticDirectoryBackend {
    records: Vec<AccountRecord>,
}

impl StaticDirectoryBackend {
    pub fn new(records: Vec<AccountRecord>) -> Self {
        Self { records }
    }

    pub fn from_json(document: &str) -> Result<Self> {
        let records: Vec<AccountRecord> =
            serde_json::from_str(document).context("Failed to parse account directory document")?;
        Ok(Self::new(records))
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read accounts file {}", path))?;
        Self::from_json(&document)
    }

    fn matches(record: &AccountRecord, normalized: &str) -> bool {
        record.account_id == normalized
            || record.display_name.to_lowercase().contains(normalized)
    }
}

#[async_trait]
impl DirectoryBackend for StaticDirectoryBackend {
    async fn lookup(&self, reference: &str) -> Result<Vec<AccountRecord>> {
        let normalized = reference.trim().to_lowercase();
        Ok(self
            .records
            .iter()
            .filter(|r| Self::matches(r, &normalized))
            .cloned()
            .collect())
    }
}

/// Backend that pulls the directory document from a single SSM parameter.
/// The document is re-fetched on every cache miss, so parameter updates show
/// up within one cache TTL.
pub struct ParameterDirectoryBackend {
    store: Arc<dyn ParameterStore>,
    parameter_name: String,
}

impl ParameterDirectoryBackend {
    pub fn new(store: Arc<dyn ParameterStore>, parameter_name: String) -> Self {
        Self {
            store,
            parameter_name,
        }
    }
}

#[async_trait]
impl DirectoryBackend for ParameterDirectoryBackend {
    async fn lookup(&self, reference: &str) -> Result<Vec<AccountRecord>> {
        let document = self.store.get(&self.parameter_name).await.with_context(|| {
            format!(
                "Failed to load account directory from parameter {}",
                self.parameter_name
            )
        })?;
        let backend = StaticDirectoryBackend::from_json(&document)?;
        backend.lookup(reference).await
    }
}

struct CacheEntry {
    candidates: Vec<AccountRecord>,
    loaded_at: chrono::DateTime<chrono::Utc>,
}

/// Resolver with a TTL'd lookup cache in front of the backend.
pub struct AccountDirectory {
    backend: Arc<dyn DirectoryBackend>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    cache_ttl: chrono::Duration,
    lookup_timeout: Duration,
    retry_attempts: u32,
    disambiguation_limit: usize,
    matcher: SkimMatcherV2,
}

impl AccountDirectory {
    pub fn new(
        backend: Arc<dyn DirectoryBackend>,
        clock: Arc<dyn Clock>,
        cache_ttl: chrono::Duration,
        lookup_timeout: Duration,
        retry_attempts: u32,
        disambiguation_limit: usize,
    ) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            clock,
            cache_ttl,
            lookup_timeout,
            retry_attempts: retry_attempts.max(1),
            disambiguation_limit: disambiguation_limit.max(2),
            matcher: SkimMatcherV2::default().ignore_case(),
        }
    }

    /// Resolve a reference to exactly one account record.
    pub async fn resolve(&self, reference: &str) -> Result<AccountRecord, BotError> {
        let normalized = reference.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(BotError::NotFound {
                reference: reference.to_string(),
            });
        }

        let candidates = self.candidates_for(&normalized).await?;

        // Exact account-id match wins outright; fuzzy matching is skipped.
        if is_account_id(&normalized) {
            return candidates
                .into_iter()
                .find(|r| r.account_id == normalized)
                .ok_or_else(|| BotError::NotFound {
                    reference: reference.to_string(),
                });
        }

        let mut scored: Vec<(i64, AccountRecord)> = candidates
            .into_iter()
            .filter_map(|record| {
                self.matcher
                    .fuzzy_match(&record.display_name, &normalized)
                    .map(|score| (score, record))
            })
            .collect();

        if scored.is_empty() {
            return Err(BotError::NotFound {
                reference: reference.to_string(),
            });
        }

        // Score descending, ties broken by shortest display name, then by
        // name for determinism.
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.display_name.len().cmp(&b.1.display_name.len()))
                .then(a.1.display_name.cmp(&b.1.display_name))
        });

        if scored.len() == 1 {
            return Ok(scored.remove(0).1);
        }

        // A case-insensitive exact name match beats other fuzzy hits.
        if scored[0].1.display_name.to_lowercase() == normalized {
            return Ok(scored.remove(0).1);
        }

        let candidates: Vec<AccountRecord> = scored
            .into_iter()
            .take(self.disambiguation_limit)
            .map(|(_, record)| record)
            .collect();
        Err(BotError::Ambiguous {
            reference: reference.to_string(),
            candidates,
        })
    }

    /// Candidate list for a normalized reference, from cache when fresh.
    async fn candidates_for(&self, normalized: &str) -> Result<Vec<AccountRecord>, BotError> {
        let now = self.clock.now();
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(normalized) {
                if now - entry.loaded_at < self.cache_ttl {
                    debug!(reference = normalized, "Directory cache hit");
                    return Ok(entry.candidates.clone());
                }
            }
        }

        let candidates = self.lookup_with_retry(normalized).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            normalized.to_string(),
            CacheEntry {
                candidates: candidates.clone(),
                loaded_at: now,
            },
        );
        Ok(candidates)
    }

    async fn lookup_with_retry(&self, normalized: &str) -> Result<Vec<AccountRecord>, BotError> {
        let mut last_error = None;
        for attempt in 0..self.retry_attempts {
            // Each attempt is bounded; a hung backend reads as a failure.
            let outcome = tokio::time::timeout(self.lookup_timeout, self.backend.lookup(normalized))
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("directory lookup timed out")));
            match outcome {
                Ok(candidates) => {
                    debug!(
                        reference = normalized,
                        count = candidates.len(),
                        "Directory lookup completed"
                    );
                    return Ok(candidates);
                }
                Err(e) => {
                    warn!(
                        reference = normalized,
                        attempt = attempt + 1,
                        error = %e,
                        "Directory backend lookup failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.retry_attempts {
                        tokio::time::sleep(backoff_delay(attempt, Duration::from_millis(200)))
                            .await;
                    }
                }
            }
        }
        Err(BotError::DirectoryUnavailable(
            last_error.unwrap_or_else(|| anyhow::anyhow!("directory backend returned no result")),
        ))
    }

    /// Drop cache entries older than the TTL.
    pub async fn evict_stale(&self) -> usize {
        let now = self.clock.now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| now - entry.loaded_at < self.cache_ttl);
        before - cache.len()
    }
}

/// True when the reference is a bare 12-digit AWS account id.
pub fn is_account_id(reference: &str) -> bool {
    reference.len() == 12 && reference.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn record(id: &str, name: &str) -> AccountRecord {
        AccountRecord {
            account_id: id.to_string(),
            display_name: name.to_string(),
            bridge_role_arn: "arn:aws:iam::999999999999:role/bridge".to_string(),
            target_role_arn: format!("arn:aws:iam::{}:role/audit", id),
            external_id: None,
        }
    }

    fn directory(records: Vec<AccountRecord>) -> (AccountDirectory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let dir = AccountDirectory::new(
            Arc::new(StaticDirectoryBackend::new(records)),
            clock.clone(),
            chrono::Duration::minutes(5),
            Duration::from_secs(5),
            3,
            5,
        );
        (dir, clock)
    }

    #[tokio::test]
    async fn exact_account_id_wins_outright() {
        let (dir, _) = directory(vec![
            record("123456789012", "Acme Corp"),
            record("210987654321", "Acme Labs"),
        ]);
        let resolved = dir.resolve("123456789012").await.unwrap();
        assert_eq!(resolved.display_name, "Acme Corp");
    }

    #[tokio::test]
    async fn unknown_account_id_is_not_found() {
        let (dir, _) = directory(vec![record("123456789012", "Acme Corp")]);
        let err = dir.resolve("000000000000").await.unwrap_err();
        assert!(matches!(err, BotError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unique_name_match_resolves() {
        let (dir, _) = directory(vec![
            record("123456789012", "Acme Corp"),
            record("210987654321", "Globex"),
        ]);
        let resolved = dir.resolve("globex").await.unwrap();
        assert_eq!(resolved.account_id, "210987654321");
    }

    #[tokio::test]
    async fn multiple_matches_fail_ambiguous_with_candidates() {
        let (dir, _) = directory(vec![
            record("123456789012", "Acme Corp"),
            record("210987654321", "Acme Labs"),
        ]);
        match dir.resolve("Acme").await.unwrap_err() {
            BotError::Ambiguous { candidates, .. } => {
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected Ambiguous, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exact_name_beats_other_fuzzy_hits() {
        let (dir, _) = directory(vec![
            record("123456789012", "Acme"),
            record("210987654321", "Acme Labs"),
        ]);
        let resolved = dir.resolve("acme").await.unwrap();
        assert_eq!(resolved.account_id, "123456789012");
    }

    #[tokio::test]
    async fn nothing_matching_is_not_found() {
        let (dir, _) = directory(vec![record("123456789012", "Acme Corp")]);
        let err = dir.resolve("zzzz").await.unwrap_err();
        assert!(matches!(err, BotError::NotFound { .. }));
    }

    struct CountingBackend {
        inner: StaticDirectoryBackend,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryBackend for CountingBackend {
        async fn lookup(&self, reference: &str) -> Result<Vec<AccountRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(reference).await
        }
    }

    #[tokio::test]
    async fn cache_entries_expire_after_ttl() {
        let backend = Arc::new(CountingBackend {
            inner: StaticDirectoryBackend::new(vec![record("123456789012", "Acme Corp")]),
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let dir = AccountDirectory::new(
            backend.clone(),
            clock.clone(),
            chrono::Duration::minutes(5),
            Duration::from_secs(5),
            3,
            5,
        );

        dir.resolve("acme corp").await.unwrap();
        dir.resolve("acme corp").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::minutes(6));
        dir.resolve("acme corp").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    struct FailingBackend;

    #[async_trait]
    impl DirectoryBackend for FailingBackend {
        async fn lookup(&self, _reference: &str) -> Result<Vec<AccountRecord>> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn backend_failure_surfaces_after_bounded_retries() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let dir = AccountDirectory::new(
            Arc::new(FailingBackend),
            clock,
            chrono::Duration::minutes(5),
            Duration::from_secs(5),
            2,
            5,
        );
        let err = dir.resolve("acme").await.unwrap_err();
        assert!(matches!(err, BotError::DirectoryUnavailable(_)));
    }

    struct HangingBackend;

    #[async_trait]
    impl DirectoryBackend for HangingBackend {
        async fn lookup(&self, _reference: &str) -> Result<Vec<AccountRecord>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn hung_backend_is_cut_off_per_attempt() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let dir = AccountDirectory::new(
            Arc::new(HangingBackend),
            clock,
            chrono::Duration::minutes(5),
            Duration::from_millis(50),
            1,
            5,
        );
        let started = std::time::Instant::now();
        let err = dir.resolve("acme").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, BotError::DirectoryUnavailable(_)));
    }

    #[tokio::test]
    async fn loads_records_from_a_json_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"account_id":"123456789012","display_name":"Acme Corp",
                "bridge_role_arn":"arn:aws:iam::999999999999:role/bridge",
                "target_role_arn":"arn:aws:iam::123456789012:role/audit"}}]"#
        )
        .unwrap();

        let backend = StaticDirectoryBackend::from_file(file.path().to_str().unwrap()).unwrap();
        let hits = backend.lookup("acme").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].external_id, None);
    }

    #[test]
    fn account_id_shape() {
        assert!(is_account_id("123456789012"));
        assert!(!is_account_id("12345678901"));
        assert!(!is_account_id("12345678901a"));
    }
}
