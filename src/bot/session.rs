//! Thread-scoped conversation sessions.
//!
//! One live session per thread id. The store owns all mutation: callers go
//! through `get_or_create` / `update` / `evict_stale`, and the orchestrator
//! serializes whole turns per thread through `turn_lock`. No durability;
//! sessions die with the process.

use super::clock::Clock;
use super::directory::AccountRecord;
use super::intent;
use super::query::QuerySpec;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Rolling history cap per session, user and assistant turns combined.
const MAX_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub thread_id: String,
    pub resolved_account: Option<AccountRecord>,
    pub last_query_spec: Option<QuerySpec>,
    pub history: VecDeque<HistoryEntry>,
    pub last_updated: DateTime<Utc>,
    pub turn_count: u64,
}

impl Session {
    fn new(thread_id: String, now: DateTime<Utc>) -> Self {
        Self {
            thread_id,
            resolved_account: None,
            last_query_spec: None,
            history: VecDeque::new(),
            last_updated: now,
            turn_count: 0,
        }
    }

    pub fn push_history(&mut self, role: Role, text: impl Into<String>) {
        self.history.push_back(HistoryEntry {
            role,
            text: text.into(),
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

/// How an inbound message relates to the thread's prior state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationDecision {
    /// Same account as before; prior query parameters stay relevant.
    Continue,
    /// The message names a different account; resolve afresh and overwrite.
    SwitchAccount(String),
    /// No account resolved yet; this reference starts the first resolution.
    ResolveFirst(String),
    /// No account resolved and none named; the user must be asked.
    NeedsAccount,
}

/// Pure continuation policy: a message continues the last query iff the
/// thread already has a resolved account and the text does not name a
/// different one.
pub fn decide_continuation(session: &Session, text: &str) -> ContinuationDecision {
    let named = intent::extract_account_reference(text);
    match (&session.resolved_account, named) {
        (Some(account), Some(reference)) => {
            if refers_to(account, &reference) {
                ContinuationDecision::Continue
            } else {
                ContinuationDecision::SwitchAccount(reference)
            }
        }
        (Some(_), None) => ContinuationDecision::Continue,
        (None, Some(reference)) => ContinuationDecision::ResolveFirst(reference),
        (None, None) => ContinuationDecision::NeedsAccount,
    }
}

fn refers_to(account: &AccountRecord, reference: &str) -> bool {
    let normalized = reference.trim().to_lowercase();
    account.account_id == normalized || account.display_name.to_lowercase() == normalized
}

struct Slot {
    session: Session,
    turn_lock: Arc<Mutex<()>>,
}

/// In-memory session store keyed by thread id.
pub struct SessionStore {
    slots: RwLock<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    inactivity: chrono::Duration,
    capacity: usize,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, inactivity: chrono::Duration, capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock,
            inactivity,
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of the session for a thread, creating an empty one on first
    /// sight. Never fails.
    pub async fn get_or_create(&self, thread_id: &str) -> Session {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(thread_id) {
                return slot.session.clone();
            }
        }

        let now = self.clock.now();
        let mut slots = self.slots.write().await;
        let slot = slots.entry(thread_id.to_string()).or_insert_with(|| Slot {
            session: Session::new(thread_id.to_string(), now),
            turn_lock: Arc::new(Mutex::new(())),
        });
        let session = slot.session.clone();
        drop(slots);

        self.enforce_capacity().await;
        session
    }

    /// Whether a live session exists for the thread.
    pub async fn contains(&self, thread_id: &str) -> bool {
        self.slots.read().await.contains_key(thread_id)
    }

    /// Per-thread serialization handle. A second message for a thread queues
    /// behind the in-flight one on this lock; distinct threads proceed
    /// concurrently.
    pub async fn turn_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(thread_id) {
                return Arc::clone(&slot.turn_lock);
            }
        }
        let now = self.clock.now();
        let mut slots = self.slots.write().await;
        let slot = slots.entry(thread_id.to_string()).or_insert_with(|| Slot {
            session: Session::new(thread_id.to_string(), now),
            turn_lock: Arc::new(Mutex::new(())),
        });
        Arc::clone(&slot.turn_lock)
    }

    /// Apply a mutation atomically with respect to other updates on the same
    /// thread id. Touches `last_updated`.
    pub async fn update<F>(&self, thread_id: &str, mutate: F)
    where
        F: FnOnce(&mut Session),
    {
        let now = self.clock.now();
        let mut slots = self.slots.write().await;
        let slot = slots.entry(thread_id.to_string()).or_insert_with(|| Slot {
            session: Session::new(thread_id.to_string(), now),
            turn_lock: Arc::new(Mutex::new(())),
        });
        mutate(&mut slot.session);
        slot.session.last_updated = now;
    }

    /// Evict sessions idle past the inactivity window.
    pub async fn evict_stale(&self) -> usize {
        let now = self.clock.now();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|thread_id, slot| {
            let keep = now - slot.session.last_updated < self.inactivity;
            if !keep {
                debug!(thread_id = %thread_id, "Evicting stale session");
            }
            keep
        });
        before - slots.len()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Drop the oldest sessions when over capacity.
    async fn enforce_capacity(&self) {
        let mut slots = self.slots.write().await;
        while slots.len() > self.capacity {
            let oldest = slots
                .iter()
                .min_by_key(|(_, slot)| slot.session.last_updated)
                .map(|(thread_id, _)| thread_id.clone());
            match oldest {
                Some(thread_id) => {
                    debug!(thread_id = %thread_id, "Evicting session over capacity");
                    slots.remove(&thread_id);
                }
                None => break,
            }
        }
    }
}
