//! Trailwatch - CloudTrail Security Chat Bot
//!
//! Trailwatch answers natural-language questions about CloudTrail activity
//! across a fleet of AWS accounts, from inside a chat thread. An analyst
//! names an account and what they want to see; the bot resolves the account,
//! assumes its way in, runs the query, and replies in the thread.
//!
//! # Architecture Overview
//!
//! A turn flows through five components, each behind a trait seam so tests
//! can substitute the AWS edges:
//!
//! - **Account Directory** ([`bot::directory`]): fuzzy resolution of account
//!   names and ids against a cached metadata backend
//! - **Credential Broker** ([`bot::broker`]): the two-hop bridge role chain
//!   that turns the bot's baseline identity into short-lived target-account
//!   credentials, fresh per turn
//! - **Query Engine** ([`bot::query`]): paginated CloudTrail event lookup
//!   under a wall-clock budget, with clearly-marked partial results
//! - **Session Store** ([`bot::session`]): per-thread conversation state
//!   with turn serialization, TTL and capacity eviction
//! - **Orchestrator** ([`bot::orchestrator`]): the turn state machine tying
//!   the above together behind a chat transport
//!
//! # Security Posture
//!
//! Credentials are never cached, never shared across threads, and never
//! rendered into replies or logs. Authorization failures are reported
//! immediately rather than retried; stale credentials fail closed.

#![warn(clippy::all, rust_2018_idioms)]

pub mod bot;
