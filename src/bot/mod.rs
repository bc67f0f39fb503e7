//! Chat bot core: account resolution, credential brokering, CloudTrail
//! queries, and per-thread conversation state.

pub mod broker;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod params;
pub mod query;
pub mod reply;
pub mod sdk_errors;
pub mod session;
pub mod transport;
