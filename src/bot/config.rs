//! Runtime configuration.
//!
//! Everything is overridable through `TRAILWATCH_*` environment variables and
//! falls back to defaults that match the deployed posture: 90-day query
//! ceiling, 30-second query budget, 15-minute role sessions, three attempts
//! for anything transient.

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Default region for CloudTrail queries.
    pub region: String,
    /// Hard ceiling on the query time window, in days.
    pub max_window_days: i64,
    /// Hard ceiling on events returned by one query.
    pub max_events_cap: usize,
    /// Default event count when the user does not ask for a number.
    pub default_max_events: usize,
    /// Wall-clock budget for one query; partial results after this.
    pub query_budget: Duration,
    /// Timeout for each assume-role hop.
    pub assume_role_timeout: Duration,
    /// Requested role session duration, seconds.
    pub session_duration_secs: i32,
    /// Attempt cap for transient AWS errors.
    pub retry_attempts: u32,
    /// Sessions idle longer than this are evicted.
    pub session_inactivity: chrono::Duration,
    /// Bound on live sessions; oldest evicted beyond this.
    pub session_capacity: usize,
    /// Directory lookup cache TTL.
    pub directory_cache_ttl: chrono::Duration,
    /// Per-attempt timeout for directory backend lookups.
    pub directory_lookup_timeout: Duration,
    /// How many candidates a disambiguation prompt lists.
    pub disambiguation_limit: usize,
    /// SSM parameter holding the account directory document, used when no
    /// local accounts file is configured.
    pub directory_parameter: String,
    /// Optional path to a local accounts JSON file (takes precedence).
    pub accounts_file: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            max_window_days: 90,
            max_events_cap: 1000,
            default_max_events: 50,
            query_budget: Duration::from_secs(30),
            assume_role_timeout: Duration::from_secs(5),
            session_duration_secs: 900,
            retry_attempts: 3,
            session_inactivity: chrono::Duration::hours(24),
            session_capacity: 1000,
            directory_cache_ttl: chrono::Duration::minutes(5),
            directory_lookup_timeout: Duration::from_secs(5),
            disambiguation_limit: 5,
            directory_parameter: "/trailwatch/accounts".to_string(),
            accounts_file: None,
        }
    }
}

impl BotConfig {
    /// Load configuration from the environment on top of defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(region) = std::env::var("TRAILWATCH_REGION") {
            config.region = region;
        } else if let Ok(region) = std::env::var("AWS_REGION") {
            config.region = region;
        }

        if let Some(days) = env_parse::<i64>("TRAILWATCH_MAX_WINDOW_DAYS") {
            config.max_window_days = days;
        }
        if let Some(cap) = env_parse::<usize>("TRAILWATCH_MAX_EVENTS") {
            config.max_events_cap = cap;
        }
        if let Some(default) = env_parse::<usize>("TRAILWATCH_DEFAULT_EVENTS") {
            config.default_max_events = default.min(config.max_events_cap);
        }
        if let Some(secs) = env_parse::<u64>("TRAILWATCH_QUERY_BUDGET_SECS") {
            config.query_budget = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TRAILWATCH_ASSUME_ROLE_TIMEOUT_SECS") {
            config.assume_role_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<i32>("TRAILWATCH_SESSION_DURATION_SECS") {
            // STS floor is 900 seconds.
            config.session_duration_secs = secs.max(900);
        }
        if let Some(attempts) = env_parse::<u32>("TRAILWATCH_RETRY_ATTEMPTS") {
            config.retry_attempts = attempts.clamp(1, 10);
        }
        if let Some(hours) = env_parse::<i64>("TRAILWATCH_SESSION_TTL_HOURS") {
            config.session_inactivity = chrono::Duration::hours(hours);
        }
        if let Some(cap) = env_parse::<usize>("TRAILWATCH_SESSION_CAPACITY") {
            config.session_capacity = cap.max(1);
        }
        if let Some(minutes) = env_parse::<i64>("TRAILWATCH_DIRECTORY_TTL_MINUTES") {
            config.directory_cache_ttl = chrono::Duration::minutes(minutes);
        }
        if let Some(secs) = env_parse::<u64>("TRAILWATCH_DIRECTORY_TIMEOUT_SECS") {
            config.directory_lookup_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = env_parse::<usize>("TRAILWATCH_DISAMBIGUATION_LIMIT") {
            config.disambiguation_limit = limit.max(2);
        }
        if let Ok(name) = std::env::var("TRAILWATCH_DIRECTORY_PARAMETER") {
            config.directory_parameter = name;
        }
        if let Ok(path) = std::env::var("TRAILWATCH_ACCOUNTS_FILE") {
            config.accounts_file = Some(path);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable value for {}: {:?}", key, raw);
            None
        }
    }
}
