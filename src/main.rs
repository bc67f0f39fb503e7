#![warn(clippy::all, rust_2018_idioms)]

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use trailwatch::bot::broker::{AwsStsApi, CredentialBroker};
use trailwatch::bot::clock::SystemClock;
use trailwatch::bot::config::BotConfig;
use trailwatch::bot::directory::{
    AccountDirectory, DirectoryBackend, ParameterDirectoryBackend, StaticDirectoryBackend,
};
use trailwatch::bot::orchestrator::{AwsCloudTrailConnector, Orchestrator};
use trailwatch::bot::params::SsmParameterStore;
use trailwatch::bot::query::QueryEngine;
use trailwatch::bot::session::SessionStore;
use trailwatch::bot::transport::{InboundEvent, StdioTransport};

/// Sweep interval for session and directory-cache eviction.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

fn init_logging() {
    // RUST_LOG wins; the default keeps SDK internals quiet.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::builder()
            .parse(
                "trailwatch=info,aws_config=warn,aws_sigv4=warn,aws_smithy_runtime=warn,\
                 aws_smithy_runtime_api=warn,aws_smithy_http=warn,hyper=warn",
            )
            .expect("Failed to parse env filter")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    tracing::info!(
        branch = env!("GIT_BRANCH"),
        commit = env!("GIT_COMMIT"),
        "trailwatch starting"
    );

    let config = BotConfig::from_env();
    let clock = Arc::new(SystemClock);

    let backend: Arc<dyn DirectoryBackend> = match &config.accounts_file {
        Some(path) => {
            tracing::info!(path = %path, "Loading account directory from local file");
            Arc::new(
                StaticDirectoryBackend::from_file(path)
                    .with_context(|| format!("Failed to load accounts from {}", path))?,
            )
        }
        None => {
            tracing::info!(
                parameter = %config.directory_parameter,
                "Loading account directory from SSM"
            );
            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            Arc::new(ParameterDirectoryBackend::new(
                Arc::new(SsmParameterStore::new(&sdk_config)),
                config.directory_parameter.clone(),
            ))
        }
    };

    let directory = Arc::new(AccountDirectory::new(
        backend,
        clock.clone(),
        config.directory_cache_ttl,
        config.directory_lookup_timeout,
        config.retry_attempts,
        config.disambiguation_limit,
    ));
    let broker = Arc::new(CredentialBroker::new(
        Arc::new(AwsStsApi::new(config.region.clone())),
        clock.clone(),
        config.assume_role_timeout,
        config.session_duration_secs,
        config.retry_attempts,
    ));
    let engine = Arc::new(QueryEngine::new(
        clock.clone(),
        config.max_window_days,
        config.max_events_cap,
        config.query_budget,
        config.retry_attempts,
    ));
    let sessions = Arc::new(SessionStore::new(
        clock.clone(),
        config.session_inactivity,
        config.session_capacity,
    ));

    let shutdown = CancellationToken::new();
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        directory,
        broker,
        engine,
        sessions,
        Arc::new(StdioTransport),
        Arc::new(AwsCloudTrailConnector),
        clock,
        shutdown.clone(),
    ));

    let maintenance = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.run_maintenance(MAINTENANCE_INTERVAL).await;
        })
    };

    // Line protocol on stdin: "<thread_id>\t<text>"; a line without a tab
    // lands in a shared local thread. Every stdin line counts as a mention.
    tracing::info!("Reading events from stdin; ctrl-c to stop");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (thread_id, text) = match line.split_once('\t') {
                    Some((thread_id, text)) => (thread_id.to_string(), text.to_string()),
                    None => ("local".to_string(), line),
                };
                let event = InboundEvent {
                    thread_id,
                    text,
                    is_mention: true,
                };
                tokio::spawn(orchestrator.clone().handle_event(event));
            }
        }
    }

    shutdown.cancel();
    maintenance.await.ok();
    tracing::info!("trailwatch stopped");
    Ok(())
}
