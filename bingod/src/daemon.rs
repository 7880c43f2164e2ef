use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bingo_core::BingoClient;
use tokio::time::Instant;

use crate::sync::backoff::{Backoff, RetryPolicy};
use crate::sync::connectivity::{Connectivity, probe_remote};
use crate::sync::executor::HttpSyncExecutor;
use crate::sync::manager::{DRAIN_LEASE_TTL, MAX_DRAIN_CONCURRENCY, QueueManager};
use crate::sync::queue::now_millis;
use crate::sync::store::{LocalStore, default_db_path};

const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 300;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;
const DEFAULT_DRAIN_CONCURRENCY: u64 = 1;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub db_path: PathBuf,
    pub drain_interval: Duration,
    pub probe_interval: Duration,
    /// How often the queue database is re-read for items written by other
    /// processes or coming off backoff.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: bool,
    pub drain_concurrency: usize,
    pub keep_synced: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("BINGO_API_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("BINGO_API_URL is not set")?;
        let api_token = lookup("BINGO_API_TOKEN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let db_path = match lookup("BINGO_DB_PATH") {
            Some(value) if value.trim().starts_with('~') => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(value.trim(), &home)
            }
            Some(value) => PathBuf::from(value.trim()),
            None => default_db_path().context("failed to resolve default queue database path")?,
        };
        let read = |name: &str, default: u64| parse_u64_or(lookup(name).as_deref(), default);

        Ok(Self {
            api_url,
            api_token,
            db_path,
            drain_interval: Duration::from_secs(read(
                "BINGO_DRAIN_INTERVAL_SECS",
                DEFAULT_DRAIN_INTERVAL_SECS,
            )),
            probe_interval: Duration::from_secs(read(
                "BINGO_PROBE_INTERVAL_SECS",
                DEFAULT_PROBE_INTERVAL_SECS,
            )),
            poll_interval: Duration::from_secs(read(
                "BINGO_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )),
            request_timeout: Duration::from_secs(read(
                "BINGO_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            max_attempts: u32::try_from(read("BINGO_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS))
                .unwrap_or(u32::MAX),
            backoff_base: Duration::from_millis(read(
                "BINGO_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )),
            backoff_max: Duration::from_secs(read(
                "BINGO_BACKOFF_MAX_SECS",
                DEFAULT_BACKOFF_MAX_SECS,
            )),
            backoff_jitter: parse_bool_or(lookup("BINGO_BACKOFF_JITTER").as_deref(), false),
            drain_concurrency: clamp_concurrency(read(
                "BINGO_DRAIN_CONCURRENCY",
                DEFAULT_DRAIN_CONCURRENCY,
            )),
            keep_synced: parse_bool_or(lookup("BINGO_KEEP_SYNCED").as_deref(), false),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Backoff::new(self.backoff_base, self.backoff_max, self.backoff_jitter),
            self.max_attempts,
        )
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: BingoClient,
    manager: Arc<QueueManager>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = BingoClient::with_options(
            &config.api_url,
            config.api_token.clone(),
            Some(config.request_timeout),
        )
        .context("invalid BINGO_API_URL")?;
        let store = LocalStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open queue database at {:?}", config.db_path))?;
        let executor = Arc::new(HttpSyncExecutor::new(
            client.clone(),
            config.request_timeout,
        ));
        let manager = Arc::new(
            QueueManager::new(
                store,
                executor,
                config.retry_policy(),
                Connectivity::new(false),
            )
            .with_concurrency(config.drain_concurrency)
            .with_lease_ttl(DRAIN_LEASE_TTL.max(config.request_timeout * 2)),
        );

        Ok(Self {
            config,
            client,
            manager,
        })
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Checks the remote once and publishes the result to the connectivity
    /// observer.
    pub async fn probe(&self) -> bool {
        let online = probe_remote(&self.client).await;
        self.manager.connectivity().set_online(online);
        online
    }

    pub async fn shutdown(&self) {
        self.manager.store().close().await;
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let online = self.probe().await;
        tracing::info!(
            endpoint = %self.client.endpoint(),
            db = %self.config.db_path.display(),
            online,
            drain_interval_secs = self.config.drain_interval.as_secs(),
            "bingod started"
        );

        let manager_for_listener = Arc::clone(&self.manager);
        let listener_handle = tokio::spawn(async move {
            manager_for_listener.run_connectivity_listener().await;
        });

        let probe_client = self.client.clone();
        let probe_connectivity = self.manager.connectivity().clone();
        let probe_interval = self.config.probe_interval;
        let probe_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(probe_interval).await;
                let online = probe_remote(&probe_client).await;
                probe_connectivity.set_online(online);
            }
        });

        let scheduler_handle = tokio::spawn(run_scheduler(
            Arc::clone(&self.manager),
            self.config.drain_interval,
            self.config.poll_interval,
            self.config.keep_synced,
        ));

        let result = tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal");
        tracing::info!("shutting down");

        listener_handle.abort();
        probe_handle.abort();
        scheduler_handle.abort();
        self.shutdown().await;

        result
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
