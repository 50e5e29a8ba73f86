//! One sync run: discover servers, read the stored cache tokens, fetch the
//! build tree, merge it into SQLite.

pub mod merge;
pub mod orchestrator;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use buildsdb_core::BranchFailure;
use buildsdb_documents::{decode_document, parse_server_list};
use buildsdb_transport::{DocumentFetcher, HttpClientConfig, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use merge::{merge_tree, GroupPolicy, MergeReport};
pub use orchestrator::{FailurePolicy, FetchStrategy, Orchestrator, DEFAULT_WORKERS};
pub use store::{list_groups, open_existing_store, open_store, set_groups_enabled, GroupFilter, GroupRow};

pub const CRATE_NAME: &str = "buildsdb-sync";

pub const DEFAULT_STATUS_API: &str = "https://pkg-status.freebsd.org/api/1/builds?type=package";
pub const DEFAULT_STATUS_BASE: &str = "https://pkg-status.freebsd.org";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub strategy: FetchStrategy,
    pub failure_policy: FailurePolicy,
    pub dump_dir: Option<PathBuf>,
    pub proxy: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Explicit server base URLs; discovery is skipped when non-empty.
    pub servers: Vec<String>,
    pub status_api_url: String,
    pub status_base_url: String,
    pub recent_days: i64,
    pub disabled_group_patterns: Vec<String>,
}

fn is_on(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|v| is_on(&v));
        let strategy = if flag("BUILDSDB_SEQUENTIAL") {
            FetchStrategy::Sequential
        } else {
            FetchStrategy::Parallel {
                workers: lookup("BUILDSDB_WORKERS")
                    .and_then(|v| v.trim().parse().ok())
                    .filter(|&n: &usize| n > 0)
                    .unwrap_or(DEFAULT_WORKERS),
            }
        };
        let dump_dir = flag("BUILDSDB_DUMP_DOWNLOADED_FILES").then(|| {
            lookup("BUILDSDB_DUMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
        });

        Self {
            database_path: lookup("BUILDSDB_DATABASE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("builds.sqlite")),
            strategy,
            failure_policy: if flag("BUILDSDB_STRICT") {
                FailurePolicy::AbortRun
            } else {
                FailurePolicy::Isolate
            },
            dump_dir,
            proxy: lookup("HTTP_PROXY").filter(|v| !v.trim().is_empty()),
            http_timeout_secs: lookup("BUILDSDB_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(60),
            user_agent: lookup("BUILDSDB_USER_AGENT")
                .unwrap_or_else(|| format!("buildsdb/{}", env!("CARGO_PKG_VERSION"))),
            servers: lookup("BUILDSDB_SERVERS").map(|v| split_list(&v)).unwrap_or_default(),
            status_api_url: lookup("BUILDSDB_STATUS_API").unwrap_or_else(|| DEFAULT_STATUS_API.to_string()),
            status_base_url: lookup("BUILDSDB_STATUS_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_STATUS_BASE.to_string()),
            recent_days: lookup("BUILDSDB_RECENT_DAYS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(14),
            disabled_group_patterns: lookup("BUILDSDB_DISABLED_GROUPS")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| merge::DEFAULT_DISABLED_GROUPS.map(String::from).to_vec()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub servers: usize,
    pub groups: usize,
    pub builds_seen: usize,
    pub builds_written: usize,
    pub builds_waived: usize,
    pub failures: Vec<BranchFailure>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: Arc<dyn DocumentFetcher>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            proxy: config.proxy.clone(),
            debug_dump_dir: config.dump_dir.clone(),
        })?;
        Ok(Self::with_fetcher(config, Arc::new(http)))
    }

    pub fn with_fetcher(config: SyncConfig, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        Self { config, fetcher }
    }

    /// Configured servers, or the ones the status API reports as having
    /// started a build within the recent window.
    pub async fn discover_servers(&self) -> Result<Vec<String>> {
        let servers = if self.config.servers.is_empty() {
            let body = self
                .fetcher
                .fetch(&self.config.status_api_url)
                .await
                .context("fetching the build server list")?;
            let doc = decode_document(&body).context("reading the build server list")?;
            let cutoff = Utc::now().timestamp() - self.config.recent_days * 24 * 60 * 60;
            parse_server_list(&doc, cutoff)
                .into_iter()
                .map(|name| format!("{}/{}", self.config.status_base_url, name))
                .collect()
        } else {
            self.config.servers.clone()
        };
        if servers.is_empty() {
            bail!("the build server list is empty");
        }
        info!("found {} build server(s)", servers.len());
        Ok(servers)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let pool = open_store(&self.config.database_path).await?;
        let servers = self.discover_servers().await?;
        let tokens = store::load_cache_tokens(&pool).await?;

        let orchestrator = Orchestrator::new(
            Arc::clone(&self.fetcher),
            self.config.strategy,
            self.config.failure_policy,
        );
        let tree = orchestrator.fetch_tree(servers, tokens).await?;
        for failure in &tree.failures {
            warn!(%failure, "branch not imported, stored rows left as they were");
        }

        let policy = GroupPolicy::new(self.config.disabled_group_patterns.iter().cloned());
        let report = merge_tree(&pool, &tree, &policy).await?;
        pool.close().await;

        info!(
            written = report.written,
            waived = report.waived,
            failures = tree.failures.len(),
            "successfully imported {} build(s) from {} server(s)",
            report.written,
            tree.servers.len()
        );
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            servers: tree.servers.len(),
            groups: tree.group_count(),
            builds_seen: tree.build_count(),
            builds_written: report.written,
            builds_waived: report.waived,
            failures: tree.failures,
        })
    }
}
