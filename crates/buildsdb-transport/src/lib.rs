//! HTTP transport for buildsdb: plain and conditional document fetches plus
//! an optional numbered dump of everything downloaded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, LAST_MODIFIED};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "buildsdb-transport";

/// Response header used as the cache-validation token.
pub const CACHE_TOKEN_HEADER: reqwest::header::HeaderName = LAST_MODIFIED;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// The remote token matched the known one; `body` is empty.
    pub waived: bool,
    pub body: Vec<u8>,
    pub cache_token: Option<String>,
}

impl Fetched {
    pub fn waived() -> Self {
        Self {
            waived: true,
            body: Vec::new(),
            cache_token: None,
        }
    }

    pub fn content(body: Vec<u8>, cache_token: Option<String>) -> Self {
        Self {
            waived: false,
            body,
            cache_token,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Other(String),
}

/// Source of upstream documents. The HTTP implementation is [`HttpFetcher`].
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Fetch `url`, skipping the download when `known_token` is non-empty and
    /// equals the token the server currently reports.
    async fn fetch_conditional(
        &self,
        url: &str,
        known_token: Option<&str>,
    ) -> Result<Fetched, FetchError>;

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.fetch_conditional(url, None).await?.body)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Outbound proxy, e.g. `socks5://localhost:9050`.
    pub proxy: Option<String>,
    /// When set, every downloaded body is written to numbered files here.
    pub debug_dump_dir: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            proxy: None,
            debug_dump_dir: None,
        }
    }
}

/// Writes `debug.<n>.url.txt` / `debug.<n>.content.json` pairs. Numbers start
/// at 1 and are handed out atomically, so concurrent fetches never collide.
#[derive(Debug)]
pub struct DebugDump {
    dir: PathBuf,
    next: AtomicU64,
}

impl DebugDump {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next: AtomicU64::new(1),
        }
    }

    fn next_number(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn write(&self, url: &str, body: &[u8]) -> u64 {
        let number = self.next_number();
        let url_path = self.dir.join(format!("debug.{number}.url.txt"));
        let body_path = self.dir.join(format!("debug.{number}.content.json"));
        if let Err(err) = fs::write(&url_path, url).await {
            warn!(path = %url_path.display(), error = %err, "failed to write debug dump");
        }
        if let Err(err) = fs::write(&body_path, body).await {
            warn!(path = %body_path.display(), error = %err, "failed to write debug dump");
        }
        number
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    dump: Option<DebugDump>,
}

fn cache_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CACHE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn request_error(url: &str) -> impl FnOnce(reqwest::Error) -> FetchError + '_ {
    move |source| FetchError::Request {
        url: url.to_string(),
        source,
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        // Proxying is driven by the config only, not by ambient env lookup.
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .no_proxy()
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .with_context(|| format!("parsing proxy address {proxy}"))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            dump: config.debug_dump_dir.map(DebugDump::new),
        })
    }

    /// HEAD request; returns whether the server's token equals `known`.
    async fn token_unchanged(&self, url: &str, known: &str) -> Result<bool, FetchError> {
        let resp = self.client.head(url).send().await.map_err(request_error(url))?;
        let status = resp.status();
        if !status.is_success() {
            debug!(%status, "HEAD not successful, falling back to a full fetch");
            return Ok(false);
        }
        match cache_token(resp.headers()) {
            Some(current) if current == known => Ok(true),
            Some(current) => {
                debug!(%known, %current, "cache token changed");
                Ok(false)
            }
            None => {
                warn!("no Last-Modified header in the HEAD response");
                Ok(false)
            }
        }
    }

    async fn get(&self, url: &str) -> Result<Fetched, FetchError> {
        let resp = self.client.get(url).send().await.map_err(request_error(url))?;
        let status: StatusCode = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let token = cache_token(resp.headers());
        if token.is_none() {
            debug!("no Last-Modified header in the response");
        }
        let body = resp.bytes().await.map_err(request_error(url))?.to_vec();

        if let Some(dump) = &self.dump {
            let number = dump.write(url, &body).await;
            debug!(number, "dumped downloaded document");
        }

        Ok(Fetched::content(body, token))
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch_conditional(
        &self,
        url: &str,
        known_token: Option<&str>,
    ) -> Result<Fetched, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            if let Some(known) = known_token.filter(|t| !t.is_empty()) {
                if self.token_unchanged(url, known).await? {
                    debug!("waived unchanged document");
                    return Ok(Fetched::waived());
                }
            }
            self.get(url).await
        }
        .instrument(span)
        .await
    }
}
