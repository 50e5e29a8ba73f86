use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use buildsdb_sync::{SyncConfig, SyncPipeline};
use buildsdb_transport::{DocumentFetcher, FetchError, Fetched};
use serde_json::{json, Value};

const SERVER: &str = "https://beefy.test";

#[derive(Default)]
struct FakeUpstream {
    docs: Mutex<HashMap<String, (String, Option<String>)>>,
    requested: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn put(&self, url: &str, body: Value, token: Option<&str>) {
        self.docs
            .lock()
            .unwrap()
            .insert(url.to_string(), (body.to_string(), token.map(str::to_string)));
    }

    fn downloaded(&self) -> Vec<String> {
        std::mem::take(&mut *self.requested.lock().unwrap())
    }
}

#[async_trait]
impl DocumentFetcher for FakeUpstream {
    async fn fetch_conditional(&self, url: &str, known_token: Option<&str>) -> Result<Fetched, FetchError> {
        let (body, token) = self
            .docs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })?;
        if known_token.is_some_and(|k| !k.is_empty() && Some(k) == token.as_deref()) {
            return Ok(Fetched::waived());
        }
        self.requested.lock().unwrap().push(url.to_string());
        Ok(Fetched::content(body.into_bytes(), token))
    }
}

fn detail(build: &str, ports: Value) -> Value {
    json!({
        "mastername": "140amd64-default",
        "buildname": build,
        "jailname": "140amd64",
        "ports": ports
    })
}

fn publish(upstream: &FakeUpstream) {
    upstream.put(
        &format!("{SERVER}/data/.data.json"),
        json!({"masternames": {"140amd64-default": {"latest": {}}}}),
        None,
    );
    upstream.put(
        &format!("{SERVER}/data/140amd64-default/.data.json"),
        json!({"builds": {
            "latest": {"buildname": "b2", "jailname": "140amd64", "started": "1700000500", "ended": "0", "status": "parallel_build"},
            "b1": {"buildname": "b1", "jailname": "140amd64", "started": "1700000000", "ended": "1700000400", "status": "done"},
            "b2": {"buildname": "b2", "jailname": "140amd64", "started": "1700000500", "ended": "0", "status": "parallel_build"}
        }}),
        None,
    );
    upstream.put(
        &format!("{SERVER}/data/140amd64-default/b1/.data.json"),
        detail(
            "b1",
            json!({
                "built": [{"origin": "www/nginx", "pkgname": "nginx-1.24.0", "elapsed": "61"}],
                "failed": [{"origin": "lang/rust", "pkgname": "rust-1.74.0", "phase": "build", "errortype": "runaway_process", "elapsed": "7200"}]
            }),
        ),
        Some("Tue, 14 Nov 2023 22:20:00 GMT"),
    );
    upstream.put(
        &format!("{SERVER}/data/140amd64-default/b2/.data.json"),
        detail(
            "b2",
            json!({
                "tobuild": [{"origin": "www/nginx"}],
                "queued": [{"origin": "www/nginx", "pkgname": "nginx-1.26.0", "reason": "www/nginx"}]
            }),
        ),
        Some("Tue, 14 Nov 2023 22:30:00 GMT"),
    );
}

fn config(dir: &tempfile::TempDir) -> SyncConfig {
    let db = dir.path().join("builds.sqlite");
    let mut vars = HashMap::new();
    vars.insert("BUILDSDB_DATABASE", db.display().to_string());
    vars.insert("BUILDSDB_SERVERS", SERVER.to_string());
    SyncConfig::from_lookup(|name| vars.get(name).cloned())
}

async fn count(db: &std::path::Path, table: &str) -> i64 {
    let pool = buildsdb_sync::open_existing_store(db, "count").await.unwrap();
    let n = sqlx_count(&pool, table).await;
    pool.close().await;
    n
}

async fn sqlx_count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn second_run_waives_unchanged_builds() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let db = config.database_path.clone();
    let upstream = Arc::new(FakeUpstream::default());
    publish(&upstream);
    let pipeline = SyncPipeline::with_fetcher(config, upstream.clone());

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.servers, 1);
    assert_eq!(first.groups, 1);
    assert_eq!(first.builds_seen, 2);
    assert_eq!(first.builds_written, 2);
    assert_eq!(first.builds_waived, 0);
    assert!(first.failures.is_empty());
    assert_eq!(count(&db, "built").await, 1);
    assert_eq!(count(&db, "failed").await, 1);
    assert_eq!(count(&db, "queued").await, 1);
    upstream.downloaded();

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.builds_written, 0);
    assert_eq!(second.builds_waived, 2);
    assert_ne!(second.run_id, first.run_id);
    let downloaded = upstream.downloaded();
    assert_eq!(downloaded.len(), 2, "only the two index documents: {downloaded:?}");
}

#[tokio::test]
async fn changed_build_is_replaced_and_broken_build_keeps_old_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let db = config.database_path.clone();
    let upstream = Arc::new(FakeUpstream::default());
    publish(&upstream);
    let pipeline = SyncPipeline::with_fetcher(config, upstream.clone());
    pipeline.run_once().await.unwrap();

    upstream.put(
        &format!("{SERVER}/data/140amd64-default/b2/.data.json"),
        detail(
            "b2",
            json!({
                "built": [{"origin": "www/nginx", "pkgname": "nginx-1.26.0", "elapsed": "58"}],
                "ignored": [{"origin": "x11/old", "pkgname": "old-1", "reason": "deprecated"}]
            }),
        ),
        Some("Tue, 14 Nov 2023 23:00:00 GMT"),
    );
    upstream.put(
        &format!("{SERVER}/data/140amd64-default/b1/.data.json"),
        detail("b1", json!({"built": [], "surprise": []})),
        Some("Tue, 14 Nov 2023 23:05:00 GMT"),
    );

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.builds_written, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].build.as_deref(), Some("b1"));
    assert!(summary.failures[0].message.contains("surprise"));

    assert_eq!(count(&db, "queued").await, 0);
    assert_eq!(count(&db, "ignored").await, 1);
    // b1 kept its rows, b2 now has one built row
    assert_eq!(count(&db, "built").await, 2);
    assert_eq!(count(&db, "failed").await, 1);
}

#[tokio::test]
async fn strict_policy_merges_nothing_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.failure_policy = buildsdb_sync::FailurePolicy::AbortRun;
    let db = config.database_path.clone();
    let upstream = Arc::new(FakeUpstream::default());
    publish(&upstream);
    upstream.put(
        &format!("{SERVER}/data/140amd64-default/b2/.data.json"),
        json!({"mastername": "140i386-default", "buildname": "b2", "jailname": "140amd64"}),
        Some("x"),
    );

    let err = SyncPipeline::with_fetcher(config, upstream).run_once().await.unwrap_err();
    assert!(err.to_string().contains("mastername"), "{err}");
    assert_eq!(count(&db, "build").await, 0);
}

#[tokio::test]
async fn servers_are_discovered_from_the_status_api() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.servers.clear();
    config.status_api_url = "https://status.test/api/1/builds".to_string();
    config.status_base_url = "https://status.test".to_string();
    let now = chrono::Utc::now().timestamp();
    let upstream = Arc::new(FakeUpstream::default());
    upstream.put(
        &config.status_api_url,
        json!([
            {"server": "beefy18", "started": (now - 60).to_string()},
            {"server": "beefy6", "started": now - 100 * 86_400},
            {"nested": {"server": "beefy18", "started": now - 5}}
        ]),
        None,
    );

    let pipeline = SyncPipeline::with_fetcher(config, upstream);
    let servers = pipeline.discover_servers().await.unwrap();
    assert_eq!(servers, vec!["https://status.test/beefy18"]);
}
