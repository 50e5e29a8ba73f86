//! Writes a fetched tree into the store.
//!
//! Servers and master builds are inserted once and never updated here; a
//! master build's `enabled` flag is computed on insert only. Every build that
//! was not waived gets its row upserted and its detail rows fully replaced in
//! a single transaction. Waived builds are not touched at all.

use anyhow::{Context, Result};
use buildsdb_core::{BuildNode, DetailCategory, DetailRecord, FetchTree};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

pub const DEFAULT_DISABLED_GROUPS: [&str; 2] = ["124", "powerpc"];

/// Decides the initial `enabled` flag of a master build from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPolicy {
    disabled_patterns: Vec<String>,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DISABLED_GROUPS.map(String::from))
    }
}

impl GroupPolicy {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            disabled_patterns: patterns.into_iter().filter(|p| !p.is_empty()).collect(),
        }
    }

    pub fn enabled_on_insert(&self, group: &str) -> bool {
        !self.disabled_patterns.iter().any(|p| group.contains(p.as_str()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub written: usize,
    pub waived: usize,
}

pub async fn merge_tree(pool: &SqlitePool, tree: &FetchTree, policy: &GroupPolicy) -> Result<MergeReport> {
    let waived = tree.waived_count();
    let to_write = tree.build_count() - waived;
    let mut report = MergeReport { written: 0, waived };

    for server in tree.servers.values() {
        let server_id = upsert_server(pool, &server.url).await?;
        for group in server.groups.values() {
            let group_id = upsert_group(pool, server_id, &group.name, policy).await?;
            for build in &group.builds {
                if build.waived {
                    debug!(group = %group.name, build = %build.name(), "waived, store left as is");
                    continue;
                }
                report.written += 1;
                info!(
                    "saving the build #{} of {}: {}/{}",
                    report.written,
                    to_write,
                    group.name,
                    build.name()
                );
                replace_build(pool, group_id, build)
                    .await
                    .with_context(|| format!("saving build {}/{} from {}", group.name, build.name(), server.url))?;
            }
        }
    }
    Ok(report)
}

async fn upsert_server(pool: &SqlitePool, url: &str) -> Result<i64> {
    sqlx::query("INSERT INTO server (url) VALUES (?) ON CONFLICT (url) DO NOTHING")
        .bind(url)
        .execute(pool)
        .await
        .with_context(|| format!("inserting server {url}"))?;
    sqlx::query_scalar("SELECT id FROM server WHERE url = ?")
        .bind(url)
        .fetch_one(pool)
        .await
        .with_context(|| format!("looking up server {url}"))
}

async fn upsert_group(pool: &SqlitePool, server_id: i64, name: &str, policy: &GroupPolicy) -> Result<i64> {
    let inserted = sqlx::query(
        "INSERT INTO masterbuild (server_id, name, enabled) VALUES (?, ?, ?) ON CONFLICT (server_id, name) DO NOTHING",
    )
    .bind(server_id)
    .bind(name)
    .bind(policy.enabled_on_insert(name))
    .execute(pool)
    .await
    .with_context(|| format!("inserting master build {name}"))?;
    if inserted.rows_affected() > 0 {
        info!(group = %name, enabled = policy.enabled_on_insert(name), "new master build");
    }
    sqlx::query_scalar("SELECT id FROM masterbuild WHERE server_id = ? AND name = ?")
        .bind(server_id)
        .bind(name)
        .fetch_one(pool)
        .await
        .with_context(|| format!("looking up master build {name}"))
}

fn delete_details_sql(category: DetailCategory) -> &'static str {
    match category {
        DetailCategory::Queued => "DELETE FROM queued WHERE build_id = ?",
        DetailCategory::Built => "DELETE FROM built WHERE build_id = ?",
        DetailCategory::Failed => "DELETE FROM failed WHERE build_id = ?",
        DetailCategory::Ignored => "DELETE FROM ignored WHERE build_id = ?",
        DetailCategory::Skipped => "DELETE FROM skipped WHERE build_id = ?",
    }
}

/// Upsert the build row and swap its detail rows. Either all of it commits
/// or the previous state stays.
async fn replace_build(pool: &SqlitePool, group_id: i64, build: &BuildNode) -> sqlx::Result<()> {
    let summary = &build.summary;
    let mut tx = pool.begin().await?;

    // `started` is only written on insert.
    sqlx::query(
        r#"
        INSERT INTO build (masterbuild_id, name, started, ended, status, last_modified)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (masterbuild_id, name) DO UPDATE SET
            ended = excluded.ended,
            status = excluded.status,
            last_modified = excluded.last_modified
        "#,
    )
    .bind(group_id)
    .bind(&summary.buildname)
    .bind(summary.started)
    .bind(summary.ended)
    .bind(&summary.status)
    .bind(build.cache_token.as_deref().unwrap_or_default())
    .execute(&mut *tx)
    .await?;

    let build_id: i64 = sqlx::query_scalar("SELECT id FROM build WHERE masterbuild_id = ? AND name = ?")
        .bind(group_id)
        .bind(&summary.buildname)
        .fetch_one(&mut *tx)
        .await?;

    for category in DetailCategory::ALL {
        sqlx::query(delete_details_sql(category))
            .bind(build_id)
            .execute(&mut *tx)
            .await?;
    }
    for record in &build.details {
        insert_detail(&mut tx, build_id, record).await?;
    }

    tx.commit().await
}

async fn insert_detail(conn: &mut SqliteConnection, build_id: i64, record: &DetailRecord) -> sqlx::Result<()> {
    let query = match record {
        DetailRecord::Queued { origin, pkgname, reason } => {
            sqlx::query("INSERT INTO queued (build_id, origin, pkgname, reason) VALUES (?, ?, ?, ?)")
                .bind(build_id)
                .bind(origin)
                .bind(pkgname)
                .bind(reason)
        }
        DetailRecord::Built { origin, pkgname, elapsed } => {
            sqlx::query("INSERT INTO built (build_id, origin, pkgname, elapsed) VALUES (?, ?, ?, ?)")
                .bind(build_id)
                .bind(origin)
                .bind(pkgname)
                .bind(i64::from(*elapsed))
        }
        DetailRecord::Failed {
            origin,
            pkgname,
            phase,
            errortype,
            elapsed,
        } => sqlx::query(
            "INSERT INTO failed (build_id, origin, pkgname, phase, errortype, elapsed) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(build_id)
        .bind(origin)
        .bind(pkgname)
        .bind(phase)
        .bind(errortype)
        .bind(i64::from(*elapsed)),
        DetailRecord::Ignored { origin, pkgname, reason } => {
            sqlx::query("INSERT INTO ignored (build_id, origin, pkgname, reason) VALUES (?, ?, ?, ?)")
                .bind(build_id)
                .bind(origin)
                .bind(pkgname)
                .bind(reason)
        }
        DetailRecord::Skipped { origin, pkgname, depends } => {
            sqlx::query("INSERT INTO skipped (build_id, origin, pkgname, depends) VALUES (?, ?, ?, ?)")
                .bind(build_id)
                .bind(origin)
                .bind(pkgname)
                .bind(depends)
        }
    };
    query.execute(&mut *conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::scratch_store;
    use crate::store::{set_groups_enabled, list_groups, GroupFilter};
    use buildsdb_core::{BuildSummary, GroupNode, ServerNode};
    use std::collections::BTreeMap;

    const SERVER: &str = "https://pkg.test";

    /// Every row of every table, flattened to text, sorted.
    async fn snapshot(pool: &SqlitePool) -> Vec<String> {
        let queries = [
            "SELECT 'server|' || id || '|' || url FROM server",
            "SELECT 'masterbuild|' || id || '|' || server_id || '|' || name || '|' || enabled FROM masterbuild",
            "SELECT 'build|' || id || '|' || masterbuild_id || '|' || name || '|' || IFNULL(started, '') || '|' || IFNULL(ended, '') || '|' || IFNULL(status, '') || '|' || last_modified FROM build",
            "SELECT 'queued|' || build_id || '|' || origin || '|' || pkgname || '|' || reason FROM queued",
            "SELECT 'built|' || build_id || '|' || origin || '|' || pkgname || '|' || elapsed FROM built",
            "SELECT 'failed|' || build_id || '|' || origin || '|' || pkgname || '|' || phase || '|' || errortype || '|' || elapsed FROM failed",
            "SELECT 'ignored|' || build_id || '|' || origin || '|' || pkgname || '|' || reason FROM ignored",
            "SELECT 'skipped|' || build_id || '|' || origin || '|' || pkgname || '|' || depends FROM skipped",
        ];
        let mut rows = Vec::new();
        for query in queries {
            let part: Vec<String> = sqlx::query_scalar(query).fetch_all(pool).await.unwrap();
            rows.extend(part);
        }
        rows.sort();
        rows
    }

    fn build(name: &str, started: i64, token: &str, details: Vec<DetailRecord>) -> BuildNode {
        BuildNode {
            summary: BuildSummary {
                buildname: name.to_string(),
                jailname: "main".to_string(),
                started,
                ended: Some(started + 3_600),
                status: "done".to_string(),
            },
            waived: false,
            cache_token: Some(token.to_string()),
            details,
        }
    }

    fn details() -> Vec<DetailRecord> {
        vec![
            DetailRecord::Built {
                origin: "www/nginx".to_string(),
                pkgname: "nginx-1.25".to_string(),
                elapsed: 120,
            },
            DetailRecord::Failed {
                origin: "devel/broken".to_string(),
                pkgname: "broken-0.1".to_string(),
                phase: "build".to_string(),
                errortype: "compiler_error".to_string(),
                elapsed: 0,
            },
            DetailRecord::Skipped {
                origin: "devel/child".to_string(),
                pkgname: "child-2".to_string(),
                depends: "devel/broken".to_string(),
            },
        ]
    }

    fn tree(groups: Vec<(&str, Vec<BuildNode>)>) -> FetchTree {
        let groups: BTreeMap<String, GroupNode> = groups
            .into_iter()
            .map(|(name, builds)| {
                (
                    name.to_string(),
                    GroupNode {
                        name: name.to_string(),
                        builds,
                    },
                )
            })
            .collect();
        let mut servers = BTreeMap::new();
        servers.insert(
            SERVER.to_string(),
            ServerNode {
                url: SERVER.to_string(),
                groups,
            },
        );
        FetchTree {
            servers,
            failures: Vec::new(),
        }
    }

    #[test]
    fn deny_list_matches_substrings() {
        let policy = GroupPolicy::default();
        assert!(!policy.enabled_on_insert("main-124"));
        assert!(!policy.enabled_on_insert("140powerpc64-default"));
        assert!(policy.enabled_on_insert("main-amd64"));
        assert!(GroupPolicy::new(Vec::new()).enabled_on_insert("main-124"));
    }

    #[tokio::test]
    async fn new_groups_get_enabled_from_the_deny_list() {
        let (_dir, pool) = scratch_store().await;
        let fetched = tree(vec![
            ("main-124", vec![build("p1", 100, "a", Vec::new())]),
            ("main-amd64", vec![build("p1", 100, "a", Vec::new())]),
        ]);
        merge_tree(&pool, &fetched, &GroupPolicy::default()).await.unwrap();

        let groups = list_groups(&pool, GroupFilter::Any).await.unwrap();
        let flags: Vec<(&str, bool)> = groups.iter().map(|g| (g.name.as_str(), g.enabled)).collect();
        assert_eq!(flags, vec![("main-124", false), ("main-amd64", true)]);
    }

    #[tokio::test]
    async fn enabled_flag_survives_later_syncs() {
        let (_dir, pool) = scratch_store().await;
        let fetched = tree(vec![("main-amd64", vec![build("p1", 100, "a", Vec::new())])]);
        merge_tree(&pool, &fetched, &GroupPolicy::default()).await.unwrap();
        set_groups_enabled(&pool, &["amd64".to_string()], false).await.unwrap();

        let refetched = tree(vec![("main-amd64", vec![build("p1", 100, "b", Vec::new())])]);
        merge_tree(&pool, &refetched, &GroupPolicy::default()).await.unwrap();

        let groups = list_groups(&pool, GroupFilter::Disabled).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "main-amd64");
    }

    #[tokio::test]
    async fn waived_builds_leave_the_store_untouched() {
        let (_dir, pool) = scratch_store().await;
        let fetched = tree(vec![("main-amd64", vec![build("p1", 100, "a", details())])]);
        merge_tree(&pool, &fetched, &GroupPolicy::default()).await.unwrap();
        let before = snapshot(&pool).await;

        let mut waived = build("p1", 999, "", Vec::new());
        waived.summary.status = "crashed".to_string();
        waived.summary.ended = None;
        waived.waived = true;
        waived.cache_token = None;
        let report = merge_tree(&pool, &tree(vec![("main-amd64", vec![waived])]), &GroupPolicy::default())
            .await
            .unwrap();

        assert_eq!(report, MergeReport { written: 0, waived: 1 });
        assert_eq!(snapshot(&pool).await, before);
    }

    #[tokio::test]
    async fn identical_documents_replace_to_the_same_rows() {
        let (_dir, pool) = scratch_store().await;
        let fetched = tree(vec![("main-amd64", vec![build("p1", 100, "a", details())])]);
        merge_tree(&pool, &fetched, &GroupPolicy::default()).await.unwrap();
        let first = snapshot(&pool).await;
        let report = merge_tree(&pool, &fetched, &GroupPolicy::default()).await.unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(snapshot(&pool).await, first);
    }

    #[tokio::test]
    async fn replacement_drops_rows_missing_from_the_new_document() {
        let (_dir, pool) = scratch_store().await;
        let fetched = tree(vec![("main-amd64", vec![build("p1", 100, "a", details())])]);
        merge_tree(&pool, &fetched, &GroupPolicy::default()).await.unwrap();

        let fixed = vec![DetailRecord::Built {
            origin: "devel/broken".to_string(),
            pkgname: "broken-0.2".to_string(),
            elapsed: 30,
        }];
        let refetched = tree(vec![("main-amd64", vec![build("p1", 100, "b", fixed)])]);
        merge_tree(&pool, &refetched, &GroupPolicy::default()).await.unwrap();

        let rows: Vec<String> = snapshot(&pool)
            .await
            .into_iter()
            .filter(|r| !r.starts_with("server|") && !r.starts_with("masterbuild|") && !r.starts_with("build|"))
            .collect();
        assert_eq!(rows, vec!["built|1|devel/broken|broken-0.2|30"]);
    }

    #[tokio::test]
    async fn started_is_never_rewritten() {
        let (_dir, pool) = scratch_store().await;
        merge_tree(
            &pool,
            &tree(vec![("main-amd64", vec![build("p1", 100, "a", Vec::new())])]),
            &GroupPolicy::default(),
        )
        .await
        .unwrap();
        let mut later = build("p1", 555, "b", Vec::new());
        later.summary.ended = None;
        later.summary.status = "stopped".to_string();
        merge_tree(&pool, &tree(vec![("main-amd64", vec![later])]), &GroupPolicy::default())
            .await
            .unwrap();

        let row: (i64, Option<i64>, String, String) =
            sqlx::query_as("SELECT started, ended, status, last_modified FROM build WHERE name = 'p1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(row, (100, None, "stopped".to_string(), "b".to_string()));
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_the_whole_build() {
        let (_dir, pool) = scratch_store().await;
        let fetched = tree(vec![("main-amd64", vec![build("p1", 100, "a", details())])]);
        merge_tree(&pool, &fetched, &GroupPolicy::default()).await.unwrap();
        let before = snapshot(&pool).await;

        let mut duplicated = details();
        duplicated.push(duplicated[0].clone());
        let bad = tree(vec![("main-amd64", vec![build("p1", 100, "b", duplicated)])]);
        let err = merge_tree(&pool, &bad, &GroupPolicy::default()).await.unwrap_err();

        assert!(format!("{err:#}").contains("saving build main-amd64/p1"));
        assert_eq!(snapshot(&pool).await, before);
    }
}
