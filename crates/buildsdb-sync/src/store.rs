//! SQLite store: schema, connection setup, the cache-token table read before
//! each fetch, and operator-side group enable/disable.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use buildsdb_core::{BuildKey, CacheTokens};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS server (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    url             TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS masterbuild (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    server_id       INTEGER NOT NULL,
    name            TEXT NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1,
    UNIQUE (server_id, name),
    FOREIGN KEY (server_id) REFERENCES server(id)
);
CREATE TABLE IF NOT EXISTS build (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    masterbuild_id  INTEGER NOT NULL,
    name            TEXT NOT NULL,
    started         INTEGER NULL,
    ended           INTEGER NULL,
    status          TEXT NULL,
    last_modified   TEXT NOT NULL,
    UNIQUE (masterbuild_id, name),
    FOREIGN KEY (masterbuild_id) REFERENCES masterbuild(id)
);
CREATE INDEX IF NOT EXISTS index_build_masterbuild_id ON build(masterbuild_id);
CREATE TABLE IF NOT EXISTS queued (
    build_id        INTEGER NOT NULL,
    origin          TEXT NOT NULL,
    pkgname         TEXT NOT NULL,
    reason          TEXT NOT NULL,
    PRIMARY KEY (build_id, origin, pkgname),
    FOREIGN KEY (build_id) REFERENCES build(id)
);
CREATE TABLE IF NOT EXISTS built (
    build_id        INTEGER NOT NULL,
    origin          TEXT NOT NULL,
    pkgname         TEXT NOT NULL,
    elapsed         INTEGER NOT NULL,
    PRIMARY KEY (build_id, origin, pkgname),
    FOREIGN KEY (build_id) REFERENCES build(id)
);
CREATE INDEX IF NOT EXISTS index_built_origin ON built(origin);
CREATE TABLE IF NOT EXISTS failed (
    build_id        INTEGER NOT NULL,
    origin          TEXT NOT NULL,
    pkgname         TEXT NOT NULL,
    phase           TEXT NOT NULL,
    errortype       TEXT NOT NULL,
    elapsed         INTEGER NOT NULL,
    PRIMARY KEY (build_id, origin, pkgname),
    FOREIGN KEY (build_id) REFERENCES build(id)
);
CREATE INDEX IF NOT EXISTS index_failed_origin ON failed(origin);
CREATE TABLE IF NOT EXISTS ignored (
    build_id        INTEGER NOT NULL,
    origin          TEXT NOT NULL,
    pkgname         TEXT NOT NULL,
    reason          TEXT NOT NULL,
    PRIMARY KEY (build_id, origin, pkgname, reason),
    FOREIGN KEY (build_id) REFERENCES build(id)
);
CREATE TABLE IF NOT EXISTS skipped (
    build_id        INTEGER NOT NULL,
    origin          TEXT NOT NULL,
    pkgname         TEXT NOT NULL,
    depends         TEXT NOT NULL,
    PRIMARY KEY (build_id, origin, pkgname, depends),
    FOREIGN KEY (build_id) REFERENCES build(id)
);
CREATE TABLE IF NOT EXISTS schema_version (
    version         INTEGER NOT NULL
);
INSERT INTO schema_version (version)
    SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version);

-- newest failure of each port within its master build
CREATE VIEW IF NOT EXISTS failed_last AS
SELECT f.*
  FROM failed f
 WHERE f.build_id = (
        SELECT b.id
          FROM build b
         WHERE b.masterbuild_id = (SELECT masterbuild_id FROM build WHERE id = f.build_id)
           AND EXISTS (SELECT 1 FROM failed WHERE origin = f.origin AND build_id = b.id)
         ORDER BY b.started DESC
         LIMIT 1
       );

-- newest success of each port within its master build
CREATE VIEW IF NOT EXISTS built_last AS
SELECT s.*
  FROM built s
 WHERE s.build_id = (
        SELECT b.id
          FROM build b
         WHERE b.masterbuild_id = (SELECT masterbuild_id FROM build WHERE id = s.build_id)
           AND EXISTS (SELECT 1 FROM built WHERE origin = s.origin AND build_id = b.id)
         ORDER BY b.started DESC
         LIMIT 1
       );

-- ports whose latest failure is newer than their latest success
CREATE VIEW IF NOT EXISTS broken AS
SELECT m.id AS masterbuild_id,
       m.name AS masterbuild_name,
       bf.id AS build_id,
       bf.name AS build_name,
       f.origin AS origin,
       f.phase AS phase,
       f.errortype AS errortype,
       f.elapsed AS elapsed,
       bf.started AS last_failed,
       (SELECT started FROM build WHERE id = s.build_id) AS last_succeeded
  FROM masterbuild m,
       build bf,
       failed_last f
  LEFT JOIN built_last s
    ON s.build_id IN (SELECT id FROM build WHERE masterbuild_id = m.id)
   AND s.origin = f.origin
 WHERE m.id = bf.masterbuild_id
   AND bf.id = f.build_id
   AND m.enabled = 1
   AND (last_succeeded IS NULL OR last_failed > last_succeeded)
 ORDER BY last_failed;
"#;

fn connect_options(path: &Path, create: bool) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
}

/// Open (creating if needed) the store used by a sync run and apply the schema.
pub async fn open_store(path: &Path) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(connect_options(path, true))
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .await
        .context("applying database schema")?;
    info!(path = %path.display(), "database ready");
    Ok(pool)
}

/// Open a store that an earlier sync must already have created.
pub async fn open_existing_store(path: &Path, operation: &str) -> Result<SqlitePool> {
    if !path.exists() {
        bail!(
            "the '{operation}' operation requires the database {} to be present, please run 'buildsdb fetch' first",
            path.display()
        );
    }
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(path, false))
        .await
        .with_context(|| format!("opening database {}", path.display()))
}

/// Cache tokens recorded by the previous sync for every stored build.
pub async fn load_cache_tokens(pool: &SqlitePool) -> Result<CacheTokens> {
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(
        r#"
        SELECT s.url, m.name, b.name, b.last_modified
          FROM build b
          JOIN masterbuild m ON m.id = b.masterbuild_id
          JOIN server s ON s.id = m.server_id
        "#,
    )
    .fetch_all(pool)
    .await
    .context("reading stored cache tokens")?;
    debug!(count = rows.len(), "loaded stored cache tokens");
    Ok(rows
        .into_iter()
        .map(|(server, group, build, token)| (BuildKey::new(server, group, build), token))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupFilter {
    #[default]
    Any,
    Enabled,
    Disabled,
}

impl GroupFilter {
    fn enabled(self) -> Option<bool> {
        match self {
            GroupFilter::Any => None,
            GroupFilter::Enabled => Some(true),
            GroupFilter::Disabled => Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRow {
    pub server: String,
    pub name: String,
    pub enabled: bool,
}

pub async fn list_groups(pool: &SqlitePool, filter: GroupFilter) -> Result<Vec<GroupRow>> {
    let enabled = filter.enabled();
    let rows: Vec<(String, String, bool)> = sqlx::query_as(
        r#"
        SELECT s.url, m.name, m.enabled
          FROM masterbuild m
          JOIN server s ON s.id = m.server_id
         WHERE ?1 IS NULL OR m.enabled = ?1
         ORDER BY m.name, s.url
        "#,
    )
    .bind(enabled)
    .fetch_all(pool)
    .await
    .context("listing master builds")?;
    Ok(rows
        .into_iter()
        .map(|(server, name, enabled)| GroupRow { server, name, enabled })
        .collect())
}

/// Expand `tier1`/`tier2` shorthands into architecture substrings.
pub fn expand_group_patterns(patterns: &[String]) -> Result<Vec<String>> {
    let mut expanded = Vec::new();
    for pattern in patterns {
        let pattern = pattern.trim();
        match pattern {
            "" => bail!("master build pattern can't be empty"),
            "tier1" => expanded.extend(["amd64", "arm64"].map(String::from)),
            "tier2" => expanded.extend(["i386", "armv7", "powerpc"].map(String::from)),
            other => expanded.push(other.to_string()),
        }
    }
    Ok(expanded)
}

/// Set `enabled` on every group whose name contains one of the patterns.
/// Returns the number of rows changed.
pub async fn set_groups_enabled(pool: &SqlitePool, patterns: &[String], enabled: bool) -> Result<u64> {
    let patterns = expand_group_patterns(patterns)?;
    let mut tx = pool.begin().await.context("beginning transaction")?;
    let mut affected = 0;
    for pattern in &patterns {
        let result = sqlx::query("UPDATE masterbuild SET enabled = ? WHERE name LIKE '%' || ? || '%'")
            .bind(enabled)
            .bind(pattern)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("updating master builds matching '{pattern}'"))?;
        info!(
            pattern = %pattern,
            rows = result.rows_affected(),
            "master builds {}",
            if enabled { "enabled" } else { "disabled" }
        );
        affected += result.rows_affected();
    }
    tx.commit().await.context("committing master build update")?;
    Ok(affected)
}
