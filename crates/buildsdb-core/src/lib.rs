//! Core domain model for buildsdb: build summaries, per-port detail records
//! and the transient fetch result tree handed from the fetcher to the merger.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "buildsdb-core";

/// Seconds since the Unix epoch, as published by the build servers.
pub type EpochSecs = i64;

/// Summary of one build run as listed in a group's build index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub buildname: String,
    pub jailname: String,
    pub started: EpochSecs,
    pub ended: Option<EpochSecs>,
    pub status: String,
}

/// The five disjoint categories of per-port results attached to a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailCategory {
    Queued,
    Built,
    Failed,
    Ignored,
    Skipped,
}

impl DetailCategory {
    pub const ALL: [DetailCategory; 5] = [
        DetailCategory::Queued,
        DetailCategory::Built,
        DetailCategory::Failed,
        DetailCategory::Ignored,
        DetailCategory::Skipped,
    ];

    /// Key under `ports` in the build detail document, and the table name.
    pub fn as_str(self) -> &'static str {
        match self {
            DetailCategory::Queued => "queued",
            DetailCategory::Built => "built",
            DetailCategory::Failed => "failed",
            DetailCategory::Ignored => "ignored",
            DetailCategory::Skipped => "skipped",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == key)
    }
}

impl fmt::Display for DetailCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-port result. Every variant shares `origin` and `pkgname`; the
/// remaining fields and the uniqueness key differ per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum DetailRecord {
    Queued {
        origin: String,
        pkgname: String,
        reason: String,
    },
    Built {
        origin: String,
        pkgname: String,
        elapsed: u32,
    },
    Failed {
        origin: String,
        pkgname: String,
        phase: String,
        errortype: String,
        elapsed: u32,
    },
    Ignored {
        origin: String,
        pkgname: String,
        reason: String,
    },
    Skipped {
        origin: String,
        pkgname: String,
        depends: String,
    },
}

impl DetailRecord {
    pub fn category(&self) -> DetailCategory {
        match self {
            DetailRecord::Queued { .. } => DetailCategory::Queued,
            DetailRecord::Built { .. } => DetailCategory::Built,
            DetailRecord::Failed { .. } => DetailCategory::Failed,
            DetailRecord::Ignored { .. } => DetailCategory::Ignored,
            DetailRecord::Skipped { .. } => DetailCategory::Skipped,
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            DetailRecord::Queued { origin, .. }
            | DetailRecord::Built { origin, .. }
            | DetailRecord::Failed { origin, .. }
            | DetailRecord::Ignored { origin, .. }
            | DetailRecord::Skipped { origin, .. } => origin,
        }
    }

    pub fn pkgname(&self) -> &str {
        match self {
            DetailRecord::Queued { pkgname, .. }
            | DetailRecord::Built { pkgname, .. }
            | DetailRecord::Failed { pkgname, .. }
            | DetailRecord::Ignored { pkgname, .. }
            | DetailRecord::Skipped { pkgname, .. } => pkgname,
        }
    }
}

/// Identity of a build across servers, used to look up stored cache tokens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildKey {
    pub server: String,
    pub group: String,
    pub build: String,
}

impl BuildKey {
    pub fn new(server: impl Into<String>, group: impl Into<String>, build: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            group: group.into(),
            build: build.into(),
        }
    }
}

/// Cache tokens recorded by the previous sync, keyed by build identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheTokens {
    tokens: HashMap<BuildKey, String>,
}

impl CacheTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: BuildKey, token: String) {
        self.tokens.insert(key, token);
    }

    /// Stored token for the build, if any non-empty one was recorded.
    pub fn get(&self, server: &str, group: &str, build: &str) -> Option<&str> {
        self.tokens
            .get(&BuildKey::new(server, group, build))
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<(BuildKey, String)> for CacheTokens {
    fn from_iter<I: IntoIterator<Item = (BuildKey, String)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

/// Leaf of the fetch result tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNode {
    pub summary: BuildSummary,
    /// The server reported the same cache token as the store already holds.
    pub waived: bool,
    pub cache_token: Option<String>,
    pub details: Vec<DetailRecord>,
}

impl BuildNode {
    pub fn pending(summary: BuildSummary) -> Self {
        Self {
            summary,
            waived: false,
            cache_token: None,
            details: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.summary.buildname
    }

    pub fn count(&self, category: DetailCategory) -> usize {
        self.details.iter().filter(|d| d.category() == category).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNode {
    pub name: String,
    /// Builds in encounter order.
    pub builds: Vec<BuildNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNode {
    pub url: String,
    pub groups: BTreeMap<String, GroupNode>,
}

/// A branch of the fetch that could not be completed. Location fields narrow
/// from server down to build depending on where the failure happened.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchFailure {
    pub server: String,
    pub group: Option<String>,
    pub build: Option<String>,
    pub message: String,
}

impl BranchFailure {
    pub fn server(server: &str, message: impl Into<String>) -> Self {
        Self {
            server: server.to_string(),
            group: None,
            build: None,
            message: message.into(),
        }
    }

    pub fn group(server: &str, group: &str, message: impl Into<String>) -> Self {
        Self {
            group: Some(group.to_string()),
            ..Self::server(server, message)
        }
    }

    pub fn build(server: &str, group: &str, build: &str, message: impl Into<String>) -> Self {
        Self {
            build: Some(build.to_string()),
            ..Self::group(server, group, message)
        }
    }
}

impl fmt::Display for BranchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server={}", self.server)?;
        if let Some(group) = &self.group {
            write!(f, " group={group}")?;
        }
        if let Some(build) = &self.build {
            write!(f, " build={build}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// In-memory result of one fetch run, consumed by the merge step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTree {
    pub servers: BTreeMap<String, ServerNode>,
    pub failures: Vec<BranchFailure>,
}

impl FetchTree {
    pub fn builds(&self) -> impl Iterator<Item = (&ServerNode, &GroupNode, &BuildNode)> {
        self.servers.values().flat_map(|server| {
            server
                .groups
                .values()
                .flat_map(move |group| group.builds.iter().map(move |build| (server, group, build)))
        })
    }

    pub fn group_count(&self) -> usize {
        self.servers.values().map(|s| s.groups.len()).sum()
    }

    pub fn build_count(&self) -> usize {
        self.builds().count()
    }

    pub fn waived_count(&self) -> usize {
        self.builds().filter(|(_, _, b)| b.waived).count()
    }
}
