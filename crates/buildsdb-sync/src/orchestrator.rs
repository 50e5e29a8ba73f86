//! Three-level fetch: server group index, group build index, build detail.
//!
//! Every level fans its children out into a `JoinSet` and awaits all of them
//! before returning, so the whole tree is drained when `fetch_tree` returns.
//! A single semaphore shared by every level bounds the number of documents
//! being fetched or parsed at once; a permit is never held while a node waits
//! on its children.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use buildsdb_core::{BranchFailure, BuildNode, CacheTokens, FetchTree, GroupNode, ServerNode};
use buildsdb_documents::{
    decode_document, is_placeholder, parse_build_detail, parse_build_index, parse_group_index,
};
use buildsdb_transport::DocumentFetcher;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_WORKERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Depth-first, one document at a time.
    Sequential,
    Parallel { workers: usize },
}

impl Default for FetchStrategy {
    fn default() -> Self {
        FetchStrategy::Parallel {
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record the failed branch, leave it out of the tree, keep going.
    #[default]
    Isolate,
    /// Stop at the first failed branch; nothing gets merged.
    AbortRun,
}

pub fn server_index_url(server: &str) -> String {
    format!("{server}/data/.data.json")
}

pub fn group_index_url(server: &str, group: &str) -> String {
    format!("{server}/data/{group}/.data.json")
}

pub fn build_detail_url(server: &str, group: &str, build: &str) -> String {
    format!("{server}/data/{group}/{build}/.data.json")
}

pub struct Orchestrator {
    fetcher: Arc<dyn DocumentFetcher>,
    strategy: FetchStrategy,
    policy: FailurePolicy,
}

struct Walk {
    fetcher: Arc<dyn DocumentFetcher>,
    tokens: CacheTokens,
    pool: Semaphore,
    sequential: bool,
    policy: FailurePolicy,
    failures: Mutex<Vec<BranchFailure>>,
}

impl Walk {
    async fn permit(&self) -> SemaphorePermit<'_> {
        self.pool.acquire().await.expect("semaphore not closed")
    }
}

impl Orchestrator {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, strategy: FetchStrategy, policy: FailurePolicy) -> Self {
        Self {
            fetcher,
            strategy,
            policy,
        }
    }

    /// Fetch every server's tree. `tokens` is the cache-token table read from
    /// the store before the run starts.
    pub async fn fetch_tree(&self, servers: Vec<String>, tokens: CacheTokens) -> Result<FetchTree> {
        let (workers, sequential) = match self.strategy {
            FetchStrategy::Sequential => (1, true),
            FetchStrategy::Parallel { workers } => (workers.max(1), false),
        };
        info!(servers = servers.len(), workers, sequential, "fetching build data");
        let walk = Arc::new(Walk {
            fetcher: Arc::clone(&self.fetcher),
            tokens,
            pool: Semaphore::new(workers),
            sequential,
            policy: self.policy,
            failures: Mutex::new(Vec::new()),
        });

        let nodes = match fan_out(&walk, servers, walk_server).await {
            Ok(nodes) => nodes,
            Err(failure) => bail!("fetch aborted, nothing was merged: {failure}"),
        };

        let mut failures = std::mem::take(&mut *walk.failures.lock().await);
        failures.sort();
        Ok(FetchTree {
            servers: nodes.into_iter().map(|node| (node.url.clone(), node)).collect(),
            failures,
        })
    }
}

/// Run `task` for every item, sequentially or as one `JoinSet` per call, and
/// return the successful results in item order. Under `Isolate` failures are
/// recorded on the walk; under `AbortRun` the first one is returned and any
/// sibling still running is cancelled with the set.
async fn fan_out<I, T, F, Fut>(walk: &Arc<Walk>, items: Vec<I>, task: F) -> Result<Vec<T>, BranchFailure>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(Arc<Walk>, I) -> Fut,
    Fut: Future<Output = Result<T, BranchFailure>> + Send + 'static,
{
    let mut results = Vec::with_capacity(items.len());
    if walk.sequential {
        for item in items {
            let result = task(Arc::clone(walk), item).await;
            if walk.policy == FailurePolicy::AbortRun {
                results.push(Ok(result?));
            } else {
                results.push(result);
            }
        }
    } else {
        let mut set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let child = task(Arc::clone(walk), item);
            set.spawn(async move { (index, child.await) });
        }
        let mut slots: Vec<Option<Result<T, BranchFailure>>> = (0..set.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            };
            if walk.policy == FailurePolicy::AbortRun {
                if let Err(failure) = result {
                    return Err(failure);
                }
            }
            slots[index] = Some(result);
        }
        results.extend(slots.into_iter().flatten());
    }

    let mut nodes = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(node) => nodes.push(node),
            Err(failure) => {
                warn!(%failure, "branch skipped");
                walk.failures.lock().await.push(failure);
            }
        }
    }
    Ok(nodes)
}

async fn walk_server(walk: Arc<Walk>, server: String) -> Result<ServerNode, BranchFailure> {
    let groups = {
        let _permit = walk.permit().await;
        info!(server = %server, "fetching data from the server");
        let url = server_index_url(&server);
        let fail = |message: String| BranchFailure::server(&server, message);
        let body = walk.fetcher.fetch(&url).await.map_err(|e| fail(e.to_string()))?;
        if is_placeholder(&body) {
            warn!(url = %url, "placeholder page instead of a group index, skipping server");
            return Ok(ServerNode {
                url: server,
                groups: BTreeMap::new(),
            });
        }
        decode_document(&body)
            .and_then(|doc| parse_group_index(&doc))
            .map_err(|e| fail(format!("{url}: {e}")))?
    };

    let base = server.clone();
    let nodes = fan_out(&walk, groups, move |walk, group| walk_group(walk, base.clone(), group)).await?;
    Ok(ServerNode {
        url: server,
        groups: nodes
            .into_iter()
            .flatten()
            .map(|group| (group.name.clone(), group))
            .collect(),
    })
}

/// `None` when the group index was a placeholder page.
async fn walk_group(walk: Arc<Walk>, server: String, group: String) -> Result<Option<GroupNode>, BranchFailure> {
    let summaries = {
        let _permit = walk.permit().await;
        info!(server = %server, group = %group, "fetching data for master build");
        let url = group_index_url(&server, &group);
        let fail = |message: String| BranchFailure::group(&server, &group, message);
        let body = walk.fetcher.fetch(&url).await.map_err(|e| fail(e.to_string()))?;
        if is_placeholder(&body) {
            warn!(url = %url, "placeholder page instead of a build index, skipping master build");
            return Ok(None);
        }
        decode_document(&body)
            .and_then(|doc| parse_build_index(&doc, &group))
            .map_err(|e| fail(format!("{url}: {e}")))?
    };
    info!(
        group = %group,
        "there are {} build(s) to fetch for master build",
        summaries.len()
    );

    let pending: Vec<BuildNode> = summaries.into_iter().map(BuildNode::pending).collect();
    let (base, name) = (server.clone(), group.clone());
    let builds = fan_out(&walk, pending, move |walk, node| {
        walk_build(walk, base.clone(), name.clone(), node)
    })
    .await?;
    Ok(Some(GroupNode { name: group, builds }))
}

async fn walk_build(
    walk: Arc<Walk>,
    server: String,
    group: String,
    mut node: BuildNode,
) -> Result<BuildNode, BranchFailure> {
    let _permit = walk.permit().await;
    let name = node.name().to_string();
    let url = build_detail_url(&server, &group, &name);
    let fail = |message: String| BranchFailure::build(&server, &group, &name, message);

    let known = walk.tokens.get(&server, &group, &name);
    let fetched = walk
        .fetcher
        .fetch_conditional(&url, known)
        .await
        .map_err(|e| fail(e.to_string()))?;
    if fetched.waived {
        debug!(group = %group, build = %name, "build unchanged since last sync");
        node.waived = true;
        return Ok(node);
    }

    node.details = decode_document(&fetched.body)
        .and_then(|doc| parse_build_detail(&doc, &group, &node.summary))
        .map_err(|e| fail(format!("{url}: {e}")))?;
    node.cache_token = fetched.cache_token;
    debug!(group = %group, build = %name, records = node.details.len(), "build detail parsed");
    Ok(node)
}
