//! Resolution engine for fenceref.
//!
//! [`PromptEngine`] is the surface callers use: resolve text, count tokens,
//! track fence block totals, queue background refreshes and invalidate the
//! resolution cache. Admin-owned tables arrive as a read-only [`Snapshot`] on
//! every call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fenceref_context::{
    CacheError, CachedTokenCounter, DurableTier, HierarchicalCache, Namespace, TokenCounter,
};
use fenceref_tools::RetryConfig;

mod config;
mod queue;
mod registry;
mod resolver;

pub use config::{
    CacheConfig, ConfigError, FencerefConfig, FilesConfig, GitHubConfig, HttpConfig, QueueConfig,
    ResolverConfig, config_path, expand_env_vars, fenceref_dir,
};
pub use queue::{
    BlockFailure, FailedBlock, QueueSettings, RunFut, TaskError, TaskFailure, TaskId, TaskOutcome,
    TaskPriority, TaskQueue, TaskRunner, TaskSpec, TaskState, TaskStatus,
};
pub use registry::{BlockRegistry, BlockSummary};
pub use resolver::{
    CacheTarget, ReferenceError, ReferenceTokens, ResolutionError, ResolutionResult, ResolveMode,
    Resolver, ResolverOptions,
};

pub use fenceref_tools::{HandlerRegistry, Snapshot, VariableProvider};
pub use fenceref_types::{BlockId, FenceBlock, Signature};

// ============================================================================
// Block refresh runner
// ============================================================================

/// Re-resolves blocks in refresh mode and records their totals.
struct BlockRefresher {
    resolver: Arc<Resolver>,
    blocks: Arc<BlockRegistry>,
}

impl BlockRefresher {
    /// Outer error: the cache is unavailable. Inner error: this block could
    /// not be refreshed; its partial totals are still recorded.
    async fn refresh_block(
        &self,
        id: &BlockId,
        snapshot: &Snapshot,
        mode: ResolveMode,
    ) -> Result<Result<BlockSummary, BlockFailure>, TaskFailure> {
        let Some(content) = self.blocks.content(id) else {
            return Ok(Err(BlockFailure {
                failure: TaskFailure::permanent(format!("unknown block: {id}")),
                summary: None,
            }));
        };

        let result = match self.resolver.resolve(&content, snapshot, mode).await {
            Ok(result) => result,
            Err(ResolutionError::Storage(e)) => {
                tracing::error!(block = %id, error = %e, "Cache storage failed during refresh");
                return Err(TaskFailure::transient(e.to_string()));
            }
            Err(ResolutionError::AllReferencesFailed { result }) => {
                let summary = BlockSummary::from_result(id.clone(), &result);
                self.blocks.record(summary.clone());
                let message = format!("every reference in block {id} failed to resolve");
                let failure = if result.errors.iter().any(|e| e.transient) {
                    TaskFailure::transient(message)
                } else {
                    TaskFailure::permanent(message)
                };
                return Ok(Err(BlockFailure {
                    failure,
                    summary: Some(summary),
                }));
            }
        };

        let summary = BlockSummary::from_result(id.clone(), &result);
        self.blocks.record(summary.clone());
        Ok(Ok(summary))
    }
}

impl TaskRunner for BlockRefresher {
    fn refresh<'a>(&'a self, id: &'a BlockId, snapshot: &'a Snapshot) -> RunFut<'a> {
        Box::pin(self.refresh_block(id, snapshot, ResolveMode::Refresh))
    }

    fn global_total(&self) -> u64 {
        self.blocks.global_total()
    }
}

// ============================================================================
// PromptEngine
// ============================================================================

#[derive(Debug)]
pub struct PromptEngine {
    resolver: Arc<Resolver>,
    blocks: Arc<BlockRegistry>,
    queue: TaskQueue,
}

impl PromptEngine {
    /// Must be called from within a Tokio runtime (the refresh workers are spawned here).
    #[must_use]
    pub fn new(resolver: Resolver, queue: QueueSettings) -> Self {
        let resolver = Arc::new(resolver);
        let blocks = Arc::new(BlockRegistry::new());
        let runner = Arc::new(BlockRefresher {
            resolver: Arc::clone(&resolver),
            blocks: Arc::clone(&blocks),
        });
        Self {
            resolver,
            blocks,
            queue: TaskQueue::start(runner, queue),
        }
    }

    /// Build the standard handlers and both cache tiers from configuration.
    pub fn from_config(config: &FencerefConfig) -> anyhow::Result<Self> {
        let durable = match config.cache.durable_path() {
            Some(path) => Some(Arc::new(DurableTier::open(&path).with_context(|| {
                format!("failed to open durable cache at {}", path.display())
            })?)),
            None => None,
        };

        let handlers = HandlerRegistry::standard(
            config.file_settings(),
            config.http_settings(),
            Duration::from_secs(config.cache.api_ttl_secs),
            config.github_settings(),
            Duration::from_secs(config.cache.variable_ttl_secs),
        )
        .context("failed to build reference handlers")?;

        let capacity = config.cache.memory_capacity;
        let resolution = HierarchicalCache::new(Namespace::Resolution, capacity, durable.clone());
        let tokens = CachedTokenCounter::new(
            TokenCounter::default(),
            HierarchicalCache::new(Namespace::Tokens, capacity, durable),
            config.cache.token_ttl(),
        );
        let options = ResolverOptions {
            concurrency: config.resolver.concurrency,
            reference_timeout: Duration::from_secs(config.resolver.reference_timeout_secs),
        };
        let queue = QueueSettings {
            workers: config.queue.workers,
            retry: RetryConfig {
                max_retries: config.queue.max_retries,
                initial_delay: Duration::from_millis(config.queue.initial_backoff_ms),
                ..RetryConfig::default()
            },
            max_finished: config.queue.max_finished_tasks,
            finished_ttl: Duration::from_secs(config.queue.finished_task_ttl_secs),
        };

        Ok(Self::new(
            Resolver::new(handlers, resolution, tokens, options),
            queue,
        ))
    }

    /// Resolve every reference in `text`, serving cached content where fresh.
    pub async fn resolve(
        &self,
        text: &str,
        snapshot: &Snapshot,
    ) -> Result<ResolutionResult, ResolutionError> {
        self.resolver
            .resolve(text, snapshot, ResolveMode::Cached)
            .await
    }

    pub fn count_tokens(&self, text: &str) -> Result<u32, CacheError> {
        self.resolver.count_tokens(text).map(|result| result.count)
    }

    pub fn register_block(&self, block: FenceBlock) {
        self.blocks.register(block);
    }

    pub fn remove_block(&self, id: &BlockId) -> bool {
        self.blocks.remove(id)
    }

    /// Synchronous single-block count; the caller waits for every reference.
    pub async fn count_block(
        &self,
        id: &BlockId,
        snapshot: &Snapshot,
    ) -> Result<BlockSummary, TaskFailure> {
        let refresher = BlockRefresher {
            resolver: Arc::clone(&self.resolver),
            blocks: Arc::clone(&self.blocks),
        };
        refresher
            .refresh_block(id, snapshot, ResolveMode::Cached)
            .await?
            .map_err(|failed| failed.failure)
    }

    /// Queue a background refresh of `block_ids`.
    pub fn refresh(
        &self,
        block_ids: Vec<BlockId>,
        priority: TaskPriority,
        snapshot: Snapshot,
    ) -> Result<TaskId, TaskError> {
        if let Some(unknown) = block_ids.iter().find(|id| !self.blocks.contains(id)) {
            return Err(TaskError::UnknownBlock(unknown.clone()));
        }
        self.queue.submit(block_ids, priority, snapshot)
    }

    #[must_use]
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.queue.status(id)
    }

    pub async fn wait_for_task(&self, id: TaskId) -> Option<TaskStatus> {
        self.queue.wait(id).await
    }

    pub fn invalidate_cache(&self, target: &CacheTarget) -> Result<usize, CacheError> {
        self.resolver.invalidate(target)
    }

    #[must_use]
    pub fn block_summary(&self, id: &BlockId) -> Option<BlockSummary> {
        self.blocks.summary(id)
    }

    #[must_use]
    pub fn block_summaries(&self) -> Vec<BlockSummary> {
        self.blocks.summaries()
    }

    #[must_use]
    pub fn global_total(&self) -> u64 {
        self.blocks.global_total()
    }

    /// Drain queued refreshes and stop the workers.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
