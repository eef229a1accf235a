//! Background refresh queue.
//!
//! Tasks run highest priority first, FIFO within a priority. A task moves
//! `Pending -> Running -> Completed | Failed`. Blocks are refreshed one at a
//! time; a block that fails is reported in the outcome and the task moves on.
//! Blocks whose failure is transient are retried with backoff up to a bounded
//! count; permanent failures are not retried. A task fails only when every
//! block fails or a storage outage outlasts its retries.
//!
//! A newer request for the same set of blocks supersedes an older one: a
//! pending task is failed in place and a running one is aborted. Finished
//! tasks stay pollable until they age out or the retention cap is reached.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fenceref_tools::{RetryConfig, Snapshot, calculate_retry_delay};
use fenceref_types::BlockId;
use futures_util::future::{AbortHandle, AbortRegistration, Abortable, Aborted};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::registry::BlockSummary;

const SUPERSEDED: &str = "superseded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Background recount.
    Passive,
    /// Multi-block refresh.
    Global,
    /// Single block the user is looking at.
    Interactive,
}

impl TaskPriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Passive => "passive",
            TaskPriority::Global => "global",
            TaskPriority::Interactive => "interactive",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work handed to the runner.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub block_ids: Vec<BlockId>,
    pub priority: TaskPriority,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Latest summary of every block that produced one, failed blocks included.
    pub blocks: Vec<BlockSummary>,
    /// Blocks still failing when the task finished.
    pub failed_blocks: Vec<FailedBlock>,
    pub global_total: u64,
    /// Per-reference failures across all blocks; these do not fail the task.
    pub reference_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBlock {
    pub id: BlockId,
    pub message: String,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
    pub transient: bool,
}

impl TaskFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// One block that could not be refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFailure {
    pub failure: TaskFailure,
    /// Totals recorded for the block despite the failure.
    pub summary: Option<BlockSummary>,
}

pub type RunFut<'a> =
    Pin<Box<dyn Future<Output = Result<Result<BlockSummary, BlockFailure>, TaskFailure>> + Send + 'a>>;

/// Refreshes blocks on behalf of the queue.
pub trait TaskRunner: Send + Sync + 'static {
    /// Refresh one block. The outer error ends the attempt for every block
    /// still outstanding; the inner one belongs to this block alone.
    fn refresh<'a>(&'a self, id: &'a BlockId, snapshot: &'a Snapshot) -> RunFut<'a>;

    /// Total across every tracked block.
    fn global_total(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub id: TaskId,
    pub state: TaskState,
    pub priority: TaskPriority,
    pub block_ids: Vec<BlockId>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task queue is shut down")]
    ShutDown,
    #[error("refresh requested for no blocks")]
    NoBlocks,
    #[error("unknown block: {0}")]
    UnknownBlock(BlockId),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub workers: usize,
    /// `max_retries` bounds retries of transient failures.
    pub retry: RetryConfig,
    /// Finished tasks kept for polling, oldest dropped first.
    pub max_finished: usize,
    /// How long a finished task stays pollable.
    pub finished_ttl: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            retry: RetryConfig {
                max_retries: 3,
                initial_delay: Duration::from_millis(250),
                ..RetryConfig::default()
            },
            max_finished: 1024,
            finished_ttl: Duration::from_secs(3600),
        }
    }
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: TaskPriority,
    seq: u64,
    id: TaskId,
}

// Highest priority first, then oldest first.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Record {
    status: TaskStatus,
    spec: Arc<TaskSpec>,
    /// Sorted, deduplicated block ids used to detect superseding requests.
    key: Vec<BlockId>,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Queued>,
    tasks: HashMap<TaskId, Record>,
    /// Terminal tasks in the order they finished.
    finished: VecDeque<(Instant, TaskId)>,
    seq: u64,
    shutting_down: bool,
}

impl State {
    fn mark_finished(&mut self, id: TaskId) {
        self.finished.push_back((Instant::now(), id));
    }

    /// Forget finished tasks past the retention window or over the cap.
    fn prune(&mut self, settings: &QueueSettings) {
        let now = Instant::now();
        while let Some(&(at, id)) = self.finished.front() {
            let expired = now.saturating_duration_since(at) > settings.finished_ttl;
            if !expired && self.finished.len() <= settings.max_finished {
                break;
            }
            self.finished.pop_front();
            self.tasks.remove(&id);
        }
    }
}

enum Next {
    Run {
        id: TaskId,
        spec: Arc<TaskSpec>,
        registration: AbortRegistration,
    },
    Idle,
    Exit,
}

struct Inner {
    state: Mutex<State>,
    /// Signalled when work is queued or the queue is shutting down.
    work: Notify,
    /// Signalled on every task state change.
    changed: Notify,
    runner: Arc<dyn TaskRunner>,
    settings: QueueSettings,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_task(&self) -> Next {
        let mut state = self.state();
        while let Some(queued) = state.heap.pop() {
            let Some(record) = state.tasks.get_mut(&queued.id) else {
                continue;
            };
            if record.status.state != TaskState::Pending {
                continue;
            }
            let (handle, registration) = AbortHandle::new_pair();
            record.status.state = TaskState::Running;
            record.status.started_at = Some(Utc::now());
            record.abort = Some(handle);
            return Next::Run {
                id: queued.id,
                spec: Arc::clone(&record.spec),
                registration,
            };
        }
        if state.shutting_down {
            Next::Exit
        } else {
            Next::Idle
        }
    }

    fn set_attempts(&self, id: TaskId, attempts: u32) {
        if let Some(record) = self.state().tasks.get_mut(&id) {
            record.status.attempts = attempts;
        }
    }

    async fn execute(&self, id: TaskId, spec: Arc<TaskSpec>, registration: AbortRegistration) {
        tracing::info!(task = %id, priority = %spec.priority, blocks = spec.block_ids.len(), "Refresh task started");
        let result = Abortable::new(self.run_blocks(id, &spec), registration).await;
        self.finish(id, result);
    }

    /// Refresh every block of `spec`, retrying only blocks whose failure was transient.
    async fn run_blocks(&self, id: TaskId, spec: &TaskSpec) -> Result<TaskOutcome, TaskFailure> {
        let retry = &self.settings.retry;
        let mut order: Vec<&BlockId> = Vec::with_capacity(spec.block_ids.len());
        for block in &spec.block_ids {
            if !order.contains(&block) {
                order.push(block);
            }
        }

        let mut summaries: HashMap<&BlockId, BlockSummary> = HashMap::new();
        let mut failures: HashMap<&BlockId, TaskFailure> = HashMap::new();
        let mut pending = order.clone();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.set_attempts(id, attempt);
            let can_retry = attempt <= retry.max_retries;

            let mut again: Vec<&BlockId> = Vec::new();
            for (index, &block) in pending.iter().enumerate() {
                match self.runner.refresh(block, &spec.snapshot).await {
                    Ok(Ok(summary)) => {
                        failures.remove(&block);
                        summaries.insert(block, summary);
                    }
                    Ok(Err(BlockFailure { failure, summary })) => {
                        tracing::debug!(task = %id, %block, attempt, error = %failure, "Block refresh failed");
                        if let Some(summary) = summary {
                            summaries.insert(block, summary);
                        }
                        if failure.transient {
                            again.push(block);
                        }
                        failures.insert(block, failure);
                    }
                    Err(failure) => {
                        if !failure.transient || !can_retry {
                            return Err(failure);
                        }
                        tracing::warn!(task = %id, attempt, error = %failure, "Refresh attempt interrupted");
                        again.extend_from_slice(&pending[index..]);
                        break;
                    }
                }
            }

            if again.is_empty() || !can_retry {
                break;
            }
            let delay = calculate_retry_delay(attempt - 1, retry, None);
            tracing::warn!(
                task = %id,
                attempt,
                blocks = again.len(),
                delay_ms = delay.as_millis(),
                "Retrying failed blocks"
            );
            tokio::time::sleep(delay).await;
            pending = again;
        }

        let failed_blocks: Vec<FailedBlock> = order
            .iter()
            .filter_map(|&block| {
                failures.get(&block).map(|failure| FailedBlock {
                    id: block.clone(),
                    message: failure.message.clone(),
                    transient: failure.transient,
                })
            })
            .collect();
        if failed_blocks.len() == order.len() {
            let detail = failed_blocks
                .first()
                .map(|failed| failed.message.clone())
                .unwrap_or_default();
            return Err(TaskFailure {
                message: if order.len() == 1 {
                    detail
                } else {
                    format!("all {} blocks failed; first: {detail}", order.len())
                },
                transient: failed_blocks.iter().any(|failed| failed.transient),
            });
        }

        let blocks: Vec<BlockSummary> = order
            .iter()
            .filter_map(|block| summaries.remove(block))
            .collect();
        Ok(TaskOutcome {
            reference_errors: blocks.iter().map(|summary| summary.failed_references).sum(),
            blocks,
            failed_blocks,
            global_total: self.runner.global_total(),
        })
    }

    fn finish(&self, id: TaskId, result: Result<Result<TaskOutcome, TaskFailure>, Aborted>) {
        {
            let mut state = self.state();
            let Some(record) = state.tasks.get_mut(&id) else {
                return;
            };
            record.abort = None;
            // Superseded tasks were already failed by `submit`.
            if record.status.state != TaskState::Running {
                return;
            }
            let status = &mut record.status;
            status.completed_at = Some(Utc::now());
            match result {
                Ok(Ok(outcome)) => {
                    tracing::info!(task = %id, attempts = status.attempts, global_total = outcome.global_total, "Refresh task completed");
                    status.state = TaskState::Completed;
                    status.outcome = Some(outcome);
                }
                Ok(Err(failure)) => {
                    tracing::warn!(task = %id, attempts = status.attempts, error = %failure, "Refresh task failed");
                    status.state = TaskState::Failed;
                    status.error = Some(failure.message);
                }
                Err(Aborted) => {
                    status.state = TaskState::Failed;
                    status.error = Some(SUPERSEDED.to_string());
                }
            }
            state.mark_finished(id);
            state.prune(&self.settings);
        }
        self.changed.notify_waiters();
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    tracing::debug!(worker, "Refresh worker started");
    loop {
        let mut notified = pin!(inner.work.notified());
        notified.as_mut().enable();
        match inner.next_task() {
            Next::Run {
                id,
                spec,
                registration,
            } => {
                inner.changed.notify_waiters();
                inner.execute(id, spec, registration).await;
            }
            Next::Idle => notified.await,
            Next::Exit => break,
        }
    }
    tracing::debug!(worker, "Refresh worker stopped");
}

// ============================================================================
// Public queue
// ============================================================================

pub struct TaskQueue {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("TaskQueue")
            .field("queued", &state.heap.len())
            .field("tasks", &state.tasks.len())
            .field("shutting_down", &state.shutting_down)
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Spawn the worker pool. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(runner: Arc<dyn TaskRunner>, settings: QueueSettings) -> Self {
        let workers = settings.workers.max(1);
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            work: Notify::new(),
            changed: Notify::new(),
            runner,
            settings,
        });
        let handles = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(Arc::clone(&inner), worker)))
            .collect();
        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    pub fn submit(
        &self,
        block_ids: Vec<BlockId>,
        priority: TaskPriority,
        snapshot: Snapshot,
    ) -> Result<TaskId, TaskError> {
        if block_ids.is_empty() {
            return Err(TaskError::NoBlocks);
        }
        let mut key = block_ids.clone();
        key.sort();
        key.dedup();

        let id = TaskId::new();
        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return Err(TaskError::ShutDown);
            }

            let now = Utc::now();
            let mut superseded = Vec::new();
            for record in state.tasks.values_mut() {
                if record.key != key || record.status.state.is_terminal() {
                    continue;
                }
                tracing::info!(task = %record.status.id, by = %id, "Refresh task superseded");
                if let Some(handle) = record.abort.take() {
                    handle.abort();
                }
                record.status.state = TaskState::Failed;
                record.status.error = Some(SUPERSEDED.to_string());
                record.status.completed_at = Some(now);
                superseded.push(record.status.id);
            }
            for old in superseded {
                state.mark_finished(old);
            }
            state.prune(&self.inner.settings);

            let status = TaskStatus {
                id,
                state: TaskState::Pending,
                priority,
                block_ids: block_ids.clone(),
                attempts: 0,
                created_at: now,
                started_at: None,
                completed_at: None,
                outcome: None,
                error: None,
            };
            let spec = Arc::new(TaskSpec {
                block_ids,
                priority,
                snapshot,
            });
            state.tasks.insert(
                id,
                Record {
                    status,
                    spec,
                    key,
                    abort: None,
                },
            );
            let seq = state.seq;
            state.seq += 1;
            state.heap.push(Queued { priority, seq, id });
        }

        tracing::debug!(task = %id, %priority, "Refresh task queued");
        self.inner.work.notify_one();
        self.inner.changed.notify_waiters();
        Ok(id)
    }

    #[must_use]
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner
            .state()
            .tasks
            .get(&id)
            .map(|record| record.status.clone())
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(&self, id: TaskId) -> Option<TaskStatus> {
        loop {
            let mut changed = pin!(self.inner.changed.notified());
            changed.as_mut().enable();
            let status = self.status(id)?;
            if status.state.is_terminal() {
                return Some(status);
            }
            changed.await;
        }
    }

    /// Stop accepting tasks, let workers drain the queue, then join them.
    pub async fn shutdown(&self) {
        self.inner.state().shutting_down = true;
        self.inner.work.notify_waiters();

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Refresh worker ended abnormally");
            }
        }
        tracing::info!("Refresh queue shut down");
    }
}
