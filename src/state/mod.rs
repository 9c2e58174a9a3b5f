//! Task persistence
//!
//! Handles:
//! - Task creation and snapshot reads
//! - Optimistic-lock progress advances (version stamp)
//! - Operation handle records for resuming settlement polls after a restart
//! - Per-progress statistics

mod memory;
mod postgres;

pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;

use crate::error::CoordinatorResult;
use crate::task::{
    OperationRecord, OperationStatus, Task, TaskParams, TaskProgress, TaskStats, TaskType,
};

use async_trait::async_trait;
use uuid::Uuid;

/// Durable owner of task records. Every read is a snapshot; `advance` is the
/// only write path for progress and refuses stale snapshots.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task at `Started`
    async fn create(
        &self,
        user_id: &str,
        task_type: TaskType,
        params: TaskParams,
    ) -> CoordinatorResult<Task>;

    async fn get(&self, task_id: Uuid) -> CoordinatorResult<Task>;

    /// Move `task` to `progress` if the stored version still matches the
    /// caller's snapshot. Fails with `ConcurrentModification` otherwise.
    async fn advance(&self, task: &Task, progress: TaskProgress) -> CoordinatorResult<Task>;

    /// Persist the handle submitted for a step. A second record for the same
    /// step fails with `ConcurrentModification`.
    async fn record_operation(&self, record: &OperationRecord) -> CoordinatorResult<()>;

    async fn operation(
        &self,
        task_id: Uuid,
        step_index: usize,
    ) -> CoordinatorResult<Option<OperationRecord>>;

    /// All operation records of a task, ordered by step
    async fn operations(&self, task_id: Uuid) -> CoordinatorResult<Vec<OperationRecord>>;

    /// Record the terminal settlement of a step's operation
    async fn settle_operation(
        &self,
        task_id: Uuid,
        step_index: usize,
        status: OperationStatus,
    ) -> CoordinatorResult<()>;

    /// Tasks not yet `Done` or `Failed`
    async fn active_tasks(&self) -> CoordinatorResult<Vec<Task>>;

    async fn stats(&self) -> CoordinatorResult<TaskStats>;

    async fn health_check(&self) -> CoordinatorResult<()>;
}
