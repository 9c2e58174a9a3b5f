//! In-process task store backed by `DashMap`

use super::TaskStore;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::task::{
    OperationRecord, OperationStatus, Task, TaskParams, TaskProgress, TaskStats, TaskType,
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Task store that lives and dies with the process. Shard locks make each
/// version check and write atomic.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<Uuid, Task>,
    operations: DashMap<(Uuid, usize), OperationRecord>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(
        &self,
        user_id: &str,
        task_type: TaskType,
        params: TaskParams,
    ) -> CoordinatorResult<Task> {
        let task = Task::new(user_id, task_type, params)?;
        self.tasks.insert(task.id, task.clone());
        debug!("Created {} task {} for {}", task.task_type, task.id, task.user_id);
        Ok(task)
    }

    async fn get(&self, task_id: Uuid) -> CoordinatorResult<Task> {
        self.tasks
            .get(&task_id)
            .map(|t| t.clone())
            .ok_or(CoordinatorError::NotFound { task_id })
    }

    async fn advance(&self, task: &Task, progress: TaskProgress) -> CoordinatorResult<Task> {
        task.check_transition(progress)?;

        let mut stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or(CoordinatorError::NotFound { task_id: task.id })?;

        if stored.version != task.version {
            return Err(CoordinatorError::ConcurrentModification { task_id: task.id });
        }

        stored.progress = progress;
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn record_operation(&self, record: &OperationRecord) -> CoordinatorResult<()> {
        if !self.tasks.contains_key(&record.task_id) {
            return Err(CoordinatorError::NotFound {
                task_id: record.task_id,
            });
        }

        match self.operations.entry((record.task_id, record.step_index)) {
            Entry::Occupied(_) => Err(CoordinatorError::ConcurrentModification {
                task_id: record.task_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn operation(
        &self,
        task_id: Uuid,
        step_index: usize,
    ) -> CoordinatorResult<Option<OperationRecord>> {
        Ok(self
            .operations
            .get(&(task_id, step_index))
            .map(|r| r.clone()))
    }

    async fn operations(&self, task_id: Uuid) -> CoordinatorResult<Vec<OperationRecord>> {
        let mut records: Vec<OperationRecord> = self
            .operations
            .iter()
            .filter(|entry| entry.key().0 == task_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.step_index);
        Ok(records)
    }

    async fn settle_operation(
        &self,
        task_id: Uuid,
        step_index: usize,
        status: OperationStatus,
    ) -> CoordinatorResult<()> {
        let mut record = self
            .operations
            .get_mut(&(task_id, step_index))
            .ok_or(CoordinatorError::NotFound { task_id })?;
        record.status = status;
        record.settled_at = Some(Utc::now());
        Ok(())
    }

    async fn active_tasks(&self) -> CoordinatorResult<Vec<Task>> {
        Ok(self
            .tasks
            .iter()
            .filter(|entry| !entry.progress.is_terminal())
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn stats(&self) -> CoordinatorResult<TaskStats> {
        let mut stats = TaskStats::default();
        for entry in self.tasks.iter() {
            *stats
                .by_progress
                .entry(entry.progress.to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        Ok(())
    }
}
