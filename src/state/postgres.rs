//! PostgreSQL task store

use super::TaskStore;
use crate::config::DatabaseConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::task::{
    OperationHandle, OperationRecord, OperationStatus, Task, TaskParams, TaskProgress, TaskStats,
    TaskType,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TASK_COLUMNS: &str =
    "id, user_id, task_type, progress, params, version, created_at, updated_at";

const OPERATION_COLUMNS: &str = "task_id, step_index, handle, status, submitted_at, settled_at";

/// Task store for PostgreSQL persistence
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                task_type VARCHAR(32) NOT NULL,
                progress VARCHAR(32) NOT NULL,
                params JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_user
            ON tasks (user_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_active
            ON tasks (progress)
            WHERE progress NOT IN ('Done', 'Failed')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_operations (
                task_id UUID NOT NULL REFERENCES tasks (id),
                step_index INTEGER NOT NULL,
                handle VARCHAR(128) NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'submitted',
                submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                settled_at TIMESTAMPTZ,
                PRIMARY KEY (task_id, step_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn exists(&self, task_id: Uuid) -> CoordinatorResult<bool> {
        let row = sqlx::query("SELECT 1 FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn task_from_row(row: &PgRow) -> CoordinatorResult<Task> {
    let task_type: String = row.try_get("task_type")?;
    let progress: String = row.try_get("progress")?;
    let params: Json<TaskParams> = row.try_get("params")?;

    let task = Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        task_type: task_type.parse()?,
        progress: progress.parse()?,
        params: params.0,
        version: row.try_get("version")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    };
    task.ensure_consistent()?;
    Ok(task)
}

fn operation_from_row(row: &PgRow) -> CoordinatorResult<OperationRecord> {
    let step_index: i32 = row.try_get("step_index")?;
    let handle: String = row.try_get("handle")?;
    let status: String = row.try_get("status")?;

    Ok(OperationRecord {
        task_id: row.try_get("task_id")?,
        step_index: usize::try_from(step_index)
            .map_err(|_| CoordinatorError::Internal(format!("negative step index {}", step_index)))?,
        handle: OperationHandle::new(handle),
        status: status.parse()?,
        submitted_at: row.try_get("submitted_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn step_index_param(step_index: usize) -> CoordinatorResult<i32> {
    i32::try_from(step_index)
        .map_err(|_| CoordinatorError::Internal(format!("step index {} out of range", step_index)))
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(
        &self,
        user_id: &str,
        task_type: TaskType,
        params: TaskParams,
    ) -> CoordinatorResult<Task> {
        let task = Task::new(user_id, task_type, params)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, user_id, task_type, progress, params, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(task.id)
        .bind(&task.user_id)
        .bind(task.task_type.as_str())
        .bind(task.progress.as_str())
        .bind(Json(&task.params))
        .bind(task.version)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Created {} task {} for {}", task.task_type, task.id, task.user_id);
        Ok(task)
    }

    async fn get(&self, task_id: Uuid) -> CoordinatorResult<Task> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CoordinatorError::NotFound { task_id })?;

        task_from_row(&row)
    }

    async fn advance(&self, task: &Task, progress: TaskProgress) -> CoordinatorResult<Task> {
        task.check_transition(progress)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET progress = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2 AND version = $3
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(progress.as_str())
        .bind(task.id)
        .bind(task.version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return task_from_row(&row);
        }

        if self.exists(task.id).await? {
            Err(CoordinatorError::ConcurrentModification { task_id: task.id })
        } else {
            Err(CoordinatorError::NotFound { task_id: task.id })
        }
    }

    async fn record_operation(&self, record: &OperationRecord) -> CoordinatorResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_operations (task_id, step_index, handle, status, submitted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id, step_index) DO NOTHING
            "#,
        )
        .bind(record.task_id)
        .bind(step_index_param(record.step_index)?)
        .bind(record.handle.as_str())
        .bind(record.status.as_str())
        .bind(record.submitted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                "Step {} of task {} already has an operation record",
                record.step_index, record.task_id
            );
            return Err(CoordinatorError::ConcurrentModification {
                task_id: record.task_id,
            });
        }

        Ok(())
    }

    async fn operation(
        &self,
        task_id: Uuid,
        step_index: usize,
    ) -> CoordinatorResult<Option<OperationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_operations WHERE task_id = $1 AND step_index = $2",
            OPERATION_COLUMNS
        ))
        .bind(task_id)
        .bind(step_index_param(step_index)?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(operation_from_row).transpose()
    }

    async fn operations(&self, task_id: Uuid) -> CoordinatorResult<Vec<OperationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_operations WHERE task_id = $1 ORDER BY step_index",
            OPERATION_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(operation_from_row).collect()
    }

    async fn settle_operation(
        &self,
        task_id: Uuid,
        step_index: usize,
        status: OperationStatus,
    ) -> CoordinatorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_operations
            SET status = $1, settled_at = NOW()
            WHERE task_id = $2 AND step_index = $3
            "#,
        )
        .bind(status.as_str())
        .bind(task_id)
        .bind(step_index_param(step_index)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::NotFound { task_id });
        }
        Ok(())
    }

    async fn active_tasks(&self) -> CoordinatorResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM tasks
            WHERE progress NOT IN ('Done', 'Failed')
            ORDER BY created_at
            "#,
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            match task_from_row(row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping unreadable task row: {}", e),
            }
        }
        Ok(tasks)
    }

    async fn stats(&self) -> CoordinatorResult<TaskStats> {
        let rows = sqlx::query(
            r#"
            SELECT progress, COUNT(*) AS count
            FROM tasks
            GROUP BY progress
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TaskStats::default();
        for row in rows {
            let progress: String = row.try_get("progress")?;
            let count: i64 = row.try_get("count")?;
            stats.by_progress.insert(progress, count as u64);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
