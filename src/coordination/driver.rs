//! Scheduling loop that drives active tasks through the orchestrator

use super::engine::Orchestrator;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::TaskStore;
use crate::task::Task;

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Periodically picks up non-terminal tasks and drives each one on its own
/// worker, so a long settlement wait never holds back other tasks.
///
/// The first scan after startup doubles as crash recovery: tasks left
/// mid-step resume from their recorded operation handles.
pub struct TaskDriver {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn TaskStore>,
    config: CoordinatorConfig,
    /// Root of every per-task token; cancelling it stops the driver
    root: CancellationToken,
    /// Tasks being driven right now, with their cancellation tokens
    running: DashMap<Uuid, CancellationToken>,
    /// Consecutive ambiguous outcomes per task
    ambiguous: DashMap<Uuid, u32>,
    /// Tasks withheld from scheduling until an operator resumes them
    parked: DashSet<Uuid>,
}

impl TaskDriver {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn TaskStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            config,
            root: CancellationToken::new(),
            running: DashMap::new(),
            ambiguous: DashMap::new(),
            parked: DashSet::new(),
        }
    }

    /// Main scheduling loop. Returns once `stop` was called and every worker
    /// has wound down.
    pub async fn run(self: Arc<Self>) -> CoordinatorResult<()> {
        let mut scan_interval = interval(Duration::from_millis(self.config.scan_interval_ms));
        scan_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut workers = JoinSet::new();

        info!("Task driver {} started", self.config.instance_id);

        loop {
            tokio::select! {
                _ = self.root.cancelled() => break,
                _ = scan_interval.tick() => {
                    if let Err(e) = self.scan(&mut workers).await {
                        error!("Task scan failed: {}", e);
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Task worker ended abnormally: {}", e);
                    }
                }
            }
        }

        // Waits observe the cancelled root token and return promptly
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Task worker ended abnormally: {}", e);
            }
        }

        info!("Task driver {} stopped", self.config.instance_id);
        Ok(())
    }

    /// Start a worker for every schedulable task up to the free concurrency
    /// budget. Tasks already running or parked are skipped. Returns how many
    /// workers were started.
    pub async fn scan(self: &Arc<Self>, workers: &mut JoinSet<()>) -> CoordinatorResult<usize> {
        let capacity = self
            .config
            .max_concurrent_tasks
            .max(1)
            .saturating_sub(self.running.len());
        if capacity == 0 {
            return Ok(0);
        }

        let batch: Vec<Task> = self
            .store
            .active_tasks()
            .await?
            .into_iter()
            .filter(|t| !self.running.contains_key(&t.id) && !self.parked.contains(&t.id))
            .take(capacity)
            .collect();

        if batch.is_empty() {
            return Ok(0);
        }

        debug!("Starting {} task workers", batch.len());
        let picked = batch.len();
        for task in batch {
            let token = self.root.child_token();
            self.running.insert(task.id, token.clone());
            let driver = Arc::clone(self);
            workers.spawn(async move { driver.drive_one(task, token).await });
        }
        Ok(picked)
    }

    /// Cancel the in-flight wait of one task and stop scheduling it. The task
    /// keeps its pre-step progress. Returns whether a wait was cancelled.
    pub fn abort(&self, task_id: Uuid) -> bool {
        self.parked.insert(task_id);
        match self.running.get(&task_id) {
            Some(token) => {
                token.cancel();
                info!("Task {} aborted", task_id);
                true
            }
            None => {
                debug!("Task {} parked with no step in flight", task_id);
                false
            }
        }
    }

    /// Make a parked task schedulable again
    pub fn resume(&self, task_id: Uuid) -> bool {
        self.ambiguous.remove(&task_id);
        let was_parked = self.parked.remove(&task_id).is_some();
        if was_parked {
            info!("Task {} resumed", task_id);
        }
        was_parked
    }

    pub fn parked(&self) -> Vec<Uuid> {
        self.parked.iter().map(|id| *id).collect()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn stop(&self) {
        info!("Task driver shutdown initiated");
        self.root.cancel();
    }

    async fn drive_one(&self, task: Task, token: CancellationToken) {
        let result = self.orchestrator.drive(task.id, &token).await;

        match result {
            Ok(current) => {
                self.ambiguous.remove(&task.id);
                debug!("Task {} now at {}", task.id, current.progress);
            }
            Err(e) if self.root.is_cancelled() => {
                debug!("Task {} interrupted by shutdown: {}", task.id, e);
            }
            Err(e) if e.is_retry_safe() => self.record_ambiguous(&task, e).await,
            Err(CoordinatorError::ConcurrentModification { .. }) => {
                debug!("Task {} is being driven elsewhere", task.id);
            }
            Err(e) => {
                error!("Task {} parked after error: {}", task.id, e);
                self.parked.insert(task.id);
            }
        }

        // Released only after parking decisions so a concurrent scan cannot
        // pick the task up in between
        self.running.remove(&task.id);
    }

    async fn record_ambiguous(&self, task: &Task, e: CoordinatorError) {
        // Any settled transition since the scan counts as progress
        if let Ok(current) = self.store.get(task.id).await {
            if current.progress != task.progress {
                self.ambiguous.remove(&task.id);
            }
        }

        let attempts = {
            let mut count = self.ambiguous.entry(task.id).or_insert(0);
            *count += 1;
            *count
        };

        if attempts >= self.config.max_ambiguous_attempts {
            error!(
                "Task {} parked after {} ambiguous attempts, needs operator attention: {}",
                task.id, attempts, e
            );
            self.parked.insert(task.id);
        } else {
            warn!(
                "Task {} outcome ambiguous ({}/{}), will resume: {}",
                task.id, attempts, self.config.max_ambiguous_attempts, e
            );
        }
    }
}
