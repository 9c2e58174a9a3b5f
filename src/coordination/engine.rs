//! Workflow state machine
//!
//! One call to [`Orchestrator::advance_step`] performs at most one transition:
//! it submits the next step's ledger operation (or resumes the one already
//! recorded for that step), waits for it to settle and moves the task
//! forward. Progress always names the last step whose operation settled.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::LedgerFacade;
use crate::settlement::{Settlement, SettlementPoller};
use crate::state::TaskStore;
use crate::task::{NextStep, OperationHandle, OperationRecord, Step, Task, TaskProgress};

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a single orchestration step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Already terminal, or another actor moved the task first
    Unchanged(Task),
    /// Progress moved to the next label or to `Done`
    Advanced(Task),
    /// The workflow was rejected or its operation failed externally
    Failed { task: Task, reason: String },
}

impl StepOutcome {
    pub fn task(&self) -> &Task {
        match self {
            StepOutcome::Unchanged(task) | StepOutcome::Advanced(task) => task,
            StepOutcome::Failed { task, .. } => task,
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    ledger: Arc<LedgerFacade>,
    poller: Arc<SettlementPoller>,
    settlement_timeout: Duration,
    /// Tasks with a step running in this process
    in_flight: DashSet<Uuid>,
}

/// Releases the in-flight slot when a step ends, however it ends
struct InFlight<'a> {
    set: &'a DashSet<Uuid>,
    task_id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.task_id);
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<LedgerFacade>,
        poller: Arc<SettlementPoller>,
        settlement_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            poller,
            settlement_timeout,
            in_flight: DashSet::new(),
        }
    }

    /// Perform the next transition of `task_id`.
    ///
    /// `Validation` and `InvalidAmount` errors leave the task untouched.
    /// Timeouts, poller outages and interruption leave it at its pre-step
    /// progress with the operation handle recorded, so calling again resumes
    /// the wait instead of submitting twice.
    pub async fn advance_step(
        &self,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<StepOutcome> {
        if !self.in_flight.insert(task_id) {
            debug!("Task {} already has a step in flight", task_id);
            return Err(CoordinatorError::ConcurrentModification { task_id });
        }
        let _slot = InFlight {
            set: &self.in_flight,
            task_id,
        };

        let task = self.store.get(task_id).await?;
        if task.progress.is_terminal() {
            return Ok(StepOutcome::Unchanged(task));
        }

        match task.task_type.next_step(task.progress)? {
            NextStep::Execute { index, step } => self.execute(task, index, step, cancel).await,
            NextStep::Finalize { last_index } => {
                let record = self
                    .store
                    .operation(task.id, last_index)
                    .await?
                    .ok_or_else(|| {
                        CoordinatorError::Internal(format!(
                            "task {} at {} has no operation for step {}",
                            task.id, task.progress, last_index
                        ))
                    })?;
                self.settle(task, last_index, &record.handle, TaskProgress::Done, cancel)
                    .await
            }
        }
    }

    /// Run steps until the task is terminal, another actor takes it over, or
    /// a step fails
    pub async fn drive(&self, task_id: Uuid, cancel: &CancellationToken) -> CoordinatorResult<Task> {
        loop {
            match self.advance_step(task_id, cancel).await? {
                StepOutcome::Advanced(task) if !task.progress.is_terminal() => continue,
                StepOutcome::Failed { task, reason } => {
                    debug!("Task {} stopped at {}: {}", task.id, task.progress, reason);
                    return Ok(task);
                }
                outcome => return Ok(outcome.task().clone()),
            }
        }
    }

    async fn execute(
        &self,
        task: Task,
        index: usize,
        step: Step,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<StepOutcome> {
        let handle = match self.store.operation(task.id, index).await? {
            Some(record) => {
                info!(
                    "Task {} resuming {} from recorded handle {}",
                    task.id, step.action, record.handle
                );
                record.handle
            }
            None => {
                let handle = match self
                    .ledger
                    .execute(step.action, &task.user_id, &task.params)
                    .await
                {
                    Ok(handle) => handle,
                    Err(e) if e.is_terminal_for_task() => {
                        return self.fail(task, e.to_string()).await;
                    }
                    Err(e) => return Err(e),
                };
                crate::metrics::record_operation_submitted(
                    task.task_type.as_str(),
                    step.action.as_str(),
                );

                let record = OperationRecord::submitted(task.id, index, handle.clone());
                if let Err(e) = self.store.record_operation(&record).await {
                    error!(
                        "Task {} submitted {} as {} but the handle was not recorded: {}",
                        task.id, step.action, handle, e
                    );
                    return Err(e);
                }
                handle
            }
        };

        self.settle(task, index, &handle, step.progress, cancel).await
    }

    async fn settle(
        &self,
        task: Task,
        index: usize,
        handle: &OperationHandle,
        on_complete: TaskProgress,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<StepOutcome> {
        let settlement = match self
            .poller
            .await_settlement(handle, self.settlement_timeout, cancel)
            .await
        {
            Ok(settlement) => settlement,
            Err(e) => {
                if e.should_alert() {
                    error!("Task {} left at {}: {}", task.id, task.progress, e);
                } else if e.is_retry_safe() {
                    warn!("Task {} left at {}: {}", task.id, task.progress, e);
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .store
            .settle_operation(task.id, index, settlement.into())
            .await
        {
            error!(
                "Task {} settlement record for {} is stale, write failed: {}",
                task.id, handle, e
            );
        }

        match settlement {
            Settlement::Complete => self.transition(task, on_complete).await,
            Settlement::Failed => {
                let error = CoordinatorError::ExternalFailure {
                    handle: handle.to_string(),
                    status: settlement.as_str().to_string(),
                };
                self.fail(task, error.to_string()).await
            }
            Settlement::Cancelled => {
                let error = CoordinatorError::Cancelled {
                    handle: handle.to_string(),
                };
                self.fail(task, error.to_string()).await
            }
        }
    }

    async fn transition(&self, task: Task, to: TaskProgress) -> CoordinatorResult<StepOutcome> {
        match self.store.advance(&task, to).await {
            Ok(updated) => {
                info!("Task {} advanced {} -> {}", updated.id, task.progress, to);
                if updated.progress.is_terminal() {
                    crate::metrics::record_task_finished(
                        updated.task_type.as_str(),
                        updated.progress.as_str(),
                    );
                }
                Ok(StepOutcome::Advanced(updated))
            }
            Err(CoordinatorError::ConcurrentModification { .. }) => self.reread(task.id).await,
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, task: Task, reason: String) -> CoordinatorResult<StepOutcome> {
        warn!("Task {} failed at {}: {}", task.id, task.progress, reason);
        match self.store.advance(&task, TaskProgress::Failed).await {
            Ok(updated) => {
                crate::metrics::record_task_finished(
                    updated.task_type.as_str(),
                    updated.progress.as_str(),
                );
                Ok(StepOutcome::Failed {
                    task: updated,
                    reason,
                })
            }
            Err(CoordinatorError::ConcurrentModification { .. }) => self.reread(task.id).await,
            Err(e) => Err(e),
        }
    }

    async fn reread(&self, task_id: Uuid) -> CoordinatorResult<StepOutcome> {
        let current = self.store.get(task_id).await?;
        debug!(
            "Task {} was moved to {} by another actor",
            task_id, current.progress
        );
        Ok(StepOutcome::Unchanged(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::ledger::testing::FakeLedger;
    use crate::settlement::testing::StatusBoard;
    use crate::state::MemoryTaskStore;
    use crate::task::{OperationStatus, TaskParams, TaskStats, TaskType};

    use async_trait::async_trait;
    use ethers::types::U256;

    struct Harness {
        store: Arc<MemoryTaskStore>,
        ledger: Arc<FakeLedger>,
        board: Arc<StatusBoard>,
        orchestrator: Orchestrator,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryTaskStore::new());
        let ledger = Arc::new(FakeLedger::funded());
        let board = Arc::new(StatusBoard::default());
        let poller = SettlementPoller::new(
            board.clone(),
            &SettlementConfig {
                poll_interval_ms: 5000,
                timeout_secs: 30,
                max_consecutive_errors: 3,
            },
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(LedgerFacade::new(ledger.clone())),
            Arc::new(poller),
            Duration::from_secs(30),
        );
        Harness {
            store,
            ledger,
            board,
            orchestrator,
        }
    }

    fn get_loan_params() -> TaskParams {
        TaskParams {
            collateral: Some("0.5".to_string()),
            principal: Some("100".to_string()),
            recipient: Some("0x70997970C51812dc3A010C7d01b50e0d17dc79C8".to_string()),
        }
    }

    fn send_usdc_params() -> TaskParams {
        TaskParams {
            principal: Some("250".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_loan_runs_to_done() {
        let h = harness();
        h.ledger.loan.lock().unwrap().collateral = U256::exp10(17) * 5;
        let task = h
            .store
            .create("borrower-1", TaskType::GetLoan, get_loan_params())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let first = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        assert_eq!(first.task().progress, TaskProgress::DepositCollateral);

        let second = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        assert_eq!(second.task().progress, TaskProgress::SendingLoan);

        let third = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        assert!(matches!(third, StepOutcome::Advanced(ref t) if t.progress == TaskProgress::Done));

        // finalisation re-checks the borrow without submitting anything new
        assert_eq!(h.ledger.submissions(), 2);
        let records = h.store.operations(task.id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == OperationStatus::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_stops_at_terminal_state() {
        let h = harness();
        let task = h
            .store
            .create("lender-1", TaskType::SendUsdc, send_usdc_params())
            .await
            .unwrap();

        let done = h
            .orchestrator
            .drive(task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.progress, TaskProgress::Done);
        assert!(h.orchestrator.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_precondition_failure_fails_task_without_submission() {
        let h = harness();
        {
            let mut loan = h.ledger.loan.lock().unwrap();
            loan.active = true;
            loan.collateral = U256::exp10(18);
        }
        let task = h
            .store
            .create(
                "borrower-1",
                TaskType::WithdrawEth,
                TaskParams {
                    collateral: Some("1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .advance_step(task.id, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            StepOutcome::Failed { task, reason } => {
                assert_eq!(task.progress, TaskProgress::Failed);
                assert!(reason.contains("active loan"), "{}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(h.ledger.submissions(), 0);
        assert!(h.store.operations(task.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_resume_without_resubmitting() {
        let h = harness();
        h.board.set_default("PENDING");
        let task = h
            .store
            .create("lender-1", TaskType::SendUsdc, send_usdc_params())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let result = h.orchestrator.advance_step(task.id, &cancel).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::SettlementTimeout { .. })
        ));
        assert_eq!(
            h.store.get(task.id).await.unwrap().progress,
            TaskProgress::Started
        );
        assert_eq!(h.ledger.submissions(), 1);

        h.board.set_default("COMPLETE");
        let outcome = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        assert_eq!(outcome.task().progress, TaskProgress::UsdcToBlockchain);
        assert_eq!(h.ledger.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_step_precondition_failure_keeps_first_handle_only() {
        let h = harness();
        {
            h.ledger.loan.lock().unwrap().collateral = U256::exp10(17) * 5;
            *h.ledger.liquidity.lock().unwrap() = U256::from(5_000_000u64);
        }
        let task = h
            .store
            .create("borrower-1", TaskType::GetLoan, get_loan_params())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let first = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        assert_eq!(first.task().progress, TaskProgress::DepositCollateral);

        let second = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        match second {
            StepOutcome::Failed { task, reason } => {
                assert_eq!(task.progress, TaskProgress::Failed);
                assert!(reason.contains("insufficient liquidity"), "{}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }

        assert_eq!(h.ledger.submissions(), 1);
        let records = h.store.operations(task.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].step_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_step_timeout_resumes_recorded_borrow() {
        let h = harness();
        h.ledger.loan.lock().unwrap().collateral = U256::exp10(17) * 5;
        h.board
            .statuses
            .insert("op-1".to_string(), "PENDING".to_string());
        let task = h
            .store
            .create("borrower-1", TaskType::GetLoan, get_loan_params())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        let result = h.orchestrator.advance_step(task.id, &cancel).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::SettlementTimeout { .. })
        ));
        assert_eq!(
            h.store.get(task.id).await.unwrap().progress,
            TaskProgress::DepositCollateral
        );
        assert_eq!(h.ledger.submissions(), 2);

        h.board
            .statuses
            .insert("op-1".to_string(), "COMPLETE".to_string());
        let outcome = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();
        assert_eq!(outcome.task().progress, TaskProgress::SendingLoan);
        assert_eq!(h.ledger.submissions(), 2);
    }

    /// Memory store whose settlement writes always fail
    struct StaleRecordStore(MemoryTaskStore);

    #[async_trait]
    impl TaskStore for StaleRecordStore {
        async fn create(
            &self,
            user_id: &str,
            task_type: TaskType,
            params: TaskParams,
        ) -> CoordinatorResult<Task> {
            self.0.create(user_id, task_type, params).await
        }

        async fn get(&self, task_id: Uuid) -> CoordinatorResult<Task> {
            self.0.get(task_id).await
        }

        async fn advance(&self, task: &Task, progress: TaskProgress) -> CoordinatorResult<Task> {
            self.0.advance(task, progress).await
        }

        async fn record_operation(&self, record: &OperationRecord) -> CoordinatorResult<()> {
            self.0.record_operation(record).await
        }

        async fn operation(
            &self,
            task_id: Uuid,
            step_index: usize,
        ) -> CoordinatorResult<Option<OperationRecord>> {
            self.0.operation(task_id, step_index).await
        }

        async fn operations(&self, task_id: Uuid) -> CoordinatorResult<Vec<OperationRecord>> {
            self.0.operations(task_id).await
        }

        async fn settle_operation(
            &self,
            _task_id: Uuid,
            _step_index: usize,
            _status: OperationStatus,
        ) -> CoordinatorResult<()> {
            Err(CoordinatorError::Internal("operations table unavailable".to_string()))
        }

        async fn active_tasks(&self) -> CoordinatorResult<Vec<Task>> {
            self.0.active_tasks().await
        }

        async fn stats(&self) -> CoordinatorResult<TaskStats> {
            self.0.stats().await
        }

        async fn health_check(&self) -> CoordinatorResult<()> {
            self.0.health_check().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_settlement_still_advances() {
        let store = Arc::new(StaleRecordStore(MemoryTaskStore::new()));
        let ledger = Arc::new(FakeLedger::funded());
        let poller = SettlementPoller::new(
            Arc::new(StatusBoard::default()),
            &SettlementConfig::default(),
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(LedgerFacade::new(ledger.clone())),
            Arc::new(poller),
            Duration::from_secs(30),
        );
        let task = store
            .create("lender-1", TaskType::SendUsdc, send_usdc_params())
            .await
            .unwrap();

        let done = orchestrator
            .drive(task.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.progress, TaskProgress::Done);
        assert_eq!(ledger.submissions(), 1);
        let record = store.operation(task.id, 0).await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Submitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_task_is_left_alone() {
        let h = harness();
        let task = h
            .store
            .create("lender-1", TaskType::SendUsdc, send_usdc_params())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        h.orchestrator.drive(task.id, &cancel).await.unwrap();

        let queries = h.board.queries();
        let again = h.orchestrator.advance_step(task.id, &cancel).await.unwrap();

        assert!(matches!(again, StepOutcome::Unchanged(ref t) if t.progress == TaskProgress::Done));
        assert_eq!(h.board.queries(), queries);
        assert_eq!(h.ledger.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_failure_and_cancellation_fail_task() {
        for (status, expected) in [
            ("FAILED", "failed externally with status FAILED"),
            ("CANCELLED", "cancelled externally"),
        ] {
            let h = harness();
            h.board.set_default(status);
            let task = h
                .store
                .create("lender-1", TaskType::SendUsdc, send_usdc_params())
                .await
                .unwrap();

            let outcome = h
                .orchestrator
                .advance_step(task.id, &CancellationToken::new())
                .await
                .unwrap();

            match outcome {
                StepOutcome::Failed { reason, .. } => {
                    assert!(reason.contains(expected), "{}: {}", status, reason)
                }
                other => panic!("{}: expected failure, got {:?}", status, other),
            }
            assert_eq!(
                h.store.get(task.id).await.unwrap().progress,
                TaskProgress::Failed
            );
            let record = h.store.operation(task.id, 0).await.unwrap().unwrap();
            assert_ne!(record.status, OperationStatus::Submitted);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_amount_leaves_task_untouched() {
        let h = harness();
        let task = h
            .store
            .create(
                "lender-1",
                TaskType::SendUsdc,
                TaskParams {
                    principal: Some("1.0000001".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = h
            .orchestrator
            .advance_step(task.id, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(CoordinatorError::InvalidAmount(_))));
        let stored = h.store.get(task.id).await.unwrap();
        assert_eq!(stored.progress, TaskProgress::Started);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_callers_cannot_both_run_a_step() {
        let h = harness();
        h.board.set_default("PENDING");
        let task = h
            .store
            .create("lender-1", TaskType::SendUsdc, send_usdc_params())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(h.orchestrator.advance_step(task.id, &cancel), async {
            let result = h.orchestrator.advance_step(task.id, &cancel).await;
            cancel.cancel();
            result
        });

        assert!(matches!(first, Err(CoordinatorError::Interrupted { .. })));
        assert!(matches!(
            second,
            Err(CoordinatorError::ConcurrentModification { .. })
        ));
        assert_eq!(h.ledger.submissions(), 1);
        assert_eq!(
            h.store.get(task.id).await.unwrap().progress,
            TaskProgress::Started
        );
    }
}
