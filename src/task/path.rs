//! Per-workflow step tables
//!
//! Each `TaskType` owns an ordered list of steps. A step pairs the ledger
//! action to run with the progress label recorded once that action settles.
//! After the last step a finalisation pass re-checks the last operation's
//! settlement and moves the task to `Done`.

use super::{TaskProgress, TaskType};
use crate::error::{CoordinatorError, CoordinatorResult};

use serde::Serialize;
use std::fmt;

/// Ledger operation executed by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    DepositCollateral,
    DepositPrincipal,
    Borrow,
    Repay,
    WithdrawCollateral,
    WithdrawPrincipal,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::DepositCollateral => "deposit_collateral",
            StepAction::DepositPrincipal => "deposit_principal",
            StepAction::Borrow => "borrow",
            StepAction::Repay => "repay",
            StepAction::WithdrawCollateral => "withdraw_collateral",
            StepAction::WithdrawPrincipal => "withdraw_principal",
        }
    }

    /// ETH-denominated actions take the task's collateral amount; the rest take principal
    pub fn uses_collateral(&self) -> bool {
        matches!(
            self,
            StepAction::DepositCollateral | StepAction::WithdrawCollateral
        )
    }

    pub fn uses_recipient(&self) -> bool {
        matches!(self, StepAction::Borrow)
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Progress recorded once the action settles as complete
    pub progress: TaskProgress,
    pub action: StepAction,
}

/// What the orchestrator must do next for a non-terminal task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Run `step`, the `index`-th entry of the path
    Execute { index: usize, step: Step },
    /// All steps settled; confirm the last operation and finish
    Finalize { last_index: usize },
}

const GET_LOAN: &[Step] = &[
    Step {
        progress: TaskProgress::DepositCollateral,
        action: StepAction::DepositCollateral,
    },
    Step {
        progress: TaskProgress::SendingLoan,
        action: StepAction::Borrow,
    },
];

const PAY_LOAN: &[Step] = &[
    Step {
        progress: TaskProgress::RepayingLoan,
        action: StepAction::Repay,
    },
    Step {
        progress: TaskProgress::RepayingCollateral,
        action: StepAction::WithdrawCollateral,
    },
];

const SEND_USDC: &[Step] = &[Step {
    progress: TaskProgress::UsdcToBlockchain,
    action: StepAction::DepositPrincipal,
}];

const WITHDRAW_DEPOSIT: &[Step] = &[Step {
    progress: TaskProgress::WithdrawUsdc,
    action: StepAction::WithdrawPrincipal,
}];

const WITHDRAW_ETH: &[Step] = &[Step {
    progress: TaskProgress::RefundingCollateral,
    action: StepAction::WithdrawCollateral,
}];

impl TaskType {
    /// Ordered steps for this workflow
    pub fn steps(self) -> &'static [Step] {
        match self {
            TaskType::GetLoan => GET_LOAN,
            TaskType::PayLoan => PAY_LOAN,
            TaskType::SendUsdc => SEND_USDC,
            TaskType::WithdrawDeposit => WITHDRAW_DEPOSIT,
            TaskType::WithdrawEth => WITHDRAW_ETH,
        }
    }

    /// Full progress path, `Started` through `Done`
    pub fn path(self) -> Vec<TaskProgress> {
        std::iter::once(TaskProgress::Started)
            .chain(self.steps().iter().map(|s| s.progress))
            .chain(std::iter::once(TaskProgress::Done))
            .collect()
    }

    /// Whether a task of this type may ever hold `progress`
    pub fn is_on_path(self, progress: TaskProgress) -> bool {
        progress == TaskProgress::Failed || self.path().contains(&progress)
    }

    /// The single progress value that may follow `progress` on success
    pub fn successor(self, progress: TaskProgress) -> Option<TaskProgress> {
        let path = self.path();
        let position = path.iter().position(|p| *p == progress)?;
        path.get(position + 1).copied()
    }

    /// Map the current progress to the next unit of work
    pub fn next_step(self, progress: TaskProgress) -> CoordinatorResult<NextStep> {
        let steps = self.steps();

        if progress == TaskProgress::Started {
            return Ok(NextStep::Execute {
                index: 0,
                step: steps[0],
            });
        }

        let completed = steps
            .iter()
            .position(|s| s.progress == progress)
            .ok_or_else(|| CoordinatorError::InvalidStateTransition {
                from: progress.to_string(),
                to: format!("next step of {}", self),
            })?;

        match steps.get(completed + 1) {
            Some(step) => Ok(NextStep::Execute {
                index: completed + 1,
                step: *step,
            }),
            None => Ok(NextStep::Finalize {
                last_index: completed,
            }),
        }
    }
}
