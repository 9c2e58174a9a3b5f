//! Task model for money-moving workflows
//!
//! A task is one user's run through a fixed workflow (`TaskType`). Its
//! `progress` names the last completed step and only moves forward along the
//! path defined in [`path`], or to `Failed`.

pub mod path;

pub use path::{NextStep, Step, StepAction};

use crate::error::{CoordinatorError, CoordinatorResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Workflow kind, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "SendUSDC")]
    SendUsdc,
    PayLoan,
    GetLoan,
    #[serde(rename = "WithdrawETH")]
    WithdrawEth,
    WithdrawDeposit,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::SendUsdc,
        TaskType::PayLoan,
        TaskType::GetLoan,
        TaskType::WithdrawEth,
        TaskType::WithdrawDeposit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SendUsdc => "SendUSDC",
            TaskType::PayLoan => "PayLoan",
            TaskType::GetLoan => "GetLoan",
            TaskType::WithdrawEth => "WithdrawETH",
            TaskType::WithdrawDeposit => "WithdrawDeposit",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoordinatorError::Validation(format!("Unknown task type: {}", s)))
    }
}

/// Progress of a task. One flat set shared by all workflows; which values a
/// given task may hold is decided by its type's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskProgress {
    #[serde(rename = "ETHToMainWallet")]
    EthToMainWallet,
    #[serde(rename = "ETHToBlockchain")]
    EthToBlockchain,
    DepositCollateral,
    SendingLoan,
    #[serde(rename = "USDCToBlockchain")]
    UsdcToBlockchain,
    #[serde(rename = "USDCToMainWallet")]
    UsdcToMainWallet,
    #[serde(rename = "USDCToUserWallet")]
    UsdcToUserWallet,
    RepayingLoan,
    RepayingCollateral,
    #[serde(rename = "WithdrawUSDC")]
    WithdrawUsdc,
    RefundingCollateral,
    UpdateCircle,
    Done,
    Failed,
    Started,
}

impl TaskProgress {
    pub const ALL: [TaskProgress; 15] = [
        TaskProgress::EthToMainWallet,
        TaskProgress::EthToBlockchain,
        TaskProgress::DepositCollateral,
        TaskProgress::SendingLoan,
        TaskProgress::UsdcToBlockchain,
        TaskProgress::UsdcToMainWallet,
        TaskProgress::UsdcToUserWallet,
        TaskProgress::RepayingLoan,
        TaskProgress::RepayingCollateral,
        TaskProgress::WithdrawUsdc,
        TaskProgress::RefundingCollateral,
        TaskProgress::UpdateCircle,
        TaskProgress::Done,
        TaskProgress::Failed,
        TaskProgress::Started,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskProgress::EthToMainWallet => "ETHToMainWallet",
            TaskProgress::EthToBlockchain => "ETHToBlockchain",
            TaskProgress::DepositCollateral => "DepositCollateral",
            TaskProgress::SendingLoan => "SendingLoan",
            TaskProgress::UsdcToBlockchain => "USDCToBlockchain",
            TaskProgress::UsdcToMainWallet => "USDCToMainWallet",
            TaskProgress::UsdcToUserWallet => "USDCToUserWallet",
            TaskProgress::RepayingLoan => "RepayingLoan",
            TaskProgress::RepayingCollateral => "RepayingCollateral",
            TaskProgress::WithdrawUsdc => "WithdrawUSDC",
            TaskProgress::RefundingCollateral => "RefundingCollateral",
            TaskProgress::UpdateCircle => "UpdateCircle",
            TaskProgress::Done => "Done",
            TaskProgress::Failed => "Failed",
            TaskProgress::Started => "Started",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskProgress::Done | TaskProgress::Failed)
    }
}

impl fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskProgress {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskProgress::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoordinatorError::Validation(format!("Unknown task progress: {}", s)))
    }
}

/// Workflow inputs captured at creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// ETH collateral, decimal string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collateral: Option<String>,
    /// USDC principal, decimal string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Address receiving a loan payout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

impl TaskParams {
    /// Check that every input the workflow's steps consume is present
    pub fn validate_for(&self, task_type: TaskType) -> CoordinatorResult<()> {
        for step in task_type.steps() {
            let action = step.action;
            if action.uses_collateral() && is_blank(&self.collateral) {
                return Err(CoordinatorError::Validation(format!(
                    "{} requires a collateral amount",
                    task_type
                )));
            }
            if !action.uses_collateral() && is_blank(&self.principal) {
                return Err(CoordinatorError::Validation(format!(
                    "{} requires a principal amount",
                    task_type
                )));
            }
            if action.uses_recipient() && is_blank(&self.recipient) {
                return Err(CoordinatorError::Validation(format!(
                    "{} requires a recipient address",
                    task_type
                )));
            }
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// One user workflow instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: String,
    pub task_type: TaskType,
    pub progress: TaskProgress,
    pub params: TaskParams,
    /// Optimistic-lock stamp, bumped by every successful advance
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh task at `Started`
    pub fn new(user_id: &str, task_type: TaskType, params: TaskParams) -> CoordinatorResult<Self> {
        if user_id.trim().is_empty() {
            return Err(CoordinatorError::Validation(
                "user_id must not be empty".to_string(),
            ));
        }
        params.validate_for(task_type)?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            task_type,
            progress: TaskProgress::Started,
            params,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Reject stored rows whose progress is not on their type's path
    pub fn ensure_consistent(&self) -> CoordinatorResult<()> {
        if self.task_type.is_on_path(self.progress) {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidStateTransition {
                from: self.task_type.to_string(),
                to: self.progress.to_string(),
            })
        }
    }

    /// Forward-only along the path, or to `Failed`; nothing leaves a terminal state
    pub fn check_transition(&self, to: TaskProgress) -> CoordinatorResult<()> {
        let invalid = || CoordinatorError::InvalidStateTransition {
            from: self.progress.to_string(),
            to: to.to_string(),
        };

        if self.progress.is_terminal() {
            return Err(invalid());
        }
        if to == TaskProgress::Failed {
            return Ok(());
        }
        match self.task_type.successor(self.progress) {
            Some(next) if next == to => Ok(()),
            _ => Err(invalid()),
        }
    }
}

/// Opaque identifier of a submitted external operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Submitted,
    Complete,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Submitted => "submitted",
            OperationStatus::Complete => "complete",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(OperationStatus::Submitted),
            "complete" => Ok(OperationStatus::Complete),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(CoordinatorError::Validation(format!(
                "Unknown operation status: {}",
                other
            ))),
        }
    }
}

/// Persisted handle of the operation submitted for one step of a task.
/// Written before polling starts so a restart resumes the same handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub task_id: Uuid,
    pub step_index: usize,
    pub handle: OperationHandle,
    pub status: OperationStatus,
    pub submitted_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    pub fn submitted(task_id: Uuid, step_index: usize, handle: OperationHandle) -> Self {
        Self {
            task_id,
            step_index,
            handle,
            status: OperationStatus::Submitted,
            submitted_at: Utc::now(),
            settled_at: None,
        }
    }
}

/// Count of tasks per progress value
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub by_progress: BTreeMap<String, u64>,
}

impl TaskStats {
    pub fn total(&self) -> u64 {
        self.by_progress.values().sum()
    }
}
