//! Ledger client facade
//!
//! Every operation validates its amount at the asset's precision, checks the
//! live ledger state it depends on, and only then submits. A rejected
//! precondition never reaches the backend's `submit`, so it never produces an
//! operation handle. Submission returns as soon as the ledger accepts the
//! transaction; settlement is the poller's job.

pub mod amount;
pub mod chain;
pub mod provider;

pub use amount::{Asset, TokenAmount};
pub use chain::ChainBackend;
pub use provider::RpcProvider;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::task::{OperationHandle, StepAction, TaskParams};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// On-ledger loan state for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoanPosition {
    pub loan_amount: U256,
    pub collateral: U256,
    pub interest: U256,
    /// Unix seconds
    pub start_time: u64,
    pub end_time: u64,
    pub active: bool,
    pub liquidated: bool,
}

impl LoanPosition {
    pub fn total_due(&self) -> U256 {
        self.loan_amount.saturating_add(self.interest)
    }
}

/// Loan position formatted for display: USDC legs at 6 decimals, collateral
/// at 18
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanDetails {
    pub loan_amount: String,
    pub collateral_amount: String,
    pub start_time: u64,
    pub end_time: u64,
    pub active: bool,
    pub liquidated: bool,
    pub interest: String,
    pub total_due: String,
}

impl From<&LoanPosition> for LoanDetails {
    fn from(loan: &LoanPosition) -> Self {
        let usdc = |raw| TokenAmount::from_raw(Asset::Usdc, raw).units();
        Self {
            loan_amount: usdc(loan.loan_amount),
            collateral_amount: TokenAmount::from_raw(Asset::Eth, loan.collateral).units(),
            start_time: loan.start_time,
            end_time: loan.end_time,
            active: loan.active,
            liquidated: loan.liquidated,
            interest: usdc(loan.interest),
            total_due: usdc(loan.total_due()),
        }
    }
}

/// A validated write against the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    DepositCollateral {
        session: String,
        amount: U256,
    },
    DepositPrincipal {
        session: String,
        amount: U256,
    },
    Borrow {
        session: String,
        amount: U256,
        recipient: Address,
    },
    Repay {
        session: String,
        amount: U256,
    },
    WithdrawCollateral {
        session: String,
        amount: U256,
    },
    WithdrawPrincipal {
        session: String,
        amount: U256,
    },
}

impl LedgerCall {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerCall::DepositCollateral { .. } => "deposit_collateral",
            LedgerCall::DepositPrincipal { .. } => "deposit_principal",
            LedgerCall::Borrow { .. } => "borrow",
            LedgerCall::Repay { .. } => "repay",
            LedgerCall::WithdrawCollateral { .. } => "withdraw_collateral",
            LedgerCall::WithdrawPrincipal { .. } => "withdraw_principal",
        }
    }
}

/// Transport to the external ledger: live-state reads plus one write path
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn loan_position(&self, session: &str) -> CoordinatorResult<LoanPosition>;

    /// USDC a lender session has deposited into the pool
    async fn lender_deposit(&self, session: &str) -> CoordinatorResult<U256>;

    /// USDC the pool can currently lend or pay out
    async fn available_liquidity(&self) -> CoordinatorResult<U256>;

    /// Operator wallet USDC balance
    async fn usdc_balance(&self) -> CoordinatorResult<U256>;

    /// Operator wallet ETH balance
    async fn eth_balance(&self) -> CoordinatorResult<U256>;

    async fn submit(&self, call: LedgerCall) -> CoordinatorResult<OperationHandle>;

    async fn health_check(&self) -> bool;
}

/// Typed, validated ledger operations used by the orchestrator
pub struct LedgerFacade {
    backend: Arc<dyn LedgerBackend>,
}

impl LedgerFacade {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self { backend }
    }

    /// Post ETH collateral for a session
    pub async fn deposit_collateral(
        &self,
        session: &str,
        amount: &str,
    ) -> CoordinatorResult<OperationHandle> {
        let session = validate_session(session)?;
        let amount = TokenAmount::parse(Asset::Eth, amount)?;

        let balance = self.backend.eth_balance().await?;
        if balance < amount.raw() {
            return Err(rejected(
                StepAction::DepositCollateral,
                format!(
                    "insufficient ETH balance: have {}, need {}",
                    TokenAmount::from_raw(Asset::Eth, balance),
                    amount
                ),
            ));
        }

        self.submit(LedgerCall::DepositCollateral {
            session,
            amount: amount.raw(),
        })
        .await
    }

    /// Deposit lender USDC into the pool
    pub async fn deposit_principal(
        &self,
        session: &str,
        amount: &str,
    ) -> CoordinatorResult<OperationHandle> {
        let session = validate_session(session)?;
        let amount = TokenAmount::parse(Asset::Usdc, amount)?;

        let balance = self.backend.usdc_balance().await?;
        if balance < amount.raw() {
            return Err(rejected(
                StepAction::DepositPrincipal,
                format!(
                    "insufficient USDC balance: have {}, need {}",
                    TokenAmount::from_raw(Asset::Usdc, balance),
                    amount
                ),
            ));
        }

        self.submit(LedgerCall::DepositPrincipal {
            session,
            amount: amount.raw(),
        })
        .await
    }

    /// Take a USDC loan against posted collateral, paid to `recipient`
    pub async fn borrow(
        &self,
        session: &str,
        amount: &str,
        recipient: &str,
    ) -> CoordinatorResult<OperationHandle> {
        let session = validate_session(session)?;
        let amount = TokenAmount::parse(Asset::Usdc, amount)?;
        let recipient = validate_address(recipient)?;

        let loan = self.backend.loan_position(&session).await?;
        if loan.active {
            return Err(rejected(
                StepAction::Borrow,
                "an active loan already exists".to_string(),
            ));
        }
        if loan.collateral.is_zero() {
            return Err(rejected(
                StepAction::Borrow,
                "no collateral deposited".to_string(),
            ));
        }

        let liquidity = self.backend.available_liquidity().await?;
        if liquidity < amount.raw() {
            return Err(rejected(
                StepAction::Borrow,
                format!(
                    "insufficient liquidity: available {}",
                    TokenAmount::from_raw(Asset::Usdc, liquidity)
                ),
            ));
        }

        self.submit(LedgerCall::Borrow {
            session,
            amount: amount.raw(),
            recipient,
        })
        .await
    }

    /// Repay an active loan
    pub async fn repay(&self, session: &str, amount: &str) -> CoordinatorResult<OperationHandle> {
        let session = validate_session(session)?;
        let amount = TokenAmount::parse(Asset::Usdc, amount)?;

        let loan = self.backend.loan_position(&session).await?;
        if loan.liquidated {
            return Err(rejected(
                StepAction::Repay,
                "loan was liquidated".to_string(),
            ));
        }
        if !loan.active {
            return Err(rejected(
                StepAction::Repay,
                "no active loan to repay".to_string(),
            ));
        }
        if amount.raw() > loan.total_due() {
            return Err(rejected(
                StepAction::Repay,
                format!(
                    "repayment exceeds total due of {}",
                    TokenAmount::from_raw(Asset::Usdc, loan.total_due())
                ),
            ));
        }

        let balance = self.backend.usdc_balance().await?;
        if balance < amount.raw() {
            return Err(rejected(
                StepAction::Repay,
                format!(
                    "insufficient USDC balance: have {}, need {}",
                    TokenAmount::from_raw(Asset::Usdc, balance),
                    amount
                ),
            ));
        }

        self.submit(LedgerCall::Repay {
            session,
            amount: amount.raw(),
        })
        .await
    }

    /// Release posted collateral once no loan is outstanding
    pub async fn withdraw_collateral(
        &self,
        session: &str,
        amount: &str,
    ) -> CoordinatorResult<OperationHandle> {
        let session = validate_session(session)?;
        let amount = TokenAmount::parse(Asset::Eth, amount)?;

        let loan = self.backend.loan_position(&session).await?;
        if loan.liquidated {
            return Err(rejected(
                StepAction::WithdrawCollateral,
                "collateral was seized by liquidation".to_string(),
            ));
        }
        if loan.active {
            return Err(rejected(
                StepAction::WithdrawCollateral,
                "collateral is locked by an active loan".to_string(),
            ));
        }
        if loan.collateral < amount.raw() {
            return Err(rejected(
                StepAction::WithdrawCollateral,
                format!(
                    "insufficient collateral: posted {}",
                    TokenAmount::from_raw(Asset::Eth, loan.collateral)
                ),
            ));
        }

        self.submit(LedgerCall::WithdrawCollateral {
            session,
            amount: amount.raw(),
        })
        .await
    }

    /// Withdraw lender USDC from the pool
    pub async fn withdraw_principal(
        &self,
        session: &str,
        amount: &str,
    ) -> CoordinatorResult<OperationHandle> {
        let session = validate_session(session)?;
        let amount = TokenAmount::parse(Asset::Usdc, amount)?;

        let deposited = self.backend.lender_deposit(&session).await?;
        if deposited < amount.raw() {
            return Err(rejected(
                StepAction::WithdrawPrincipal,
                format!(
                    "insufficient deposit: have {}",
                    TokenAmount::from_raw(Asset::Usdc, deposited)
                ),
            ));
        }

        let liquidity = self.backend.available_liquidity().await?;
        if liquidity < amount.raw() {
            return Err(rejected(
                StepAction::WithdrawPrincipal,
                format!(
                    "insufficient liquidity: available {}",
                    TokenAmount::from_raw(Asset::Usdc, liquidity)
                ),
            ));
        }

        self.submit(LedgerCall::WithdrawPrincipal {
            session,
            amount: amount.raw(),
        })
        .await
    }

    /// Run the operation behind a workflow step with the task's inputs
    pub async fn execute(
        &self,
        action: StepAction,
        session: &str,
        params: &TaskParams,
    ) -> CoordinatorResult<OperationHandle> {
        let collateral = || required(&params.collateral, "collateral");
        let principal = || required(&params.principal, "principal");

        match action {
            StepAction::DepositCollateral => self.deposit_collateral(session, collateral()?).await,
            StepAction::DepositPrincipal => self.deposit_principal(session, principal()?).await,
            StepAction::Borrow => {
                let recipient = required(&params.recipient, "recipient")?;
                self.borrow(session, principal()?, recipient).await
            }
            StepAction::Repay => self.repay(session, principal()?).await,
            StepAction::WithdrawCollateral => {
                self.withdraw_collateral(session, collateral()?).await
            }
            StepAction::WithdrawPrincipal => self.withdraw_principal(session, principal()?).await,
        }
    }

    /// Current loan of a session as display strings
    pub async fn loan_details(&self, session: &str) -> CoordinatorResult<LoanDetails> {
        let session = validate_session(session)?;
        let loan = self.backend.loan_position(&session).await?;
        Ok(LoanDetails::from(&loan))
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    async fn submit(&self, call: LedgerCall) -> CoordinatorResult<OperationHandle> {
        let name = call.name();
        let handle = self.backend.submit(call).await?;
        info!("Submitted {}: {}", name, handle);
        Ok(handle)
    }
}

fn rejected(action: StepAction, reason: String) -> CoordinatorError {
    warn!("Precondition for {} failed: {}", action, reason);
    crate::metrics::record_precondition_rejection(action.as_str());
    CoordinatorError::PreconditionFailed(reason)
}

fn required<'a>(value: &'a Option<String>, name: &str) -> CoordinatorResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| CoordinatorError::Validation(format!("missing {}", name)))
}

fn validate_session(session: &str) -> CoordinatorResult<String> {
    let session = session.trim();
    if session.is_empty() {
        return Err(CoordinatorError::Validation(
            "session must not be empty".to_string(),
        ));
    }
    Ok(session.to_string())
}

fn validate_address(address: &str) -> CoordinatorResult<Address> {
    let parsed = Address::from_str(address.trim())
        .map_err(|e| CoordinatorError::Validation(format!("Invalid address {:?}: {}", address, e)))?;
    if parsed.is_zero() {
        return Err(CoordinatorError::Validation(
            "recipient must not be the zero address".to_string(),
        ));
    }
    Ok(parsed)
}
