//! Transaction settlement read from chain receipts
//!
//! A transaction counts as settled once its receipt is buried under the
//! configured number of confirmation blocks. Until then the status is
//! reported as pending so the poller keeps waiting.

use super::SettlementSource;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::RpcProvider;
use crate::task::OperationHandle;

use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256};
use std::sync::Arc;
use tracing::debug;

pub const PENDING: &str = "PENDING";
pub const CONFIRMING: &str = "CONFIRMING";

pub struct ChainSettlement {
    provider: Arc<RpcProvider>,
    confirmation_blocks: u64,
}

impl ChainSettlement {
    pub fn new(provider: Arc<RpcProvider>, confirmation_blocks: u64) -> Self {
        Self {
            provider,
            confirmation_blocks,
        }
    }
}

#[async_trait]
impl SettlementSource for ChainSettlement {
    async fn query_status(&self, handle: &OperationHandle) -> CoordinatorResult<String> {
        let tx_hash: H256 = handle.as_str().parse().map_err(|e| {
            CoordinatorError::Validation(format!("Invalid transaction hash {}: {}", handle, e))
        })?;

        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        let current_block = match &receipt {
            Some(r) if r.status == Some(1u64.into()) => self.provider.get_block_number().await?,
            _ => 0,
        };

        let status = classify_receipt(receipt.as_ref(), current_block, self.confirmation_blocks);
        debug!(
            "Transaction {:?} on chain {}: {}",
            tx_hash,
            self.provider.chain_id(),
            status
        );
        Ok(status.to_string())
    }
}

fn classify_receipt(
    receipt: Option<&TransactionReceipt>,
    current_block: u64,
    confirmation_blocks: u64,
) -> &'static str {
    let Some(receipt) = receipt else {
        return PENDING;
    };

    if receipt.status == Some(0u64.into()) {
        return "FAILED";
    }

    match receipt.block_number {
        None => PENDING,
        Some(mined) => {
            let confirmations = current_block.saturating_sub(mined.as_u64());
            if confirmations >= confirmation_blocks {
                "COMPLETE"
            } else {
                CONFIRMING
            }
        }
    }
}
