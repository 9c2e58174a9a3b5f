//! JSON-RPC provider with multi-endpoint failover

use crate::config::ChainConfig;
use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Round-robin set of HTTP providers for one chain
pub struct RpcProvider {
    chain_id: u64,
    providers: Vec<Provider<Http>>,
    current: AtomicUsize,
}

impl RpcProvider {
    pub fn new(config: &ChainConfig) -> CoordinatorResult<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(500)));
                    debug!("Added RPC endpoint for {}: {}", config.name, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if providers.is_empty() {
            return Err(CoordinatorError::ChainConnection(format!(
                "no valid RPC endpoints for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            chain_id: config.chain_id,
            providers,
            current: AtomicUsize::new(0),
        })
    }

    /// The active provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    pub fn failover(&self) {
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.providers.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to endpoint {}", self.chain_id, next);
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn get_block_number(&self) -> CoordinatorResult<u64> {
        for _ in 0..self.providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number on chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(CoordinatorError::ChainConnection(format!(
            "all endpoints failed for chain {}",
            self.chain_id
        )))
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        for _ in 0..self.providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!("Failed to get receipt {:?}: {}", tx_hash, e);
                    self.failover();
                }
            }
        }

        Err(CoordinatorError::ChainConnection(format!(
            "all endpoints failed fetching receipt {:?}",
            tx_hash
        )))
    }

    /// Read-only contract call against the latest block
    pub async fn call(&self, to: Address, data: Bytes) -> CoordinatorResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();

        for _ in 0..self.providers.len() {
            match self.http().call(&tx, None).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    warn!("eth_call to {:?} failed: {}", to, e);
                    self.failover();
                }
            }
        }

        Err(CoordinatorError::ChainConnection(format!(
            "all endpoints failed calling {:?}",
            to
        )))
    }

    pub async fn get_balance(&self, address: Address) -> CoordinatorResult<U256> {
        for _ in 0..self.providers.len() {
            match self.http().get_balance(address, None).await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    warn!("Failed to get balance of {:?}: {}", address, e);
                    self.failover();
                }
            }
        }

        Err(CoordinatorError::ChainConnection(format!(
            "all endpoints failed fetching balance of {:?}",
            address
        )))
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }
}
