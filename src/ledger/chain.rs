//! MicroLoan contract backend over JSON-RPC
//!
//! Reads go through the failover provider. Writes are signed by the operator
//! wallet and return as soon as the node accepts the transaction; the hash is
//! the operation handle.

use super::provider::RpcProvider;
use super::{LedgerBackend, LedgerCall, LoanPosition};
use crate::config::{ChainConfig, WalletConfig};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::task::OperationHandle;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::utils::id;
use std::sync::Arc;
use tracing::{debug, info};

/// Ledger backend talking to the deployed MicroLoan and USDC contracts
pub struct ChainBackend {
    provider: Arc<RpcProvider>,
    wallet: LocalWallet,
    microloan: Address,
    usdc: Address,
}

impl ChainBackend {
    pub fn new(
        provider: Arc<RpcProvider>,
        chain: &ChainConfig,
        wallet: &WalletConfig,
    ) -> CoordinatorResult<Self> {
        let wallet = load_wallet(&wallet.private_key_env)?.with_chain_id(chain.chain_id);
        let microloan = parse_address(&chain.microloan_address, "microloan_address")?;
        let usdc = parse_address(&chain.usdc_address, "usdc_address")?;

        info!(
            "Chain backend initialized on {} with operator {:?}",
            chain.name,
            wallet.address()
        );

        Ok(Self {
            provider,
            wallet,
            microloan,
            usdc,
        })
    }

    pub fn operator(&self) -> Address {
        self.wallet.address()
    }

    async fn read(
        &self,
        to: Address,
        signature: &str,
        args: &[Token],
        outputs: &[ParamType],
    ) -> CoordinatorResult<Vec<Token>> {
        let output = self.provider.call(to, encode_call(signature, args)).await?;
        abi::decode(outputs, &output)
            .map_err(|e| CoordinatorError::Contract(format!("decoding {}: {}", signature, e)))
    }

    async fn read_uint(
        &self,
        to: Address,
        signature: &str,
        args: &[Token],
    ) -> CoordinatorResult<U256> {
        let tokens = self.read(to, signature, args, &[ParamType::Uint(256)]).await?;
        tokens
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| CoordinatorError::Contract(format!("{} returned no uint", signature)))
    }

    /// Approve the MicroLoan contract to pull `amount` USDC if the current
    /// allowance is short. Waits for the approval to be mined.
    async fn ensure_allowance(&self, amount: U256) -> CoordinatorResult<()> {
        let allowance = self
            .read_uint(
                self.usdc,
                "allowance(address,address)",
                &[Token::Address(self.operator()), Token::Address(self.microloan)],
            )
            .await?;

        if allowance >= amount {
            debug!("USDC allowance {} covers {}", allowance, amount);
            return Ok(());
        }

        info!("Approving {} USDC units for {:?}", amount, self.microloan);
        let data = encode_call(
            "approve(address,uint256)",
            &[Token::Address(self.microloan), Token::Uint(amount)],
        );
        let tx = TransactionRequest::new().to(self.usdc).data(data);

        let client = SignerMiddleware::new(self.provider.http().clone(), self.wallet.clone());
        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| CoordinatorError::Contract(format!("approve: {}", e)))?;
        let approve_hash = pending.tx_hash();

        let receipt = pending
            .await
            .map_err(|e| CoordinatorError::ChainConnection(e.to_string()))?
            .ok_or_else(|| {
                CoordinatorError::Contract(format!("approval {:?} dropped", approve_hash))
            })?;

        if receipt.status != Some(1u64.into()) {
            return Err(CoordinatorError::Contract(format!(
                "approval {:?} reverted",
                approve_hash
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerBackend for ChainBackend {
    async fn loan_position(&self, session: &str) -> CoordinatorResult<LoanPosition> {
        let tokens = self
            .read(
                self.microloan,
                "getLoanInfo(string)",
                &[Token::String(session.to_string())],
                &LOAN_INFO,
            )
            .await?;
        decode_loan_info(tokens)
    }

    async fn lender_deposit(&self, session: &str) -> CoordinatorResult<U256> {
        self.read_uint(
            self.microloan,
            "lenderDeposits(string)",
            &[Token::String(session.to_string())],
        )
        .await
    }

    async fn available_liquidity(&self) -> CoordinatorResult<U256> {
        self.read_uint(self.microloan, "availableUSDC()", &[]).await
    }

    async fn usdc_balance(&self) -> CoordinatorResult<U256> {
        self.read_uint(
            self.usdc,
            "balanceOf(address)",
            &[Token::Address(self.operator())],
        )
        .await
    }

    async fn eth_balance(&self) -> CoordinatorResult<U256> {
        self.provider.get_balance(self.operator()).await
    }

    async fn submit(&self, call: LedgerCall) -> CoordinatorResult<OperationHandle> {
        if let LedgerCall::DepositPrincipal { amount, .. } | LedgerCall::Repay { amount, .. } = &call {
            self.ensure_allowance(*amount).await?;
        }

        let (data, value) = encode_ledger_call(&call);
        let mut tx = TransactionRequest::new().to(self.microloan).data(data);
        if !value.is_zero() {
            tx = tx.value(value);
        }

        let client = SignerMiddleware::new(self.provider.http().clone(), self.wallet.clone());
        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| CoordinatorError::Contract(format!("{}: {}", call.name(), e)))?;

        Ok(OperationHandle::new(format!("{:?}", pending.tx_hash())))
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}

/// Return layout of `getLoanInfo(string)`
const LOAN_INFO: [ParamType; 7] = [
    ParamType::Uint(256), // loanAmount
    ParamType::Uint(256), // collateralAmount
    ParamType::Uint(256), // startTime
    ParamType::Uint(256), // endTime
    ParamType::Bool,      // active
    ParamType::Bool,      // liquidated
    ParamType::Uint(256), // interest
];

fn decode_loan_info(tokens: Vec<Token>) -> CoordinatorResult<LoanPosition> {
    let malformed = || CoordinatorError::Contract("malformed getLoanInfo result".to_string());
    let mut fields = tokens.into_iter();
    let uint = |fields: &mut std::vec::IntoIter<Token>| {
        fields.next().and_then(Token::into_uint).ok_or_else(malformed)
    };

    let timestamp = |value: U256| u64::try_from(value).map_err(|_| malformed());

    let loan_amount = uint(&mut fields)?;
    let collateral = uint(&mut fields)?;
    let start_time = timestamp(uint(&mut fields)?)?;
    let end_time = timestamp(uint(&mut fields)?)?;
    let active = fields.next().and_then(Token::into_bool).ok_or_else(malformed)?;
    let liquidated = fields.next().and_then(Token::into_bool).ok_or_else(malformed)?;
    let interest = uint(&mut fields)?;

    Ok(LoanPosition {
        loan_amount,
        collateral,
        interest,
        start_time,
        end_time,
        active,
        liquidated,
    })
}

/// Calldata and attached ETH value for a ledger write
fn encode_ledger_call(call: &LedgerCall) -> (Bytes, U256) {
    match call {
        LedgerCall::DepositCollateral { session, amount } => (
            encode_call("depositCollateral(string)", &[Token::String(session.clone())]),
            *amount,
        ),
        LedgerCall::DepositPrincipal { session, amount } => (
            encode_call(
                "depositUSDC(uint256,string)",
                &[Token::Uint(*amount), Token::String(session.clone())],
            ),
            U256::zero(),
        ),
        LedgerCall::Borrow {
            session,
            amount,
            recipient,
        } => (
            encode_call(
                "takeLoan(uint256,string,address)",
                &[
                    Token::Uint(*amount),
                    Token::String(session.clone()),
                    Token::Address(*recipient),
                ],
            ),
            U256::zero(),
        ),
        LedgerCall::Repay { session, amount } => (
            encode_call(
                "repayLoan(uint256,string)",
                &[Token::Uint(*amount), Token::String(session.clone())],
            ),
            U256::zero(),
        ),
        LedgerCall::WithdrawCollateral { session, amount } => (
            encode_call(
                "withdrawCollateral(uint256,string)",
                &[Token::Uint(*amount), Token::String(session.clone())],
            ),
            U256::zero(),
        ),
        LedgerCall::WithdrawPrincipal { session, amount } => (
            encode_call(
                "withdrawUSDC(uint256,string)",
                &[Token::Uint(*amount), Token::String(session.clone())],
            ),
            U256::zero(),
        ),
    }
}

fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

fn load_wallet(env_var: &str) -> CoordinatorResult<LocalWallet> {
    let key = std::env::var(env_var)
        .map_err(|_| CoordinatorError::Wallet(format!("{} is not set", env_var)))?;
    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| CoordinatorError::Wallet(format!("Invalid private key in {}: {}", env_var, e)))
}

fn parse_address(value: &str, field: &str) -> CoordinatorResult<Address> {
    value
        .parse()
        .map_err(|e| CoordinatorError::Config(format!("Invalid {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_prefix() {
        // transfer(address,uint256) is the well-known 0xa9059cbb
        let data = encode_call(
            "transfer(address,uint256)",
            &[Token::Address(Address::zero()), Token::Uint(U256::one())],
        );
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data.len(), 4 + 64);
    }

    #[test]
    fn test_collateral_deposit_carries_value() {
        let call = LedgerCall::DepositCollateral {
            session: "borrower-1".to_string(),
            amount: U256::exp10(18),
        };
        let (data, value) = encode_ledger_call(&call);

        assert_eq!(value, U256::exp10(18));
        assert_eq!(&data[..4], &id("depositCollateral(string)"));
        let args = abi::decode(&[ParamType::String], &data[4..]).unwrap();
        assert_eq!(args, vec![Token::String("borrower-1".to_string())]);
    }

    #[test]
    fn test_borrow_encodes_recipient() {
        let recipient: Address = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".parse().unwrap();
        let call = LedgerCall::Borrow {
            session: "borrower-1".to_string(),
            amount: U256::from(100_000_000u64),
            recipient,
        };
        let (data, value) = encode_ledger_call(&call);

        assert!(value.is_zero());
        assert_eq!(&data[..4], &id("takeLoan(uint256,string,address)"));
        let args = abi::decode(
            &[ParamType::Uint(256), ParamType::String, ParamType::Address],
            &data[4..],
        )
        .unwrap();
        assert_eq!(args[2], Token::Address(recipient));
    }

    #[test]
    fn test_decode_loan_info() {
        let encoded = abi::encode(&[
            Token::Uint(U256::from(100_000_000u64)),
            Token::Uint(U256::exp10(18)),
            Token::Uint(U256::from(1_700_000_000u64)),
            Token::Uint(U256::from(1_702_592_000u64)),
            Token::Bool(true),
            Token::Bool(false),
            Token::Uint(U256::from(1_500_000u64)),
        ]);
        let tokens = abi::decode(&LOAN_INFO, &encoded).unwrap();
        let loan = decode_loan_info(tokens).unwrap();

        assert!(loan.active);
        assert!(!loan.liquidated);
        assert_eq!(loan.collateral, U256::exp10(18));
        assert_eq!(loan.start_time, 1_700_000_000);
        assert_eq!(loan.end_time, 1_702_592_000);
        assert_eq!(loan.total_due(), U256::from(101_500_000u64));
    }

    #[test]
    fn test_decode_loan_info_rejects_short_result() {
        assert!(matches!(
            decode_loan_info(vec![Token::Uint(U256::one())]),
            Err(CoordinatorError::Contract(_))
        ));
    }

    #[test]
    fn test_missing_key_is_wallet_error() {
        assert!(matches!(
            load_wallet("MICROLOAN_TEST_KEY_THAT_IS_NOT_SET"),
            Err(CoordinatorError::Wallet(_))
        ));
    }
}
