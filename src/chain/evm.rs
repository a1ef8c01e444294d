//! EVM reward vault and relay fee estimator over ethers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::{
    contract::{abigen, ContractError},
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, H256, U256},
    middleware::SignerMiddleware,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use super::{classify_chain_message, FeeEstimator, RelayFee, RewardLedger, TransferRequest, TxConfirmation};
use crate::error::ChainError;
use crate::ledger::models::{Chain, Currency};

abigen!(
    RewardVault,
    r#"[
        function payReward(bytes32 voucherId, string currency, address recipient, uint256 amount, uint16 dstChainId) external payable
        function estimateRelayFee(uint16 dstChainId, uint256 gasLimit) external view returns (uint256)
    ]"#,
);

pub type VaultClient = SignerMiddleware<Provider<Http>, LocalWallet>;

#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub vault_address: String,
    pub private_key: String,
    pub source_chain: Chain,
    pub poll_interval: Duration,
}

/// Vault contract bound to the treasury signer.
pub struct EvmRewardLedger {
    contract: RewardVault<VaultClient>,
    client: Arc<VaultClient>,
    source_chain: Chain,
}

impl EvmRewardLedger {
    pub fn connect(config: &EvmConfig) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())?
            .interval(config.poll_interval);
        let wallet: LocalWallet = config.private_key.trim_start_matches("0x").parse()?;
        let wallet = wallet.with_chain_id(config.source_chain.evm_chain_id());
        let treasury = wallet.address();

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let address: Address = config.vault_address.parse()?;
        let contract = RewardVault::new(address, client.clone());

        info!(
            "✅ Reward vault {:?} on {} connected with treasury {:?}",
            address, config.source_chain, treasury
        );

        Ok(Self {
            contract,
            client,
            source_chain: config.source_chain,
        })
    }

    /// Fee estimator that reads quotes from the same vault
    pub fn fee_estimator(&self) -> EvmFeeEstimator {
        EvmFeeEstimator {
            contract: self.contract.clone(),
        }
    }
}

#[async_trait]
impl RewardLedger for EvmRewardLedger {
    fn source_chain(&self) -> Chain {
        self.source_chain
    }

    #[instrument(skip(self, request), fields(currency = %request.currency, amount = %request.amount))]
    async fn transfer(&self, request: &TransferRequest) -> Result<String, ChainError> {
        let recipient = parse_recipient(&request.recipient)?;
        let amount = to_base_units(request.amount, request.currency)?;

        let call = self
            .contract
            .pay_reward(
                request.voucher_id,
                request.currency.code().to_string(),
                recipient,
                amount,
                request.destination_chain.bridge_id(),
            )
            .value(U256::from(request.relay_fee.0));

        let pending = call.send().await.map_err(classify_contract_error)?;
        let tx_hash = format!("{:?}", pending.tx_hash());

        debug!("Vault call broadcast: {}", tx_hash);
        Ok(tx_hash)
    }

    async fn confirmations(&self, tx_hash: &str) -> Result<TxConfirmation, ChainError> {
        let hash: H256 = tx_hash
            .parse()
            .map_err(|_| ChainError::Rpc(format!("invalid transaction hash {}", tx_hash)))?;

        let receipt = self
            .client
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| classify_chain_message(&e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(TxConfirmation::Pending);
        };
        if receipt.status.is_some_and(|status| status.is_zero()) {
            return Ok(TxConfirmation::Reverted(format!(
                "transaction {} reverted",
                tx_hash
            )));
        }
        let Some(mined_at) = receipt.block_number else {
            return Ok(TxConfirmation::Pending);
        };

        let head = self
            .client
            .get_block_number()
            .await
            .map_err(|e| classify_chain_message(&e.to_string()))?;

        let confirmations = head.as_u64().saturating_sub(mined_at.as_u64()) + 1;
        Ok(TxConfirmation::Mined { confirmations })
    }
}

/// Reads relay quotes from the vault's bridge endpoint
pub struct EvmFeeEstimator {
    contract: RewardVault<VaultClient>,
}

#[async_trait]
impl FeeEstimator for EvmFeeEstimator {
    async fn estimate_fee(
        &self,
        source: Chain,
        destination: Chain,
        gas_limit: u64,
    ) -> Result<RelayFee, ChainError> {
        if source == destination {
            return Ok(RelayFee::ZERO);
        }

        let fee = self
            .contract
            .estimate_relay_fee(destination.bridge_id(), U256::from(gas_limit))
            .call()
            .await
            .map_err(classify_contract_error)?;

        let wei = u128::try_from(fee)
            .map_err(|_| ChainError::Rpc(format!("relay fee {} out of range", fee)))?;
        Ok(RelayFee(wei))
    }
}

fn classify_contract_error(error: ContractError<VaultClient>) -> ChainError {
    if let Some(reason) = error.decode_revert::<String>() {
        return match classify_chain_message(&reason) {
            ChainError::Rpc(_) | ChainError::Timeout => ChainError::Reverted(reason),
            classified => classified,
        };
    }
    classify_chain_message(&error.to_string())
}

fn parse_recipient(recipient: &str) -> Result<Address, ChainError> {
    let address: Address = recipient
        .parse()
        .map_err(|_| ChainError::InvalidDestination(recipient.to_string()))?;
    if address.is_zero() {
        return Err(ChainError::InvalidDestination(recipient.to_string()));
    }
    Ok(address)
}

/// Whole token amount to base units using the currency decimals
pub fn to_base_units(amount: Decimal, currency: Currency) -> Result<U256, ChainError> {
    let scale = Decimal::from(10u64.pow(currency.decimals()));
    let base = amount
        .checked_mul(scale)
        .filter(|base| base.fract().is_zero() && base.is_sign_positive())
        .and_then(|base| base.to_u128())
        .ok_or_else(|| ChainError::InvalidAmount(format!("{} {}", amount, currency)))?;
    Ok(U256::from(base))
}
