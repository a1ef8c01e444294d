//! Chain boundary: the reward ledger contract and the relay fee estimator.

pub mod evm;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ChainError;
use crate::ledger::models::{Chain, Currency};

/// Native-currency fee for relaying a transfer message between chains, in wei
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct RelayFee(pub u128);

impl RelayFee {
    pub const ZERO: RelayFee = RelayFee(0);

    /// Pad by `bps` basis points
    pub fn with_buffer(self, bps: u32) -> RelayFee {
        RelayFee(self.0.saturating_add(self.0.saturating_mul(bps as u128) / 10_000))
    }
}

/// On-chain idempotency token: sha256("reward-job:" || job id).
///
/// The vault rejects a second payout with the same voucher, so a job
/// redelivered by the queue can never be paid twice.
pub fn voucher_id(job_id: Uuid) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"reward-job:");
    hasher.update(job_id.to_string().as_bytes());
    hasher.finalize().into()
}

/// A single payout call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub voucher_id: [u8; 32],
    pub recipient: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub destination_chain: Chain,
    /// Sent as the call value; a stale estimate fails the call
    pub relay_fee: RelayFee,
}

/// State of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxConfirmation {
    /// Not mined yet
    Pending,
    Mined { confirmations: u64 },
    Reverted(String),
}

/// Reward vault contract
#[async_trait]
pub trait RewardLedger: Send + Sync {
    /// Chain the vault lives on
    fn source_chain(&self) -> Chain;

    /// Submit the payout and return its transaction hash
    async fn transfer(&self, request: &TransferRequest) -> Result<String, ChainError>;

    async fn confirmations(&self, tx_hash: &str) -> Result<TxConfirmation, ChainError>;
}

/// Bridging protocol fee quotes
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn estimate_fee(
        &self,
        source: Chain,
        destination: Chain,
        gas_limit: u64,
    ) -> Result<RelayFee, ChainError>;
}

/// Classify a provider or revert message.
///
/// Providers only give us free text, so this matches on the messages geth,
/// erigon and the vault's require strings produce.
pub fn classify_chain_message(message: &str) -> ChainError {
    let lower = message.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("already paid") || has("voucher used") {
        ChainError::AlreadySettled
    } else if has("relay fee") {
        ChainError::InsufficientRelayFee(message.to_string())
    } else if has("insufficient balance")
        || has("exceeds balance")
        || has("insufficient funds")
    {
        ChainError::InsufficientFunds(message.to_string())
    } else if has("invalid recipient") || has("zero address") {
        ChainError::InvalidDestination(message.to_string())
    } else if has("nonce too low") || has("nonce too high") || has("already known") {
        ChainError::NonceContention(message.to_string())
    } else if has("underpriced") || has("fee cap") || has("max fee per gas less than") {
        ChainError::Underpriced(message.to_string())
    } else if has("revert") {
        ChainError::Reverted(message.to_string())
    } else if has("timed out") || has("timeout") {
        ChainError::Timeout
    } else {
        ChainError::Rpc(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voucher_id_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(voucher_id(id), voucher_id(id));
        assert_ne!(voucher_id(id), voucher_id(Uuid::new_v4()));
    }

    #[test]
    fn test_fee_buffer() {
        assert_eq!(RelayFee(10_000).with_buffer(0), RelayFee(10_000));
        assert_eq!(RelayFee(10_000).with_buffer(250), RelayFee(10_250));
        assert_eq!(RelayFee(u128::MAX).with_buffer(100), RelayFee(u128::MAX));
    }

    #[test]
    fn test_classify_chain_message() {
        assert_eq!(
            classify_chain_message("execution reverted: RewardVault: voucher already paid"),
            ChainError::AlreadySettled
        );
        assert!(matches!(
            classify_chain_message("execution reverted: RewardVault: insufficient relay fee"),
            ChainError::InsufficientRelayFee(_)
        ));
        assert!(matches!(
            classify_chain_message("execution reverted: ERC20: transfer amount exceeds balance"),
            ChainError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_chain_message("nonce too low"),
            ChainError::NonceContention(_)
        ));
        assert!(matches!(
            classify_chain_message("replacement transaction underpriced"),
            ChainError::Underpriced(_)
        ));
        assert!(matches!(
            classify_chain_message("execution reverted: paused"),
            ChainError::Reverted(_)
        ));
        assert!(matches!(
            classify_chain_message("connection reset by peer"),
            ChainError::Rpc(_)
        ));
    }
}
