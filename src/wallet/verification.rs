//! Proof of wallet ownership.
//!
//! A contributor asks for a challenge naming their GitHub user id and the
//! address they want paid at, signs the challenge message with that wallet
//! (EIP-191 `personal_sign`) and presents the signature to register.
//!
//! SECURITY:
//! - Challenges are single use; presenting one consumes it even when the
//!   signature is wrong
//! - Replacing a registered address also needs a signature over the same
//!   message from the address being replaced, or an operator override

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, Signature};
use tracing::{info, warn};

use crate::error::{AppError, AppResult, WalletError};
use crate::ledger::models::{ContributorWallet, WalletChallenge};
use crate::ledger::store::RewardStore;

const NONCE_LEN: usize = 32;

/// Signed registration presented by a contributor
#[derive(Debug, Clone)]
pub struct WalletProof {
    pub github_user_id: i64,
    pub address: String,
    pub nonce: String,
    /// Signature of the challenge message by `address`
    pub signature: String,
    /// Signature of the same message by the currently registered address
    pub current_wallet_signature: Option<String>,
}

pub struct WalletVerificationService {
    store: Arc<dyn RewardStore>,
    challenge_ttl: Duration,
}

impl WalletVerificationService {
    pub fn new(store: Arc<dyn RewardStore>, challenge_ttl: Duration) -> Self {
        Self {
            store,
            challenge_ttl,
        }
    }

    pub fn challenge_ttl(&self) -> Duration {
        self.challenge_ttl
    }

    /// Random nonce for wallet verification (32 characters)
    pub fn generate_nonce() -> String {
        use rand::Rng;
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::rng();

        (0..NONCE_LEN)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect()
    }

    /// Text the wallet signs. Names the user and the address so a signature
    /// cannot be replayed for another registration.
    pub fn verification_message(challenge: &WalletChallenge) -> String {
        format!(
            "Link this wallet to GitHub user {} for contributor rewards\n\nAddress: {}\nNonce: {}\n\nThis action will not cost any gas or fees.",
            challenge.github_user_id,
            challenge.address.to_ascii_lowercase(),
            challenge.nonce
        )
    }

    /// Check an EIP-191 `personal_sign` signature (65 bytes, hex) of `message`
    /// against `address`.
    pub fn verify_evm_signature(message: &str, signature: &str, address: &str) -> AppResult<bool> {
        let sig_bytes = hex::decode(signature.trim_start_matches("0x"))
            .map_err(|_| AppError::InvalidInput("signature must be hex".to_string()))?;
        let signature = Signature::try_from(sig_bytes.as_slice()).map_err(|e| {
            AppError::InvalidInput(format!("signature must be 65 bytes: {}", e))
        })?;
        let address: Address = address
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("invalid address {}", address)))?;

        match signature.verify(message, address) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("✗ Wallet signature verification failed for {:?}: {}", address, e);
                Ok(false)
            }
        }
    }

    pub async fn issue_challenge(
        &self,
        github_user_id: i64,
        address: &str,
        now: DateTime<Utc>,
    ) -> AppResult<WalletChallenge> {
        let challenge = WalletChallenge {
            nonce: Self::generate_nonce(),
            github_user_id,
            address: address.to_string(),
            created_at: now,
            expires_at: now + self.challenge_ttl,
        };
        self.store.save_wallet_challenge(challenge.clone()).await?;

        info!("🔑 Issued wallet challenge for GitHub user {}", github_user_id);
        Ok(challenge)
    }

    /// Verify a signed challenge and store the address.
    ///
    /// `operator_override` waives the current-wallet signature, for
    /// contributors who lost the key of their registered address.
    pub async fn register(
        &self,
        proof: WalletProof,
        operator_override: bool,
        now: DateTime<Utc>,
    ) -> AppResult<ContributorWallet> {
        let challenge = self
            .store
            .take_wallet_challenge(&proof.nonce)
            .await?
            .ok_or(WalletError::ChallengeNotFound)?;

        if challenge.github_user_id != proof.github_user_id
            || !challenge.address.eq_ignore_ascii_case(&proof.address)
        {
            return Err(WalletError::ChallengeMismatch.into());
        }
        if challenge.expires_at <= now {
            return Err(WalletError::ChallengeExpired.into());
        }

        let message = Self::verification_message(&challenge);
        if !Self::verify_evm_signature(&message, &proof.signature, &proof.address)? {
            return Err(WalletError::SignatureVerificationFailed.into());
        }

        let replaced = self
            .store
            .wallet_for(proof.github_user_id)
            .await?
            .filter(|current| !current.address.eq_ignore_ascii_case(&proof.address));
        if let Some(current) = replaced {
            let approved = match proof.current_wallet_signature.as_deref() {
                Some(signature) => Self::verify_evm_signature(&message, signature, &current.address)?,
                None => false,
            };
            if operator_override && !approved {
                warn!(
                    "⚠️ Operator override: wallet of GitHub user {} replaced without proof from {}",
                    proof.github_user_id, current.address
                );
            } else if !approved {
                warn!(
                    "⚠️ Refused to replace wallet of GitHub user {} without proof from {}",
                    proof.github_user_id, current.address
                );
                return Err(WalletError::CurrentWalletProofRequired {
                    current: current.address,
                }
                .into());
            }
        }

        let wallet = self
            .store
            .upsert_wallet(proof.github_user_id, &proof.address, now)
            .await?;
        info!(
            "✓ Wallet {} verified for GitHub user {}",
            wallet.address, wallet.github_user_id
        );
        Ok(wallet)
    }
}
