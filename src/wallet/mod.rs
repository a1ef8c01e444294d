//! Contributor payout addresses.

pub mod verification;

pub use verification::{WalletProof, WalletVerificationService};
