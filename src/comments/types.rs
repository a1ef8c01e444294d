use rust_decimal::Decimal;
use std::fmt;
use uuid::Uuid;

use crate::ledger::models::{Chain, Currency};

/// Metadata of the comment being evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentContext {
    pub github_repo_id: i64,
    pub pr_number: i64,
    pub comment_id: i64,
    pub commentor_github_id: i64,
    /// Author of the pull request
    pub contributor_github_id: i64,
}

/// Amount and currency read from a comment, before authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardCommand {
    pub amount: Decimal,
    pub currency: Currency,
}

/// A well-formed, authorized reward instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardInstruction {
    pub repository_id: Uuid,
    pub pr_number: i64,
    pub comment_id: i64,
    pub commentor_github_id: i64,
    pub contributor_github_id: i64,
    pub amount: Decimal,
    pub currency: Currency,
    pub chain: Chain,
}

/// Why a comment produced no instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NoMarker,
    Malformed(String),
    NonPositiveAmount,
    ExcessPrecision { currency: Currency, max_decimals: u32 },
    /// Past what the job ledger column can store
    AmountTooLarge { max_whole_digits: usize },
    UnknownCurrency(String),
    RepositoryUnknown,
    RepositoryInactive,
    UnauthorizedCommentor,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoMarker => write!(f, "no reward command"),
            RejectReason::Malformed(line) => write!(f, "malformed reward command: {:?}", line),
            RejectReason::NonPositiveAmount => write!(f, "amount must be positive"),
            RejectReason::ExcessPrecision {
                currency,
                max_decimals,
            } => write!(f, "{} supports at most {} decimals", currency, max_decimals),
            RejectReason::AmountTooLarge { max_whole_digits } => {
                write!(f, "amount exceeds {} whole digits", max_whole_digits)
            }
            RejectReason::UnknownCurrency(code) => write!(f, "unknown currency {:?}", code),
            RejectReason::RepositoryUnknown => write!(f, "repository is not installed"),
            RejectReason::RepositoryInactive => write!(f, "repository is inactive"),
            RejectReason::UnauthorizedCommentor => write!(f, "commentor is not a maintainer"),
        }
    }
}

/// Result of evaluating a comment. Never an error for irrelevant text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Instruction(RewardInstruction),
    NoInstruction(RejectReason),
}
