//! Reward commands in pull request comments.

pub mod parser;
pub mod types;

pub use parser::{parse_command, CommentParser};
pub use types::{CommentContext, ParseOutcome, RejectReason, RewardCommand, RewardInstruction};
