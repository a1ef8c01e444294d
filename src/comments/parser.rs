//! Reward command parser.
//!
//! Grammar, one command per line:
//!
//! ```text
//! <marker> <positive-decimal-amount> [<currency-code>]
//! ```
//!
//! - The marker (default `/reward`) must lead the line, after indentation,
//!   and is matched case-insensitively
//! - Lines inside fenced code blocks are skipped
//! - Nothing may follow the currency code
//! - The first line that satisfies the grammar wins

use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{debug, info};

use super::types::*;
use crate::error::AppResult;
use crate::ledger::models::{Chain, Currency};
use crate::ledger::store::RewardStore;

/// Reads the first reward command in `text`.
///
/// Returns the rejection of the first marker line when no line is valid,
/// and `NoMarker` when no line carries the marker at all. Never panics.
pub fn parse_command(
    text: &str,
    marker: &str,
    default_currency: Currency,
) -> Result<RewardCommand, RejectReason> {
    let mut first_rejection = None;
    let mut in_fence = false;

    for line in text.lines() {
        let line = line.trim_start();

        if line.starts_with("```") || line.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let Some(rest) = strip_marker(line, marker) else {
            continue;
        };

        match parse_arguments(rest, default_currency) {
            Ok(command) => return Ok(command),
            Err(reason) => {
                first_rejection.get_or_insert(reason);
            }
        }
    }

    Err(first_rejection.unwrap_or(RejectReason::NoMarker))
}

/// Text after the marker if the line starts with it at a word boundary.
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let candidate = line.get(..marker.len())?;
    if !candidate.eq_ignore_ascii_case(marker) {
        return None;
    }

    let rest = &line[marker.len()..];
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest),
        // "/rewards" is not "/reward"
        Some(_) => None,
    }
}

/// Whole digits a stored amount may carry; `reward_jobs.amount` is NUMERIC(38, 18)
const MAX_WHOLE_DIGITS: usize = 20;

fn parse_arguments(rest: &str, default_currency: Currency) -> Result<RewardCommand, RejectReason> {
    let mut tokens = rest.split_whitespace();
    let malformed = || RejectReason::Malformed(rest.trim().to_string());

    let amount_token = tokens.next().ok_or_else(malformed)?;
    let currency_token = tokens.next();
    if tokens.next().is_some() {
        return Err(malformed());
    }

    let literal = AmountLiteral::lex(amount_token).ok_or_else(malformed)?;
    if !literal.is_positive() {
        return Err(RejectReason::NonPositiveAmount);
    }

    let currency = match currency_token {
        Some(code) => Currency::from_code(code)
            .ok_or_else(|| RejectReason::UnknownCurrency(code.to_string()))?,
        None => default_currency,
    };

    // Digits are counted on the text; Decimal rounds past its own precision
    let max_decimals = currency.decimals();
    if literal.fraction_digits() > max_decimals as usize {
        return Err(RejectReason::ExcessPrecision {
            currency,
            max_decimals,
        });
    }
    if literal.whole_digits() > MAX_WHOLE_DIGITS {
        return Err(RejectReason::AmountTooLarge {
            max_whole_digits: MAX_WHOLE_DIGITS,
        });
    }

    let amount = Decimal::from_str(&literal.canonical()).map_err(|_| malformed())?;
    if amount.normalize().scale() as usize != literal.fraction_digits() {
        return Err(malformed());
    }

    Ok(RewardCommand { amount, currency })
}

/// Plain decimal: optional sign, digits, optional fraction. No exponents,
/// separators or currency symbols.
struct AmountLiteral<'a> {
    negative: bool,
    whole: &'a str,
    fraction: &'a str,
}

impl<'a> AmountLiteral<'a> {
    fn lex(token: &'a str) -> Option<Self> {
        let (negative, unsigned) = match token.strip_prefix('-') {
            Some(unsigned) => (true, unsigned),
            None => (false, token),
        };
        let (whole, fraction) = match unsigned.split_once('.') {
            Some((whole, fraction)) => (whole, Some(fraction)),
            None => (unsigned, None),
        };

        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !digits(whole) || !fraction.map_or(true, digits) {
            return None;
        }

        Some(Self {
            negative,
            whole,
            fraction: fraction.unwrap_or(""),
        })
    }

    fn is_positive(&self) -> bool {
        let nonzero = |s: &str| s.bytes().any(|b| b != b'0');
        !self.negative && (nonzero(self.whole) || nonzero(self.fraction))
    }

    /// Significant fraction digits; trailing zeros do not count
    fn fraction_digits(&self) -> usize {
        self.fraction.trim_end_matches('0').len()
    }

    /// Significant whole digits; leading zeros do not count
    fn whole_digits(&self) -> usize {
        self.whole.trim_start_matches('0').len()
    }

    /// Unsigned text without padding zeros
    fn canonical(&self) -> String {
        let whole = match self.whole.trim_start_matches('0') {
            "" => "0",
            whole => whole,
        };
        match self.fraction.trim_end_matches('0') {
            "" => whole.to_string(),
            fraction => format!("{}.{}", whole, fraction),
        }
    }
}

/// Grammar plus the maintainer check. Turns a comment into a reward
/// instruction or a typed rejection.
#[derive(Debug, Clone)]
pub struct CommentParser {
    marker: String,
    default_currency: Currency,
    destination_chain: Chain,
}

impl CommentParser {
    pub fn new(marker: impl Into<String>, default_currency: Currency, destination_chain: Chain) -> Self {
        Self {
            marker: marker.into(),
            default_currency,
            destination_chain,
        }
    }

    /// Store failures propagate; everything about the comment itself is an outcome.
    pub async fn evaluate(
        &self,
        store: &dyn RewardStore,
        ctx: &CommentContext,
        body: &str,
    ) -> AppResult<ParseOutcome> {
        let command = match parse_command(body, &self.marker, self.default_currency) {
            Ok(command) => command,
            Err(RejectReason::NoMarker) => {
                debug!("Comment {} carries no reward command", ctx.comment_id);
                return Ok(ParseOutcome::NoInstruction(RejectReason::NoMarker));
            }
            Err(reason) => return Ok(self.reject(ctx, reason)),
        };

        let repository = match store.find_repository(ctx.github_repo_id).await? {
            Some(repo) if repo.is_active => repo,
            Some(_) => return Ok(self.reject(ctx, RejectReason::RepositoryInactive)),
            None => return Ok(self.reject(ctx, RejectReason::RepositoryUnknown)),
        };

        // SECURITY: only recorded maintainers may issue rewards
        if !store
            .is_maintainer(repository.id, ctx.commentor_github_id)
            .await?
        {
            return Ok(self.reject(ctx, RejectReason::UnauthorizedCommentor));
        }

        Ok(ParseOutcome::Instruction(RewardInstruction {
            repository_id: repository.id,
            pr_number: ctx.pr_number,
            comment_id: ctx.comment_id,
            commentor_github_id: ctx.commentor_github_id,
            contributor_github_id: ctx.contributor_github_id,
            amount: command.amount,
            currency: command.currency,
            chain: self.destination_chain,
        }))
    }

    fn reject(&self, ctx: &CommentContext, reason: RejectReason) -> ParseOutcome {
        info!(
            "Reward command in comment {} on PR #{} rejected: {}",
            ctx.comment_id, ctx.pr_number, reason
        );
        ParseOutcome::NoInstruction(reason)
    }
}
