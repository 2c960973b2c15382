//! Upstream feed boundary.
//!
//! The upstream feed is whatever supplies challenges and targets and
//! accepts solutions: a pool, a contract RPC client, or the synthetic
//! [`dummy`] feed. It talks to the orchestrator in two directions:
//!
//! - **Events** ([`UpstreamEvent`]) flow into the orchestrator over an
//!   `mpsc` channel. Feeds are active tasks that push these whenever their
//!   view of the chain changes.
//! - **Calls** ([`UpstreamFeed`]) are made by the solution pipeline to ask
//!   about the feed and to submit verified solutions.

pub mod dummy;

use async_trait::async_trait;

use crate::types::{
    Address, Challenge, Difficulty, MessagePrefix, MiningMode, ParseError, SolutionTemplate,
    Target,
};

/// Events from the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A challenge was announced, as hex of the 52-byte challenge and
    /// address prefix of the message, with or without `0x`.
    NewChallenge(String),

    /// The target changed, as hex with or without `0x`.
    NewTarget(String),

    /// Outcome of the feed's latest parameter fetch.
    ParameterFetchStatus(bool),

    /// The current challenge is done for this process; stop until the next.
    StopSolvingCurrentChallenge,
}

/// Error types for upstream input.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Invalid target: {0}")]
    InvalidTarget(ParseError),

    #[error("Invalid challenge prefix: {0}")]
    InvalidPrefix(ParseError),
}

/// Parse the challenge and address prefix a feed received as hex.
pub fn parse_message_prefix(hex: &str) -> Result<MessagePrefix, UpstreamError> {
    MessagePrefix::from_hex(hex).map_err(UpstreamError::InvalidPrefix)
}

/// A verified solution, ready to hand to the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionSubmission {
    pub digest: [u8; 32],
    pub address: Address,
    pub challenge: Challenge,
    pub difficulty: Difficulty,
    pub target: Target,
    pub nonce: u64,
    pub mode: MiningMode,

    /// Template with the nonce written into its slot. This is what the
    /// contract receives as "nonce".
    pub solution: [u8; 32],
}

impl SolutionSubmission {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        digest: [u8; 32],
        address: Address,
        challenge: Challenge,
        difficulty: Difficulty,
        target: Target,
        template: &SolutionTemplate,
        mode: MiningMode,
        nonce: u64,
    ) -> Self {
        Self {
            digest,
            address,
            challenge,
            difficulty,
            target,
            nonce,
            mode,
            solution: template.with_nonce(mode, nonce),
        }
    }

    pub fn digest_hex(&self) -> String {
        format!("0x{}", hex::encode(self.digest))
    }

    pub fn address_hex(&self) -> String {
        self.address.to_string()
    }

    pub fn challenge_hex(&self) -> String {
        self.challenge.to_string()
    }

    /// 64 uppercase hex digits, no prefix.
    pub fn difficulty_hex(&self) -> String {
        self.difficulty.to_hex_x64()
    }

    pub fn target_hex(&self) -> String {
        self.target.to_string()
    }

    /// The full 32-byte solution, not only the eight nonce bytes.
    pub fn nonce_hex(&self) -> String {
        format!("0x{}", hex::encode(self.solution))
    }
}

/// Calls into the upstream feed.
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Pools accept many solutions per challenge; direct contract feeds
    /// accept one.
    fn is_pool(&self) -> bool;

    /// Difficulty reported alongside submissions.
    fn difficulty(&self) -> Difficulty;

    /// Whether this process already submitted a solution for `challenge`.
    fn is_challenge_submitted(&self, challenge: &Challenge) -> bool;

    /// Submit a solution. `Ok(false)` means the feed rejected it.
    async fn submit_solution(&self, submission: &SolutionSubmission) -> anyhow::Result<bool>;
}
