//! Solution verification and submission.
//!
//! Workers hand candidate nonces to a bounded queue. A single task drains
//! the queue, so submissions are totally ordered across all devices and at
//! most one is in flight at a time. Every candidate is re-hashed here with
//! `sha3` before it may reach the upstream feed; a backend's own target
//! check is never trusted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha3::{Digest, Keccak256};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::device::snapshot::{ChallengeSnapshot, Subscription};
use crate::tracing::prelude::*;
use crate::types::{Challenge, Message};
use crate::upstream::{SolutionSubmission, UpstreamEvent, UpstreamFeed};

/// Queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Submit solutions for a challenge that is no longer live.
    pub submit_stale: bool,

    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            submit_stale: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// A nonce a backend reported, with the parameters it was hashed under.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub nonce: u64,
    pub device: String,
    pub snapshot: Arc<ChallengeSnapshot>,
}

impl Candidate {
    pub fn challenge(&self) -> &Challenge {
        &self.snapshot.challenge
    }
}

/// Error types for the pipeline queue.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Solution queue closed")]
    QueueClosed,
}

/// Sending side of the candidate queue.
#[derive(Debug, Clone)]
pub struct CandidateSender {
    tx: mpsc::Sender<Candidate>,
}

/// Bounded candidate queue.
pub(crate) fn candidate_queue(capacity: usize) -> (CandidateSender, mpsc::Receiver<Candidate>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CandidateSender { tx }, rx)
}

impl CandidateSender {
    /// Queue a candidate from a worker thread, waiting for space.
    ///
    /// Must not be called from inside the async runtime.
    pub fn blocking_submit(&self, candidate: Candidate) -> Result<(), PipelineError> {
        self.tx
            .blocking_send(candidate)
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Queue a candidate from async code.
    pub async fn submit(&self, candidate: Candidate) -> Result<(), PipelineError> {
        self.tx
            .send(candidate)
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nonce 0 marks an unused candidate slot.
    EmptySlot,

    /// No challenge or target published yet.
    NotReady,

    /// This process already solved the challenge.
    AlreadySubmitted,

    Stale,
    VerificationFailed,
    Accepted,
    Rejected,
    SubmitFailed,
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    verified: AtomicU64,
    submitted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
    verification_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounts {
    /// Candidates re-hashed on the trusted path.
    pub verified: u64,
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub verification_failures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineCounts {
        PipelineCounts {
            verified: self.verified.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Verifies candidates and submits them upstream.
pub struct SolutionPipeline {
    config: PipelineConfig,
    feed: Arc<dyn UpstreamFeed>,
    params: Subscription,
    control_tx: mpsc::Sender<UpstreamEvent>,
    stats: Arc<PipelineStats>,
}

impl SolutionPipeline {
    /// Create a pipeline.
    ///
    /// `params` gives the live challenge and target. `control_tx` feeds back
    /// into the orchestrator's event queue.
    pub fn new(
        config: PipelineConfig,
        feed: Arc<dyn UpstreamFeed>,
        params: Subscription,
        control_tx: mpsc::Sender<UpstreamEvent>,
    ) -> Self {
        Self {
            config,
            feed,
            params,
            control_tx,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Start the submission task and return the queue's sending side.
    ///
    /// The task exits on shutdown or once every sender is dropped.
    pub fn spawn(self, tracker: &TaskTracker, shutdown: CancellationToken) -> CandidateSender {
        let (sender, mut rx) = candidate_queue(self.config.queue_capacity);

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    candidate = rx.recv() => {
                        let Some(candidate) = candidate else { break };
                        self.process(&candidate).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Solution pipeline stopped");
        });

        sender
    }

    /// Verify one candidate and submit it if it holds up.
    pub async fn process(&self, candidate: &Candidate) -> Outcome {
        if candidate.nonce == 0 {
            return Outcome::EmptySlot;
        }

        let (Some(live), Some(target)) = (self.params.latest_challenge(), self.params.latest_target())
        else {
            warn!(device = %candidate.device, "Candidate before parameters were published");
            return Outcome::NotReady;
        };
        let challenge = *candidate.challenge();

        // Only the live challenge can stop solving; older candidates are
        // just stale.
        if !self.feed.is_pool() && self.feed.is_challenge_submitted(&live.challenge) {
            debug!(
                device = %candidate.device,
                challenge = %live.challenge,
                "Challenge already solved, discarding candidate"
            );
            if self
                .control_tx
                .send(UpstreamEvent::StopSolvingCurrentChallenge)
                .await
                .is_err()
            {
                debug!("Orchestrator gone, cannot stop solving");
            }
            return Outcome::AlreadySubmitted;
        }

        if live.challenge != challenge {
            PipelineStats::bump(&self.stats.stale);
            if !self.config.submit_stale {
                warn!(
                    device = %candidate.device,
                    nonce = format!("{:#018x}", candidate.nonce),
                    "Found stale solution, discarding"
                );
                return Outcome::Stale;
            }
            warn!(
                device = %candidate.device,
                nonce = format!("{:#018x}", candidate.nonce),
                "Found stale solution, submitting anyway"
            );
        }

        let snapshot = &candidate.snapshot;
        let message = Message::with_nonce(
            &snapshot.challenge,
            &snapshot.address,
            &snapshot.template,
            snapshot.mode,
            candidate.nonce,
        );
        let digest: [u8; 32] = Keccak256::digest(message.as_bytes()).into();
        PipelineStats::bump(&self.stats.verified);

        if !target.target.is_met_by(&digest) {
            PipelineStats::bump(&self.stats.verification_failures);
            error!(
                device = %candidate.device,
                nonce = format!("{:#018x}", candidate.nonce),
                digest = %hex::encode(digest),
                target = %target.target,
                "CPU verification failed: backend reported a digest above target"
            );
            return Outcome::VerificationFailed;
        }

        info!(
            device = %candidate.device,
            nonce = format!("{:#018x}", candidate.nonce),
            "Solution found"
        );

        let submission = SolutionSubmission::new(
            digest,
            snapshot.address,
            snapshot.challenge,
            self.feed.difficulty(),
            target.target,
            &snapshot.template,
            snapshot.mode,
            candidate.nonce,
        );
        debug!(
            digest = %submission.digest_hex(),
            address = %submission.address_hex(),
            challenge = %submission.challenge_hex(),
            difficulty = %submission.difficulty_hex(),
            target = %submission.target_hex(),
            nonce = %submission.nonce_hex(),
            "Submitting solution"
        );

        PipelineStats::bump(&self.stats.submitted);
        match self.feed.submit_solution(&submission).await {
            Ok(true) => {
                PipelineStats::bump(&self.stats.accepted);
                info!(feed = self.feed.name(), "Solution accepted");
                Outcome::Accepted
            }
            Ok(false) => {
                PipelineStats::bump(&self.stats.rejected);
                warn!(feed = self.feed.name(), "Solution rejected");
                Outcome::Rejected
            }
            Err(e) => {
                error!(feed = self.feed.name(), error = %e, "Failed to submit solution");
                Outcome::SubmitFailed
            }
        }
    }
}
