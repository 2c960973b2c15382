//! Synthetic upstream feed for testing and development.
//!
//! Announces a random challenge on a fixed interval with a target derived
//! from a configured difficulty. It behaves like a direct contract feed:
//! one solution per challenge, so after a submission the pipeline asks the
//! orchestrator to stop until the next announcement.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{SolutionSubmission, UpstreamEvent, UpstreamFeed};
use crate::tracing::prelude::*;
use crate::types::{Address, Challenge, Difficulty, MessagePrefix, Target};

/// Dummy feed settings.
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Address announced with every challenge.
    pub address: Address,

    /// How often to announce a new challenge.
    pub interval: Duration,

    pub difficulty: Difficulty,
}

/// Feed that makes up its own challenges.
pub struct DummyFeed {
    config: DummyConfig,
    target: Target,
    current: Mutex<Option<Challenge>>,
    submitted: Mutex<HashSet<Challenge>>,
    accepted: AtomicU64,
}

impl DummyFeed {
    pub fn new(config: DummyConfig) -> Self {
        let target = Target::from_difficulty(config.difficulty);
        Self {
            config,
            target,
            current: Mutex::new(None),
            submitted: Mutex::new(HashSet::new()),
            accepted: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Solutions accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    fn next_challenge(&self) -> Challenge {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = Challenge(bytes);
        if let Ok(mut current) = self.current.lock() {
            *current = Some(challenge);
        }
        challenge
    }

    /// Run the feed (active loop).
    ///
    /// Sends the target and a first challenge immediately, then a fresh
    /// challenge every interval. Runs until the shutdown token is cancelled
    /// or the orchestrator goes away.
    pub async fn run(
        &self,
        event_tx: mpsc::Sender<UpstreamEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            difficulty = %self.config.difficulty,
            interval = ?self.config.interval,
            "Dummy feed starting"
        );

        event_tx
            .send(UpstreamEvent::NewTarget(self.target.to_string()))
            .await?;

        loop {
            let challenge = self.next_challenge();
            debug!(challenge = %challenge, "Announcing challenge");

            event_tx.send(UpstreamEvent::ParameterFetchStatus(true)).await?;
            event_tx
                .send(UpstreamEvent::NewChallenge(
                    MessagePrefix {
                        challenge,
                        address: self.config.address,
                    }
                    .to_string(),
                ))
                .await?;

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Dummy feed shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl UpstreamFeed for DummyFeed {
    fn name(&self) -> &str {
        "dummy"
    }

    fn is_pool(&self) -> bool {
        false
    }

    fn difficulty(&self) -> Difficulty {
        self.config.difficulty
    }

    fn is_challenge_submitted(&self, challenge: &Challenge) -> bool {
        self.submitted
            .lock()
            .map(|submitted| submitted.contains(challenge))
            .unwrap_or(false)
    }

    async fn submit_solution(&self, submission: &SolutionSubmission) -> Result<bool> {
        let current = *self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("dummy feed state poisoned"))?;

        if current != Some(submission.challenge) {
            debug!(challenge = %submission.challenge, "Dummy feed rejecting stale solution");
            return Ok(false);
        }

        self.submitted
            .lock()
            .map_err(|_| anyhow::anyhow!("dummy feed state poisoned"))?
            .insert(submission.challenge);
        self.accepted.fetch_add(1, Ordering::Relaxed);

        info!(
            challenge = %submission.challenge_hex(),
            nonce = %submission.nonce_hex(),
            digest = %submission.digest_hex(),
            "Dummy feed accepted solution"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MiningMode, SolutionTemplate};
    use std::sync::Arc;

    fn config() -> DummyConfig {
        DummyConfig {
            address: Address([0x11; 20]),
            interval: Duration::from_secs(60),
            difficulty: Difficulty::new(1_000),
        }
    }

    fn submission_for(challenge: Challenge) -> SolutionSubmission {
        SolutionSubmission::new(
            [0; 32],
            Address([0x11; 20]),
            challenge,
            Difficulty::new(1_000),
            Target::MAX,
            &SolutionTemplate::default(),
            MiningMode::Normal,
            1,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_dummy_feed_announces_target_then_challenges() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();
        let feed = Arc::new(DummyFeed::new(config()));

        let handle = tokio::spawn({
            let feed = Arc::clone(&feed);
            let shutdown = shutdown.clone();
            async move { feed.run(event_tx, shutdown).await }
        });

        let expected_target = Target::from_difficulty(Difficulty::new(1_000));
        assert_eq!(
            event_rx.recv().await,
            Some(UpstreamEvent::NewTarget(expected_target.to_string()))
        );
        assert_eq!(
            event_rx.recv().await,
            Some(UpstreamEvent::ParameterFetchStatus(true))
        );
        let first = match event_rx.recv().await {
            Some(UpstreamEvent::NewChallenge(hex)) => {
                let prefix = MessagePrefix::from_hex(&hex).unwrap();
                assert_eq!(prefix.address, Address([0x11; 20]));
                prefix.challenge
            }
            other => panic!("Expected NewChallenge, got {:?}", other),
        };

        // The next announcement arrives after the interval.
        assert_eq!(
            event_rx.recv().await,
            Some(UpstreamEvent::ParameterFetchStatus(true))
        );
        match event_rx.recv().await {
            Some(UpstreamEvent::NewChallenge(hex)) => {
                assert_ne!(MessagePrefix::from_hex(&hex).unwrap().challenge, first)
            }
            other => panic!("Expected NewChallenge, got {:?}", other),
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accepts_one_solution_per_current_challenge() {
        let feed = DummyFeed::new(config());
        let challenge = feed.next_challenge();

        assert!(!feed.is_challenge_submitted(&challenge));
        assert!(feed.submit_solution(&submission_for(challenge)).await.unwrap());
        assert!(feed.is_challenge_submitted(&challenge));
        assert_eq!(feed.accepted(), 1);

        let stale = Challenge([0xee; 32]);
        assert!(!feed.submit_solution(&submission_for(stale)).await.unwrap());
        assert_eq!(feed.accepted(), 1);
    }

    #[test]
    fn test_target_from_difficulty() {
        let feed = DummyFeed::new(config());
        assert_eq!(feed.target(), Target::from_difficulty(Difficulty::new(1_000)));
        assert!(!feed.is_pool());
    }
}
