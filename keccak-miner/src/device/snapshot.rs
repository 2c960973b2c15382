//! Versioned hand-off of mining parameters to workers.
//!
//! The orchestrator publishes each new challenge or target once; every
//! subscriber holds its own `watch::Receiver` whose internal version acts as
//! the generation counter for what that worker has already consumed.
//! `has_new_*` is true when the latest publication has not been taken yet,
//! and taking it marks it seen. Publishing and observing go through the
//! channel, so the buffer a worker reads is always the one that raised the
//! flag.

use std::sync::Arc;

use tokio::sync::watch;

use crate::midstate::{compute_mid_state, MidState};
use crate::types::{Address, Challenge, Message, MiningMode, SolutionTemplate, Target};

/// Everything derived from one challenge announcement.
#[derive(Debug, Clone)]
pub struct ChallengeSnapshot {
    /// Monotonic publication counter, starting at 1.
    pub generation: u64,
    pub challenge: Challenge,
    pub address: Address,
    pub template: SolutionTemplate,
    pub mode: MiningMode,

    /// `challenge ‖ address ‖ template` with a zero nonce slot.
    pub message: Message,

    /// Midstate of `message`, computed once for all devices.
    pub mid_state: MidState,
}

impl ChallengeSnapshot {
    pub fn new(
        generation: u64,
        challenge: Challenge,
        address: Address,
        template: SolutionTemplate,
        mode: MiningMode,
    ) -> Self {
        Self {
            generation,
            challenge,
            address,
            template,
            mode,
            message: Message::new(&challenge, &address, template.as_bytes()),
            mid_state: compute_mid_state(&challenge, &address, &template),
        }
    }
}

/// A published target with its cached 64-bit prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub generation: u64,
    pub target: Target,
    pub high64: u64,
}

type ChallengeSlot = Option<Arc<ChallengeSnapshot>>;
type TargetSlot = Option<TargetSnapshot>;

/// Write side, owned by the orchestrator.
#[derive(Debug)]
pub struct SnapshotPublisher {
    challenge_tx: watch::Sender<ChallengeSlot>,
    target_tx: watch::Sender<TargetSlot>,
    challenge_generation: u64,
    target_generation: u64,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let (challenge_tx, _) = watch::channel(None);
        let (target_tx, _) = watch::channel(None);
        Self {
            challenge_tx,
            target_tx,
            challenge_generation: 0,
            target_generation: 0,
        }
    }

    /// Build and publish a challenge snapshot, computing its midstate.
    pub fn publish_challenge(
        &mut self,
        challenge: Challenge,
        address: Address,
        template: SolutionTemplate,
        mode: MiningMode,
    ) -> Arc<ChallengeSnapshot> {
        self.challenge_generation += 1;
        let snapshot = Arc::new(ChallengeSnapshot::new(
            self.challenge_generation,
            challenge,
            address,
            template,
            mode,
        ));
        self.challenge_tx.send_replace(Some(Arc::clone(&snapshot)));
        snapshot
    }

    pub fn publish_target(&mut self, target: Target) -> TargetSnapshot {
        self.target_generation += 1;
        let snapshot = TargetSnapshot {
            generation: self.target_generation,
            target,
            high64: target.high64(),
        };
        self.target_tx.send_replace(Some(snapshot));
        snapshot
    }

    pub fn current_challenge(&self) -> Option<Arc<ChallengeSnapshot>> {
        self.challenge_tx.borrow().clone()
    }

    pub fn current_target(&self) -> Option<TargetSnapshot> {
        *self.target_tx.borrow()
    }

    /// New read side. Anything already published counts as unseen.
    pub fn subscribe(&self) -> Subscription {
        let mut challenge_rx = self.challenge_tx.subscribe();
        let mut target_rx = self.target_tx.subscribe();
        if challenge_rx.borrow().is_some() {
            challenge_rx.mark_changed();
        }
        if target_rx.borrow().is_some() {
            target_rx.mark_changed();
        }
        Subscription {
            challenge_rx,
            target_rx,
        }
    }
}

/// Read side, one per consumer.
#[derive(Debug, Clone)]
pub struct Subscription {
    challenge_rx: watch::Receiver<ChallengeSlot>,
    target_rx: watch::Receiver<TargetSlot>,
}

impl Subscription {
    /// Both a challenge and a target have been published at least once.
    pub fn is_ready(&self) -> bool {
        self.challenge_rx.borrow().is_some() && self.target_rx.borrow().is_some()
    }

    /// A challenge was published that this subscriber has not taken.
    pub fn has_new_challenge(&self) -> bool {
        self.challenge_rx.has_changed().unwrap_or(false)
    }

    pub fn has_new_target(&self) -> bool {
        self.target_rx.has_changed().unwrap_or(false)
    }

    /// Take the latest challenge and mark it seen.
    pub fn take_challenge(&mut self) -> Option<Arc<ChallengeSnapshot>> {
        self.challenge_rx.borrow_and_update().clone()
    }

    /// Take the latest target and mark it seen.
    pub fn take_target(&mut self) -> Option<TargetSnapshot> {
        *self.target_rx.borrow_and_update()
    }

    /// Latest challenge without marking it seen.
    pub fn latest_challenge(&self) -> Option<Arc<ChallengeSnapshot>> {
        self.challenge_rx.borrow().clone()
    }

    /// Latest target without marking it seen.
    pub fn latest_target(&self) -> Option<TargetSnapshot> {
        *self.target_rx.borrow()
    }
}
