//! Mining orchestrator.
//!
//! The orchestrator owns every device and reacts to upstream events. It is
//! the only writer of challenge and target snapshots: each announcement is
//! turned into one snapshot (midstate included) and published to all
//! workers at once. It also owns the pause policy:
//!
//! - **Fetch failures**: consecutive failed parameter fetches are counted.
//!   Once the count exceeds the configured threshold, mining devices are
//!   paused. The next successful fetch resumes them.
//! - **Stop solving**: when the pipeline finds the current challenge already
//!   solved, devices pause until a different challenge arrives.
//!
//! Devices whose backend fails to initialize stay in the table for
//! reporting but never get a worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use slotmap::SlotMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{HashBackend, MAX_SOLUTION_COUNT};
use crate::device::snapshot::{SnapshotPublisher, Subscription};
use crate::device::{Device, DeviceError, DeviceId, DeviceState};
use crate::pipeline::{CandidateSender, PipelineStats};
use crate::tracing::prelude::*;
use crate::types::{Address, HashRate, MiningMode, SolutionTemplate, Target};
use crate::upstream::{parse_message_prefix, UpstreamError, UpstreamEvent};
use crate::work::{WorkAllocator, WorkError};
use crate::worker::WorkerHandle;

/// Default consecutive fetch failures tolerated before pausing.
pub const DEFAULT_PAUSE_ON_FAILED_SCANS: u32 = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Enables king-making mode when set.
    pub king_address: Option<Address>,

    /// Consecutive fetch failures tolerated before pausing.
    pub pause_on_failed_scans: u32,

    /// How often to log the hashrate summary.
    pub hashrate_interval: Duration,
}

impl OrchestratorConfig {
    pub fn mode(&self) -> MiningMode {
        if self.king_address.is_some() {
            MiningMode::KingMaking
        } else {
            MiningMode::Normal
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            king_address: None,
            pause_on_failed_scans: DEFAULT_PAUSE_ON_FAILED_SCANS,
            hashrate_interval: Duration::from_secs(30),
        }
    }
}

/// Error types for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Work allocator error: {0}")]
    Work(#[from] WorkError),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

struct DeviceEntry {
    device: Arc<Device>,
    worker: Option<WorkerHandle>,
}

/// Owns the devices and drives them from upstream events.
pub struct MiningOrchestrator {
    config: OrchestratorConfig,
    devices: SlotMap<DeviceId, DeviceEntry>,
    publisher: SnapshotPublisher,
    allocator: Arc<WorkAllocator>,
    candidates: CandidateSender,
    pipeline_stats: Option<Arc<PipelineStats>>,
    started: Instant,

    /// Consecutive failed parameter fetches.
    failed_scans: u32,

    /// Set by `StopSolvingCurrentChallenge`, cleared by a new challenge.
    stop_solving: bool,
}

impl MiningOrchestrator {
    /// Create an orchestrator publishing through `publisher` and feeding
    /// worker candidates into `candidates`.
    pub fn new(
        config: OrchestratorConfig,
        publisher: SnapshotPublisher,
        candidates: CandidateSender,
    ) -> Self {
        Self {
            config,
            devices: SlotMap::new(),
            publisher,
            allocator: Arc::new(WorkAllocator::new()),
            candidates,
            pipeline_stats: None,
            started: Instant::now(),
            failed_scans: 0,
            stop_solving: false,
        }
    }

    /// Include pipeline counters in the periodic summary.
    pub fn with_pipeline_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.pipeline_stats = Some(stats);
        self
    }

    pub fn mode(&self) -> MiningMode {
        self.config.mode()
    }

    pub fn allocator(&self) -> Arc<WorkAllocator> {
        Arc::clone(&self.allocator)
    }

    /// A read side of the published snapshots.
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// Bring up a device: assign geometry, initialize its backend and start
    /// its worker.
    ///
    /// A backend that fails to initialize is logged and left without a
    /// worker; the device still gets an id so it shows up in reports.
    pub fn add_device(
        &mut self,
        mut device: Device,
        mut backend: Box<dyn HashBackend>,
    ) -> Result<DeviceId, OrchestratorError> {
        let geometry = device.assign(self.mode())?;
        info!(
            device = %device.name(),
            kind = %device.capabilities().kind,
            model = %device.capabilities().model,
            estimate = %device.capabilities().hashrate_estimate.to_human_readable(),
            intensity = geometry.intensity,
            threads = geometry.threads,
            "Device assigned"
        );

        if let Err(e) = backend.initialize(MAX_SOLUTION_COUNT) {
            error!(device = %device.name(), error = %e, "Backend initialization failed, skipping device");
            let id = self.devices.insert(DeviceEntry {
                device: Arc::new(device),
                worker: None,
            });
            return Ok(id);
        }
        device.mark_initialized()?;

        let device = Arc::new(device);
        if self.is_holding() {
            device.pause();
        }

        let worker = match WorkerHandle::spawn(
            Arc::clone(&device),
            backend,
            Arc::clone(&self.allocator),
            self.publisher.subscribe(),
            self.candidates.clone(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                device.mark_stopped();
                return Err(e.into());
            }
        };

        Ok(self.devices.insert(DeviceEntry {
            device,
            worker: Some(worker),
        }))
    }

    pub fn device(&self, id: DeviceId) -> Option<&Arc<Device>> {
        self.devices.get(id).map(|entry| &entry.device)
    }

    pub fn device_states(&self) -> Vec<(String, DeviceState)> {
        self.devices
            .values()
            .map(|entry| (entry.device.name().to_string(), entry.device.state()))
            .collect()
    }

    pub fn hashrate(&self, id: DeviceId) -> Option<HashRate> {
        self.devices.get(id).map(|entry| entry.device.hashrate())
    }

    /// Sum over all devices; paused devices contribute zero.
    pub fn total_hashrate(&self) -> HashRate {
        self.devices
            .values()
            .map(|entry| entry.device.hashrate())
            .sum()
    }

    /// Whether devices should currently be held paused.
    fn is_holding(&self) -> bool {
        self.stop_solving || self.failed_scans > self.config.pause_on_failed_scans
    }

    fn pause_all(&self) -> usize {
        self.devices
            .values()
            .filter(|entry| entry.device.pause())
            .count()
    }

    fn resume_all(&self) -> usize {
        self.devices
            .values()
            .filter(|entry| entry.device.resume())
            .count()
    }

    pub fn handle_event(&mut self, event: UpstreamEvent) -> Result<(), OrchestratorError> {
        match event {
            UpstreamEvent::NewChallenge(hex) => self.on_new_challenge(&hex)?,
            UpstreamEvent::NewTarget(hex) => self.on_new_target(&hex)?,
            UpstreamEvent::ParameterFetchStatus(success) => self.on_fetch_status(success),
            UpstreamEvent::StopSolvingCurrentChallenge => self.on_stop_solving(),
        }
        Ok(())
    }

    fn on_new_challenge(&mut self, hex: &str) -> Result<(), OrchestratorError> {
        let prefix = parse_message_prefix(hex)?;
        if let Some(current) = self.publisher.current_challenge() {
            if current.challenge == prefix.challenge && current.address == prefix.address {
                trace!(challenge = %prefix.challenge, "Challenge unchanged");
                return Ok(());
            }
        }

        let template = SolutionTemplate::generate(self.config.king_address.as_ref());
        // Reset before publishing so no worker on the new snapshot draws
        // from the old counter.
        let previous = self.allocator.reset()?;
        let snapshot =
            self.publisher
                .publish_challenge(prefix.challenge, prefix.address, template, self.mode());

        info!(
            challenge = %snapshot.challenge,
            address = %snapshot.address,
            mode = %snapshot.mode,
            "New challenge"
        );
        debug!(
            generation = snapshot.generation,
            previous_work = previous,
            template = %hex::encode(snapshot.template.as_bytes()),
            "Challenge published"
        );

        if self.stop_solving {
            self.stop_solving = false;
            if !self.is_holding() {
                let resumed = self.resume_all();
                info!(devices = resumed, "Resuming on new challenge");
            }
        }
        Ok(())
    }

    fn on_new_target(&mut self, hex: &str) -> Result<(), OrchestratorError> {
        let target = Target::from_hex(hex).map_err(UpstreamError::InvalidTarget)?;

        if self.publisher.current_target().map(|t| t.target) == Some(target) {
            return Ok(());
        }

        let snapshot = self.publisher.publish_target(target);
        info!(target = %snapshot.target, "New target");
        debug!(
            generation = snapshot.generation,
            high64 = %format!("{:#018x}", snapshot.high64),
            "Target published"
        );
        Ok(())
    }

    fn on_fetch_status(&mut self, success: bool) {
        let threshold = self.config.pause_on_failed_scans;

        if success {
            let was_holding = self.failed_scans > threshold;
            self.failed_scans = 0;
            if was_holding && !self.stop_solving {
                let resumed = self.resume_all();
                info!(devices = resumed, "Upstream recovered, resuming");
            }
            return;
        }

        self.failed_scans = self.failed_scans.saturating_add(1);
        warn!(
            failed_scans = self.failed_scans,
            threshold, "Upstream parameter fetch failed"
        );

        if self.failed_scans > threshold {
            let paused = self.pause_all();
            if paused > 0 {
                warn!(devices = paused, "Too many failed fetches, pausing");
            }
        }
    }

    fn on_stop_solving(&mut self) {
        if self.stop_solving {
            return;
        }
        self.stop_solving = true;
        let paused = self.pause_all();
        info!(devices = paused, "Challenge solved, pausing until the next one");
    }

    /// Log per-device and total hashrate.
    pub fn log_summary(&self) {
        for entry in self.devices.values() {
            let device = &entry.device;
            info!(
                device = %device.name(),
                state = %device.state(),
                hashrate = %device.hashrate().to_human_readable(),
                "Device status."
            );
        }

        let uptime_s = self.started.elapsed().as_secs();
        let total = self.total_hashrate();
        match &self.pipeline_stats {
            Some(stats) => {
                let counts = stats.snapshot();
                info!(
                    uptime_s,
                    hashrate = %total.to_human_readable(),
                    accepted = counts.accepted,
                    rejected = counts.rejected,
                    stale = counts.stale,
                    verification_failures = counts.verification_failures,
                    "Mining status."
                );
            }
            None => info!(
                uptime_s,
                hashrate = %total.to_human_readable(),
                "Mining status."
            ),
        }
    }

    /// Handle events until `running` is cancelled or the upstream channel
    /// closes, then stop every device.
    pub async fn run(
        mut self,
        running: CancellationToken,
        mut events: mpsc::Receiver<UpstreamEvent>,
    ) {
        let mut status_interval = tokio::time::interval(self.config.hashrate_interval);
        status_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut first_tick = true;

        debug!(devices = self.devices.len(), mode = %self.mode(), "Orchestrator ready");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Upstream feed closed");
                        break;
                    };
                    if let Err(e) = self.handle_event(event) {
                        warn!(error = %e, "Failed to handle upstream event");
                    }
                }

                _ = status_interval.tick() => {
                    if first_tick {
                        first_tick = false;
                    } else {
                        self.log_summary();
                    }
                }

                _ = running.cancelled() => {
                    debug!("Orchestrator shutdown requested");
                    break;
                }
            }
        }

        self.log_summary();
        self.shutdown().await;
    }

    /// Stop every device and wait for the workers to exit.
    pub async fn shutdown(&mut self) {
        let mut workers = Vec::new();
        for entry in self.devices.values_mut() {
            entry.device.request_stop();
            if let Some(worker) = entry.worker.take() {
                workers.push(worker);
            }
        }

        if workers.is_empty() {
            return;
        }

        let count = workers.len();
        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                worker.join();
            }
        })
        .await;

        match joined {
            Ok(()) => debug!(workers = count, "All workers stopped"),
            Err(e) => error!(error = %e, "Failed to join workers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockBackend};
    use crate::backend::{BackendError, BackendKind};
    use crate::pipeline::candidate_queue;
    use crate::types::{Challenge, MessagePrefix};
    use crate::u256::U256;

    fn orchestrator(config: OrchestratorConfig) -> MiningOrchestrator {
        let (sender, _rx) = candidate_queue(16);
        MiningOrchestrator::new(config, SnapshotPublisher::new(), sender)
    }

    fn add_mock(orchestrator: &mut MiningOrchestrator, backend: MockBackend) -> DeviceId {
        let device = Device::new(
            backend.name().to_string(),
            backend.capabilities().clone(),
            Some(4.0),
        );
        orchestrator.add_device(device, Box::new(backend)).unwrap()
    }

    fn challenge_event(byte: u8) -> UpstreamEvent {
        UpstreamEvent::NewChallenge(
            MessagePrefix {
                challenge: Challenge([byte; 32]),
                address: Address([0x11; 20]),
            }
            .to_string(),
        )
    }

    fn paused(orchestrator: &MiningOrchestrator, id: DeviceId) -> bool {
        orchestrator.device(id).unwrap().is_paused()
    }

    #[tokio::test]
    async fn test_new_challenge_publishes_once_and_resets_allocator() {
        let mut orch = orchestrator(OrchestratorConfig::default());
        let sub = orch.subscribe();

        orch.handle_event(challenge_event(1)).unwrap();
        let first = sub.latest_challenge().unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(first.mode, MiningMode::Normal);

        orch.allocator().acquire_range(1000).unwrap();

        // Same challenge again: ignored, counter untouched.
        orch.handle_event(challenge_event(1)).unwrap();
        assert_eq!(sub.latest_challenge().unwrap().generation, 1);
        assert_eq!(orch.allocator().peek().unwrap(), 1000);

        orch.handle_event(challenge_event(2)).unwrap();
        let second = sub.latest_challenge().unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(second.challenge, Challenge([2; 32]));
        assert_eq!(orch.allocator().peek().unwrap(), 0);

        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_challenge_prefix_is_rejected() {
        let mut orch = orchestrator(OrchestratorConfig::default());
        let sub = orch.subscribe();

        let err = orch
            .handle_event(UpstreamEvent::NewChallenge("0x1234".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Upstream(UpstreamError::InvalidPrefix(_))
        ));
        assert!(sub.latest_challenge().is_none());

        let hex = format!("{}{}", "ab".repeat(32), "cd".repeat(20));
        orch.handle_event(UpstreamEvent::NewChallenge(hex)).unwrap();
        let snapshot = sub.latest_challenge().unwrap();
        assert_eq!(snapshot.challenge, Challenge([0xab; 32]));
        assert_eq!(snapshot.address, Address([0xcd; 20]));
    }

    #[tokio::test]
    async fn test_king_address_selects_king_mode_template() {
        let king = Address([0x22; 20]);
        let mut orch = orchestrator(OrchestratorConfig {
            king_address: Some(king),
            ..Default::default()
        });
        let sub = orch.subscribe();

        orch.handle_event(challenge_event(1)).unwrap();
        let snapshot = sub.latest_challenge().unwrap();
        assert_eq!(snapshot.mode, MiningMode::KingMaking);
        assert_eq!(&snapshot.template.0[..20], king.as_bytes());
        assert_eq!(&snapshot.template.0[20..28], &[0u8; 8]);
    }

    #[tokio::test]
    async fn test_new_target_parsed_and_cached() {
        let mut orch = orchestrator(OrchestratorConfig::default());
        let sub = orch.subscribe();

        let hex = format!("0x{}{}", "00000000ffffffff", "f".repeat(48));
        orch.handle_event(UpstreamEvent::NewTarget(hex)).unwrap();
        let target = sub.latest_target().unwrap();
        assert_eq!(target.high64, 0x0000_0000_ffff_ffff);

        let err = orch
            .handle_event(UpstreamEvent::NewTarget("0xnothex".into()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Upstream(_)));
        assert_eq!(sub.latest_target().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_failed_fetches_pause_then_recover() {
        let mut orch = orchestrator(OrchestratorConfig {
            pause_on_failed_scans: 2,
            ..Default::default()
        });
        let id = add_mock(&mut orch, MockBackend::new("cpu-0"));

        orch.handle_event(UpstreamEvent::ParameterFetchStatus(false)).unwrap();
        orch.handle_event(UpstreamEvent::ParameterFetchStatus(false)).unwrap();
        assert!(!paused(&orch, id));

        orch.handle_event(UpstreamEvent::ParameterFetchStatus(false)).unwrap();
        assert!(paused(&orch, id));
        assert!(orch.total_hashrate().is_zero());

        orch.handle_event(UpstreamEvent::ParameterFetchStatus(true)).unwrap();
        assert!(!paused(&orch, id));

        // The counter starts over after a success.
        orch.handle_event(UpstreamEvent::ParameterFetchStatus(false)).unwrap();
        assert!(!paused(&orch, id));

        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_solving_holds_until_new_challenge() {
        let mut orch = orchestrator(OrchestratorConfig::default());
        let id = add_mock(&mut orch, MockBackend::new("cpu-0"));
        orch.handle_event(challenge_event(1)).unwrap();

        orch.handle_event(UpstreamEvent::StopSolvingCurrentChallenge).unwrap();
        assert!(paused(&orch, id));

        // A successful fetch alone does not resume.
        orch.handle_event(UpstreamEvent::ParameterFetchStatus(true)).unwrap();
        assert!(paused(&orch, id));

        // Nor does the same challenge again.
        orch.handle_event(challenge_event(1)).unwrap();
        assert!(paused(&orch, id));

        orch.handle_event(challenge_event(2)).unwrap();
        assert!(!paused(&orch, id));

        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_devices_added_while_holding_start_paused() {
        let mut orch = orchestrator(OrchestratorConfig::default());
        orch.handle_event(UpstreamEvent::StopSolvingCurrentChallenge).unwrap();

        let id = add_mock(&mut orch, MockBackend::new("cpu-0"));
        assert!(paused(&orch, id));

        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_failure_skips_device() {
        let mut orch = orchestrator(OrchestratorConfig::default());
        let failing = MockBackend::new("gpu-0")
            .with_kind(BackendKind::Gpu, "GeForce GTX 1080", 610)
            .failing_initialize(BackendError::Initialization("out of memory".into()));
        let calls = failing.calls();

        let bad = add_mock(&mut orch, failing);
        let good = add_mock(&mut orch, MockBackend::new("cpu-0"));

        assert_eq!(orch.device(bad).unwrap().state(), DeviceState::Assigned);
        assert!(orch.devices[bad].worker.is_none());
        assert!(orch.devices[good].worker.is_some());
        assert_eq!(*calls.lock().unwrap(), vec![Call::Initialize(MAX_SOLUTION_COUNT)]);

        orch.shutdown().await;
        assert_eq!(orch.device(good).unwrap().state(), DeviceState::Stopped);
    }

    #[tokio::test]
    async fn test_devices_mine_after_parameters_and_stop_on_shutdown() {
        let mut orch = orchestrator(OrchestratorConfig::default());
        let backend = MockBackend::new("cpu-0");
        let calls = backend.calls();
        let id = add_mock(&mut orch, backend);

        orch.handle_event(UpstreamEvent::NewTarget(Target::new(U256::MAX / 2u64).to_string()))
            .unwrap();
        orch.handle_event(challenge_event(1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while orch.device(id).unwrap().state() != DeviceState::Mining {
            assert!(Instant::now() < deadline, "device never started mining");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let states = orch.device_states();
        assert_eq!(states, vec![("cpu-0".to_string(), DeviceState::Mining)]);
        assert!(orch.hashrate(id).is_some());

        orch.shutdown().await;
        assert_eq!(orch.device(id).unwrap().state(), DeviceState::Stopped);
        assert_eq!(calls.lock().unwrap().last(), Some(&Call::Release));
    }

    #[tokio::test]
    async fn test_run_exits_when_cancelled() {
        let orch = orchestrator(OrchestratorConfig::default());
        let running = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(4);

        let handle = tokio::spawn(orch.run(running.clone(), event_rx));
        event_tx.send(challenge_event(1)).await.unwrap();
        running.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_exits_when_upstream_closes() {
        let orch = orchestrator(OrchestratorConfig::default());
        let (event_tx, event_rx) = mpsc::channel(4);

        let handle = tokio::spawn(orch.run(CancellationToken::new(), event_rx));
        drop(event_tx);
        handle.await.unwrap();
    }
}
