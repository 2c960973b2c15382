//! Daemon lifecycle management for keccak-miner.
//!
//! Wires configuration, devices, the orchestrator, the solution pipeline and
//! the upstream feed together, then waits for a shutdown signal.

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::tracing::prelude::*;
use crate::{
    backend::{
        cpu::CpuBackend,
        gpu::{self, NoGpuDriver},
        HashBackend,
    },
    config::MinerConfig,
    device::{snapshot::SnapshotPublisher, Device},
    orchestrator::MiningOrchestrator,
    pipeline::SolutionPipeline,
    upstream::{dummy::DummyFeed, UpstreamEvent, UpstreamFeed},
};

/// Capacity of the upstream event channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = MinerConfig::from_env()?;
        let address = config.miner_address();
        info!(
            address = %address,
            mode = %config.orchestrator_config().mode(),
            "Configuration loaded"
        );

        let publisher = SnapshotPublisher::new();
        let (event_tx, event_rx) = mpsc::channel::<UpstreamEvent>(EVENT_CHANNEL_CAPACITY);

        // The network RPC client is not part of this build; the dummy feed
        // stands in for it.
        let feed = Arc::new(DummyFeed::new(config.dummy_config(address)));
        info!(feed = feed.name(), "Using dummy upstream feed");

        let pipeline = SolutionPipeline::new(
            config.pipeline_config(),
            Arc::clone(&feed) as Arc<dyn UpstreamFeed>,
            publisher.subscribe(),
            event_tx.clone(),
        );
        let pipeline_stats = pipeline.stats();
        let candidates = pipeline.spawn(&self.tracker, self.shutdown.clone());

        let mut orchestrator =
            MiningOrchestrator::new(config.orchestrator_config(), publisher, candidates)
                .with_pipeline_stats(pipeline_stats);

        let gpus = gpu::discover(&NoGpuDriver);
        let cpu_count = config.cpu_device_count(gpus.len());
        info!(
            gpus = gpus.len(),
            cpus = cpu_count,
            duty = config.cpu_duty,
            "Devices found"
        );

        for backend in gpus {
            add_device(&mut orchestrator, Box::new(backend), None);
        }
        for i in 0..cpu_count {
            let backend = CpuBackend::new(format!("cpu-{}", i), config.cpu_duty);
            add_device(
                &mut orchestrator,
                Box::new(backend),
                Some(config.cpu_intensity),
            );
        }

        self.tracker.spawn({
            let feed = Arc::clone(&feed);
            let shutdown = self.shutdown.clone();
            async move {
                if let Err(e) = feed.run(event_tx, shutdown).await {
                    error!("Dummy feed error: {}", e);
                }
            }
        });

        self.tracker
            .spawn(orchestrator.run(self.shutdown.clone(), event_rx));

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=keccak_miner=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        self.shutdown.cancel();
        self.tracker.wait().await;
        info!(accepted = feed.accepted(), "Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

// A device that fails to come up is logged and skipped.
fn add_device(
    orchestrator: &mut MiningOrchestrator,
    backend: Box<dyn HashBackend>,
    intensity: Option<f64>,
) {
    let device = Device::new(
        backend.name().to_string(),
        backend.capabilities().clone(),
        intensity,
    );
    let name = device.name().to_string();
    if let Err(e) = orchestrator.add_device(device, backend) {
        error!(device = %name, error = %e, "Failed to add device");
    }
}
