//! Compute devices and their lifecycle.
//!
//! A [`Device`] is the orchestrator's record of one compute unit: identity,
//! throughput geometry, lifecycle state and hash counters. The orchestrator
//! drives it through
//!
//! ```text
//! Created -> Assigned -> Initialized -> Mining <-> Paused
//!                 ^                              |
//!                 +----------- Stopped <---------+
//! ```
//!
//! The device is shared as `Arc<Device>` between the orchestrator and the
//! device's worker thread. All mutable state is atomic or behind a short
//! mutex, so either side can read it at any time. Challenge and target
//! hand-off goes through [`snapshot`] instead of fields on the device.

pub mod geometry;
pub mod snapshot;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::backend::{BackendCapabilities, BackendKind};
use crate::types::{HashRate, MiningMode};
use geometry::{default_gpu_intensity, Geometry, DEFAULT_INTENSITY};

/// Orchestrator-assigned device handle.
pub type DeviceId = slotmap::DefaultKey;

/// Externally visible device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Assigned,
    Initialized,
    Mining,
    Paused,
    Stopped,
}

impl DeviceState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => DeviceState::Created,
            1 => DeviceState::Assigned,
            2 => DeviceState::Initialized,
            3 => DeviceState::Mining,
            4 => DeviceState::Paused,
            _ => DeviceState::Stopped,
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Created => "created",
            DeviceState::Assigned => "assigned",
            DeviceState::Initialized => "initialized",
            DeviceState::Mining => "mining",
            DeviceState::Paused => "paused",
            DeviceState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Error types for device lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: DeviceState, to: DeviceState },

    #[error("Device not assigned")]
    NotAssigned,
}

/// Hashes counted since the last reset.
#[derive(Debug)]
struct HashCounter {
    hashes: u64,
    since: Instant,
}

impl HashCounter {
    fn new() -> Self {
        Self {
            hashes: 0,
            since: Instant::now(),
        }
    }

    fn reset(&mut self) {
        self.hashes = 0;
        self.since = Instant::now();
    }

    fn rate(&self) -> HashRate {
        if self.hashes == 0 {
            return HashRate::default();
        }
        HashRate::from_count(self.hashes, self.since.elapsed())
    }
}

/// One compute unit.
#[derive(Debug)]
pub struct Device {
    name: String,
    capabilities: BackendCapabilities,
    intensity: Option<f64>,
    mode: MiningMode,
    geometry: Option<Geometry>,

    /// Lifecycle, excluding the pause overlay.
    state: AtomicU8,
    paused: AtomicBool,
    stop: AtomicBool,
    counter: Mutex<HashCounter>,
}

impl Device {
    /// New device in `Created`.
    ///
    /// `intensity` overrides the per-model default when set.
    pub fn new(name: String, capabilities: BackendCapabilities, intensity: Option<f64>) -> Self {
        Self {
            name,
            capabilities,
            intensity,
            mode: MiningMode::Normal,
            geometry: None,
            state: AtomicU8::new(DeviceState::Created.to_u8()),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            counter: Mutex::new(HashCounter::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    pub fn mode(&self) -> MiningMode {
        self.mode
    }

    /// Nonces per batch, 0 until assigned.
    pub fn threads(&self) -> u64 {
        self.geometry.map(|g| g.threads).unwrap_or(0)
    }

    /// Current state. A mining device with the pause flag set reports
    /// `Paused`.
    pub fn state(&self) -> DeviceState {
        let state = DeviceState::from_u8(self.state.load(Ordering::Acquire));
        if state == DeviceState::Mining && self.is_paused() {
            DeviceState::Paused
        } else {
            state
        }
    }

    /// Created -> Assigned: pick the intensity and derive geometry.
    pub fn assign(&mut self, mode: MiningMode) -> Result<Geometry, DeviceError> {
        let from = self.state();
        if from != DeviceState::Created {
            return Err(DeviceError::InvalidTransition {
                from,
                to: DeviceState::Assigned,
            });
        }

        let caps = &self.capabilities;
        let intensity = self.intensity.unwrap_or_else(|| match caps.kind {
            BackendKind::Gpu => default_gpu_intensity(&caps.model, caps.compute_version, mode),
            BackendKind::Cpu => DEFAULT_INTENSITY,
        });
        let geometry = Geometry::new(caps.kind, intensity, caps.compute_version);

        self.mode = mode;
        self.geometry = Some(geometry);
        self.state
            .store(DeviceState::Assigned.to_u8(), Ordering::Release);
        Ok(geometry)
    }

    /// Assigned or Stopped -> Initialized, once backend resources exist.
    pub fn mark_initialized(&self) -> Result<(), DeviceError> {
        if self.geometry.is_none() {
            return Err(DeviceError::NotAssigned);
        }
        self.stop.store(false, Ordering::Release);
        self.transition(
            &[DeviceState::Assigned, DeviceState::Stopped],
            DeviceState::Initialized,
        )
    }

    /// Initialized -> Mining, when the worker loop has its first parameters.
    pub fn start_mining(&self) -> Result<(), DeviceError> {
        self.transition(&[DeviceState::Initialized], DeviceState::Mining)?;
        self.reset_counter();
        Ok(())
    }

    /// Any state -> Stopped. Resources are already released.
    pub fn mark_stopped(&self) {
        self.state
            .store(DeviceState::Stopped.to_u8(), Ordering::Release);
        self.paused.store(false, Ordering::Release);
    }

    /// Set the pause flag. Returns whether it changed.
    pub fn pause(&self) -> bool {
        let changed = !self.paused.swap(true, Ordering::AcqRel);
        if changed {
            self.reset_counter();
        }
        changed
    }

    /// Clear the pause flag. Returns whether it changed.
    pub fn resume(&self) -> bool {
        let changed = self.paused.swap(false, Ordering::AcqRel);
        if changed {
            self.reset_counter();
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Ask the worker loop to exit after its current batch.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn record_hashes(&self, hashes: u64) {
        if let Ok(mut counter) = self.counter.lock() {
            counter.hashes = counter.hashes.saturating_add(hashes);
        }
    }

    pub fn reset_counter(&self) {
        if let Ok(mut counter) = self.counter.lock() {
            counter.reset();
        }
    }

    /// Hashrate since the last counter reset; zero unless mining.
    pub fn hashrate(&self) -> HashRate {
        if self.state() != DeviceState::Mining {
            return HashRate::default();
        }
        self.counter
            .lock()
            .map(|counter| counter.rate())
            .unwrap_or_default()
    }

    fn transition(&self, allowed: &[DeviceState], to: DeviceState) -> Result<(), DeviceError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = DeviceState::from_u8(current);
            if !allowed.contains(&from) {
                return Err(DeviceError::InvalidTransition { from, to });
            }
            match self.state.compare_exchange(
                current,
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}
