//! Configuration for the miner daemon.
//!
//! Everything is read from `KECCAK_MINER_*` environment variables. Numeric
//! settings fall back to their defaults when unset or unparsable and are
//! clamped to a sane range. Addresses are the exception: a malformed
//! address is an error, since mining to the wrong beneficiary is worse than
//! not starting.

use std::time::Duration;

use rand::RngCore;

use crate::orchestrator::OrchestratorConfig;
use crate::pipeline::{PipelineConfig, DEFAULT_QUEUE_CAPACITY};
use crate::types::{Address, Difficulty, ParseError, ADDRESS_LENGTH};
use crate::upstream::dummy::DummyConfig;

pub const ENV_ADDRESS: &str = "KECCAK_MINER_ADDRESS";
pub const ENV_KING_ADDRESS: &str = "KECCAK_MINER_KING_ADDRESS";
pub const ENV_CPU_THREADS: &str = "KECCAK_MINER_CPU_THREADS";
pub const ENV_CPU_DUTY: &str = "KECCAK_MINER_CPU_DUTY";
pub const ENV_INTENSITY: &str = "KECCAK_MINER_INTENSITY";
pub const ENV_SUBMIT_STALE: &str = "KECCAK_MINER_SUBMIT_STALE";
pub const ENV_PAUSE_ON_FAILED_SCANS: &str = "KECCAK_MINER_PAUSE_ON_FAILED_SCANS";
pub const ENV_HASHRATE_INTERVAL: &str = "KECCAK_MINER_HASHRATE_INTERVAL";
pub const ENV_SUBMIT_QUEUE: &str = "KECCAK_MINER_SUBMIT_QUEUE";
pub const ENV_DUMMY_INTERVAL: &str = "KECCAK_MINER_DUMMY_INTERVAL";
pub const ENV_DUMMY_DIFFICULTY: &str = "KECCAK_MINER_DUMMY_DIFFICULTY";

const DEFAULT_CPU_INTENSITY: f64 = 18.0;
const MAX_CPU_INTENSITY: f64 = 40.0;
const MAX_QUEUE_CAPACITY: usize = 1024;

/// Error types for configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("Invalid hex in {var}: {source}")]
    InvalidHex {
        var: &'static str,
        #[source]
        source: ParseError,
    },
}

/// Daemon configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Address announced by the dummy feed. Random when unset.
    pub address: Option<Address>,

    /// Enables king-making mode.
    pub king_address: Option<Address>,

    /// Number of CPU devices. `None` when CPU mining was not requested.
    pub cpu_threads: Option<usize>,

    /// CPU duty cycle percentage (1-100).
    pub cpu_duty: u8,

    /// CPU intensity, log2 of the batch size.
    pub cpu_intensity: f64,

    pub submit_stale: bool,
    pub pause_on_failed_scans: u32,
    pub hashrate_interval: Duration,
    pub submit_queue: usize,
    pub dummy_interval: Duration,
    pub dummy_difficulty: Difficulty,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            address: None,
            king_address: None,
            cpu_threads: None,
            cpu_duty: 100,
            cpu_intensity: DEFAULT_CPU_INTENSITY,
            submit_stale: false,
            pause_on_failed_scans: crate::orchestrator::DEFAULT_PAUSE_ON_FAILED_SCANS,
            hashrate_interval: Duration::from_secs(30),
            submit_queue: DEFAULT_QUEUE_CAPACITY,
            dummy_interval: Duration::from_secs(60),
            dummy_difficulty: Difficulty::new(1_000_000),
        }
    }
}

impl MinerConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KECCAK_MINER_ADDRESS`: miner address, 40 hex digits
    /// - `KECCAK_MINER_KING_ADDRESS`: king address (enables king-making mode)
    /// - `KECCAK_MINER_CPU_THREADS`: CPU device count, `0` or `auto` for one per core
    /// - `KECCAK_MINER_CPU_DUTY`: CPU duty cycle % (default: 100, clamped to 1-100)
    /// - `KECCAK_MINER_INTENSITY`: CPU intensity (default: 18, clamped to 1-40)
    /// - `KECCAK_MINER_SUBMIT_STALE`: submit stale solutions (`1` or `true`)
    /// - `KECCAK_MINER_PAUSE_ON_FAILED_SCANS`: fetch failures before pausing (default: 3)
    /// - `KECCAK_MINER_HASHRATE_INTERVAL`: seconds between summaries (default: 30, min 1)
    /// - `KECCAK_MINER_SUBMIT_QUEUE`: submission queue capacity (default: 64, clamped to 1-1024)
    /// - `KECCAK_MINER_DUMMY_INTERVAL`: seconds between dummy challenges (default: 60, min 1)
    /// - `KECCAK_MINER_DUMMY_DIFFICULTY`: dummy feed difficulty (default: 1000000, min 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            address: address_var(ENV_ADDRESS)?,
            king_address: address_var(ENV_KING_ADDRESS)?,
            cpu_threads: cpu_threads_var(),
            cpu_duty: parsed_var(ENV_CPU_DUTY)
                .unwrap_or(defaults.cpu_duty)
                .clamp(1, 100),
            cpu_intensity: parsed_var::<f64>(ENV_INTENSITY)
                .filter(|v| v.is_finite())
                .unwrap_or(defaults.cpu_intensity)
                .clamp(1.0, MAX_CPU_INTENSITY),
            submit_stale: bool_var(ENV_SUBMIT_STALE),
            pause_on_failed_scans: parsed_var(ENV_PAUSE_ON_FAILED_SCANS)
                .unwrap_or(defaults.pause_on_failed_scans),
            hashrate_interval: parsed_var(ENV_HASHRATE_INTERVAL)
                .map(|s: u64| Duration::from_secs(s.max(1)))
                .unwrap_or(defaults.hashrate_interval),
            submit_queue: parsed_var(ENV_SUBMIT_QUEUE)
                .unwrap_or(defaults.submit_queue)
                .clamp(1, MAX_QUEUE_CAPACITY),
            dummy_interval: parsed_var(ENV_DUMMY_INTERVAL)
                .map(|s: u64| Duration::from_secs(s.max(1)))
                .unwrap_or(defaults.dummy_interval),
            dummy_difficulty: parsed_var(ENV_DUMMY_DIFFICULTY)
                .map(|d: u64| Difficulty::new(d.max(1)))
                .unwrap_or(defaults.dummy_difficulty),
        })
    }

    /// CPU devices to create given how many GPUs were found.
    ///
    /// When CPU mining was not requested, a single CPU device is still
    /// created if there is nothing else to mine with.
    pub fn cpu_device_count(&self, gpu_count: usize) -> usize {
        match self.cpu_threads {
            Some(n) => n,
            None if gpu_count == 0 => 1,
            None => 0,
        }
    }

    /// The configured miner address, or a random one.
    pub fn miner_address(&self) -> Address {
        self.address.unwrap_or_else(|| {
            let mut bytes = [0u8; ADDRESS_LENGTH];
            rand::thread_rng().fill_bytes(&mut bytes);
            Address(bytes)
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            king_address: self.king_address,
            pause_on_failed_scans: self.pause_on_failed_scans,
            hashrate_interval: self.hashrate_interval,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            submit_stale: self.submit_stale,
            queue_capacity: self.submit_queue,
        }
    }

    pub fn dummy_config(&self, address: Address) -> DummyConfig {
        DummyConfig {
            address,
            interval: self.dummy_interval,
            difficulty: self.dummy_difficulty,
        }
    }
}

fn parsed_var<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.trim().parse().ok())
}

fn bool_var(var: &str) -> bool {
    std::env::var(var)
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn cpu_threads_var() -> Option<usize> {
    let value = std::env::var(ENV_CPU_THREADS).ok()?;
    let value = value.trim();
    if value.eq_ignore_ascii_case("auto") {
        return Some(num_cpus::get());
    }
    match value.parse::<usize>().ok()? {
        0 => Some(num_cpus::get()),
        n => Some(n),
    }
}

fn address_var(var: &'static str) -> Result<Option<Address>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Address::from_hex(value.trim())
            .map(Some)
            .map_err(|source| ConfigError::InvalidHex { var, source }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(value)) => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string_lossy().into_owned(),
        }),
    }
}
