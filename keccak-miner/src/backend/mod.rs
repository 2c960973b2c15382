//! Hash backend abstraction.
//!
//! A backend is one compute unit's batch-hash engine. The worker loop drives
//! it through [`HashBackend`] without knowing whether the hashing happens on
//! CPU cores or inside a native GPU kernel.
//!
//! # Buffers
//!
//! Backends hold their own copies of the inputs. Which inputs depend on the
//! mining mode:
//!
//! - **Normal**: midstate plus the 64-bit target prefix. The nonce lands in
//!   message word 8 and kernels only finish the permutation.
//! - **King-making**: full message plus the full 256-bit target. The nonce
//!   lands in message word 9.
//!
//! Every method reports failures as [`BackendError`] carrying the native
//! error text. The worker logs them and stops only its own device.

pub mod cpu;
pub mod gpu;
#[cfg(test)]
pub(crate) mod mock;

use crate::midstate::MidState;
use crate::types::{HashRate, Message, Target};
use crate::work::NonceRange;

/// Candidate slots per batch.
pub const MAX_SOLUTION_COUNT: usize = 4;

/// Kind of compute unit behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cpu,
    Gpu,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Gpu => write!(f, "gpu"),
        }
    }
}

/// Static facts a backend reports about itself.
#[derive(Debug, Clone)]
pub struct BackendCapabilities {
    pub kind: BackendKind,

    /// Model name as reported by the hardware.
    pub model: String,

    /// Compute version (`major * 100 + minor * 10`), 0 for CPUs.
    pub compute_version: u32,

    /// Rough hashrate, for logging at startup.
    pub hashrate_estimate: HashRate,
}

/// Target as pushed to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetBuffer {
    /// Most significant 64 bits of the target (normal mode).
    High64(u64),

    /// Full target (king-making mode).
    Full(Target),
}

/// Result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashBatch {
    /// Candidate nonces, at most the `max_candidates` given to `initialize`.
    pub candidates: Vec<u64>,

    /// Solutions the backend counted, which may exceed `candidates.len()`
    /// when the slots overflow.
    pub solution_count: u32,
}

/// Error types for backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Buffer upload failed: {0}")]
    Buffer(String),

    #[error("Hashing failed: {0}")]
    Hashing(String),

    #[error("Release failed: {0}")]
    Release(String),

    #[error("Backend not initialized")]
    NotInitialized,

    #[error("Missing input: {0}")]
    MissingInput(&'static str),
}

/// A device's batch-hash engine.
///
/// Called only from the device's own worker thread, so implementations may
/// block for the duration of a batch.
pub trait HashBackend: Send {
    /// Name for logging.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &BackendCapabilities;

    /// Acquire native resources and a candidate buffer with
    /// `max_candidates` slots.
    fn initialize(&mut self, max_candidates: usize) -> Result<(), BackendError>;

    fn push_target(&mut self, target: TargetBuffer) -> Result<(), BackendError>;

    /// Switch to normal mode with this midstate.
    fn push_mid_state(&mut self, mid_state: &MidState) -> Result<(), BackendError>;

    /// Switch to king-making mode with this message (zero nonce slot).
    fn push_message(&mut self, message: &Message) -> Result<(), BackendError>;

    /// Hash every nonce in `range` and report candidates.
    fn hash_batch(&mut self, range: NonceRange) -> Result<HashBatch, BackendError>;

    /// Zero the backend's solution counter after the candidates are drained.
    fn reset_solution_count(&mut self) -> Result<(), BackendError>;

    /// Free native resources. The backend may be initialized again later.
    fn release(&mut self) -> Result<(), BackendError>;
}

/// Whether a digest passes a backend target check.
///
/// The 64-bit form compares the digest's leading eight bytes, read
/// big-endian, so it can accept digests the full comparison rejects. Those
/// are caught by verification downstream.
pub(crate) fn meets_target_buffer(digest: &[u8; 32], target: &TargetBuffer) -> bool {
    match target {
        TargetBuffer::High64(high64) => {
            let mut leading = [0u8; 8];
            leading.copy_from_slice(&digest[..8]);
            u64::from_be_bytes(leading) < *high64
        }
        TargetBuffer::Full(target) => target.is_met_by(digest),
    }
}
