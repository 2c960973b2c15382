//! CPU hash backend.
//!
//! Hashes on the calling thread, which is the device's dedicated worker
//! thread. Each nonce costs one round-0 patch of the shared midstate plus
//! 23 full rounds; the absorb and first theta/rho/pi steps are never
//! repeated. In king-making mode the backend derives its own midstate from
//! the pushed message, so both modes run the same inner loop.
//!
//! Duty cycling sleeps after each batch in proportion to the time spent
//! hashing, keeping the long-run utilization near the configured percentage.

use std::time::{Duration, Instant};

use super::{
    meets_target_buffer, BackendCapabilities, BackendError, BackendKind, HashBackend,
    HashBatch, TargetBuffer,
};
use crate::midstate::{finish_with_nonce, mid_state_from_message, MidState};
use crate::tracing::prelude::*;
use crate::types::{HashRate, Message, MiningMode};
use crate::work::NonceRange;

/// Midstate plus the message word the nonce goes into.
#[derive(Debug, Clone, Copy)]
struct Input {
    mid_state: MidState,
    word: usize,
}

/// Buffers that exist between `initialize` and `release`.
#[derive(Debug)]
struct Buffers {
    max_candidates: usize,
    target: Option<TargetBuffer>,
    input: Option<Input>,
    solutions: Vec<u64>,
    solution_count: u32,
}

/// Backend hashing on one CPU thread.
pub struct CpuBackend {
    name: String,
    capabilities: BackendCapabilities,
    duty_percent: u8,
    buffers: Option<Buffers>,
}

impl CpuBackend {
    /// Create a CPU backend.
    ///
    /// `duty_percent` is clamped to 1..=100; 100 disables duty cycling.
    pub fn new(name: String, duty_percent: u8) -> Self {
        Self {
            name,
            capabilities: BackendCapabilities {
                kind: BackendKind::Cpu,
                model: "cpu".into(),
                compute_version: 0,
                // Conservative estimate for one core
                hashrate_estimate: HashRate::from_megahashes(1.0),
            },
            duty_percent: duty_percent.clamp(1, 100),
            buffers: None,
        }
    }

    fn buffers_mut(&mut self) -> Result<&mut Buffers, BackendError> {
        self.buffers.as_mut().ok_or(BackendError::NotInitialized)
    }

    fn idle_after(&self, busy: Duration) -> Duration {
        if self.duty_percent >= 100 {
            return Duration::ZERO;
        }
        let idle_percent = 100 - u32::from(self.duty_percent);
        busy * idle_percent / u32::from(self.duty_percent)
    }
}

impl HashBackend for CpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn initialize(&mut self, max_candidates: usize) -> Result<(), BackendError> {
        if max_candidates == 0 {
            return Err(BackendError::Initialization(
                "candidate buffer needs at least one slot".into(),
            ));
        }

        self.buffers = Some(Buffers {
            max_candidates,
            target: None,
            input: None,
            solutions: Vec::with_capacity(max_candidates),
            solution_count: 0,
        });
        trace!(backend = %self.name, max_candidates, "CPU backend initialized");
        Ok(())
    }

    fn push_target(&mut self, target: TargetBuffer) -> Result<(), BackendError> {
        self.buffers_mut()?.target = Some(target);
        Ok(())
    }

    fn push_mid_state(&mut self, mid_state: &MidState) -> Result<(), BackendError> {
        self.buffers_mut()?.input = Some(Input {
            mid_state: *mid_state,
            word: MiningMode::Normal.message_word(),
        });
        Ok(())
    }

    fn push_message(&mut self, message: &Message) -> Result<(), BackendError> {
        self.buffers_mut()?.input = Some(Input {
            mid_state: mid_state_from_message(message),
            word: MiningMode::KingMaking.message_word(),
        });
        Ok(())
    }

    fn hash_batch(&mut self, range: NonceRange) -> Result<HashBatch, BackendError> {
        let started = Instant::now();

        let buffers = self.buffers_mut()?;
        let target = buffers.target.ok_or(BackendError::MissingInput("target"))?;
        let input = buffers
            .input
            .ok_or(BackendError::MissingInput("midstate or message"))?;

        for nonce in range.iter() {
            let digest = finish_with_nonce(&input.mid_state, input.word, nonce);
            if meets_target_buffer(&digest, &target) {
                buffers.solution_count = buffers.solution_count.saturating_add(1);
                if buffers.solutions.len() < buffers.max_candidates {
                    buffers.solutions.push(nonce);
                }
            }
        }

        let batch = HashBatch {
            candidates: buffers.solutions.clone(),
            solution_count: buffers.solution_count,
        };

        let idle = self.idle_after(started.elapsed());
        if !idle.is_zero() {
            std::thread::sleep(idle);
        }

        Ok(batch)
    }

    fn reset_solution_count(&mut self) -> Result<(), BackendError> {
        let buffers = self.buffers_mut()?;
        buffers.solutions.clear();
        buffers.solution_count = 0;
        Ok(())
    }

    fn release(&mut self) -> Result<(), BackendError> {
        self.buffers = None;
        Ok(())
    }
}
