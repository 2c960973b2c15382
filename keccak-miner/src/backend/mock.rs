//! Scripted backend for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    BackendCapabilities, BackendError, BackendKind, HashBackend, HashBatch, TargetBuffer,
};
use crate::midstate::MidState;
use crate::types::{HashRate, Message};
use crate::work::NonceRange;

/// Calls recorded by [`MockBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Initialize(usize),
    PushTarget(TargetBuffer),
    PushMidState,
    PushMessage,
    HashBatch(NonceRange),
    ResetSolutionCount,
    Release,
}

/// Backend returning scripted batches.
///
/// Each `hash_batch` pops the next scripted result; once the script is
/// empty it returns empty batches.
pub struct MockBackend {
    name: String,
    capabilities: BackendCapabilities,
    script: VecDeque<Result<HashBatch, BackendError>>,
    fail_initialize: Option<BackendError>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: BackendCapabilities {
                kind: BackendKind::Cpu,
                model: "mock".into(),
                compute_version: 0,
                hashrate_estimate: HashRate::default(),
            },
            script: VecDeque::new(),
            fail_initialize: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_kind(mut self, kind: BackendKind, model: &str, compute_version: u32) -> Self {
        self.capabilities.kind = kind;
        self.capabilities.model = model.to_string();
        self.capabilities.compute_version = compute_version;
        self
    }

    /// Queue a batch reporting `candidates`.
    pub fn then_candidates(mut self, candidates: &[u64]) -> Self {
        self.script.push_back(Ok(HashBatch {
            candidates: candidates.to_vec(),
            solution_count: candidates.len() as u32,
        }));
        self
    }

    pub fn then_error(mut self, error: BackendError) -> Self {
        self.script.push_back(Err(error));
        self
    }

    pub fn failing_initialize(mut self, error: BackendError) -> Self {
        self.fail_initialize = Some(error);
        self
    }

    /// Shared view of the calls made so far.
    pub fn calls(&self) -> Arc<Mutex<Vec<Call>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl HashBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn initialize(&mut self, max_candidates: usize) -> Result<(), BackendError> {
        self.record(Call::Initialize(max_candidates));
        match self.fail_initialize.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn push_target(&mut self, target: TargetBuffer) -> Result<(), BackendError> {
        self.record(Call::PushTarget(target));
        Ok(())
    }

    fn push_mid_state(&mut self, _mid_state: &MidState) -> Result<(), BackendError> {
        self.record(Call::PushMidState);
        Ok(())
    }

    fn push_message(&mut self, _message: &Message) -> Result<(), BackendError> {
        self.record(Call::PushMessage);
        Ok(())
    }

    fn hash_batch(&mut self, range: NonceRange) -> Result<HashBatch, BackendError> {
        self.record(Call::HashBatch(range));
        match self.script.pop_front() {
            Some(result) => result,
            None => {
                // Keep idle workers from flooding the call log.
                std::thread::sleep(Duration::from_millis(1));
                Ok(HashBatch::default())
            }
        }
    }

    fn reset_solution_count(&mut self) -> Result<(), BackendError> {
        self.record(Call::ResetSolutionCount);
        Ok(())
    }

    fn release(&mut self) -> Result<(), BackendError> {
        self.record(Call::Release);
        Ok(())
    }
}
