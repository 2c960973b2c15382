//! Per-device worker loop.
//!
//! Each device hashes on its own named OS thread, so a slow or blocking
//! backend never stalls the async runtime or its sibling devices. The loop
//! talks to the rest of the process only through shared state:
//!
//! - the [`Device`] record for stop, pause and hash counting,
//! - a [`Subscription`] for challenge and target updates,
//! - the shared [`WorkAllocator`] for nonce ranges,
//! - a [`CandidateSender`] into the solution pipeline.
//!
//! Every wait is a bounded poll, so stop requests are honoured within one
//! batch or one poll interval.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::{BackendError, HashBackend, TargetBuffer};
use crate::device::snapshot::{ChallengeSnapshot, Subscription, TargetSnapshot};
use crate::device::Device;
use crate::pipeline::{Candidate, CandidateSender, PipelineError};
use crate::tracing::prelude::*;
use crate::types::MiningMode;
use crate::work::{WorkAllocator, WorkError};

/// Delay between checks while paused or waiting for parameters.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Start the worker loop for `device` on a dedicated thread.
    ///
    /// The backend must already be initialized. It is released when the
    /// loop exits.
    pub fn spawn(
        device: Arc<Device>,
        backend: Box<dyn HashBackend>,
        allocator: Arc<WorkAllocator>,
        params: Subscription,
        candidates: CandidateSender,
    ) -> std::io::Result<Self> {
        let name = device.name().to_string();
        let worker = Worker {
            device,
            backend,
            allocator,
            params,
            candidates,
            current: None,
        };

        let thread = thread::Builder::new()
            .name(format!("miner-{}", name))
            .spawn(move || worker.run())?;

        Ok(Self { name, thread })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to exit.
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!(device = %self.name, "Worker thread panicked");
        }
    }
}

/// Why the mining loop ended.
#[derive(Debug)]
enum Exit {
    Stopped,
    Backend(BackendError),
    Work(WorkError),
    Pipeline(PipelineError),
}

struct Worker {
    device: Arc<Device>,
    backend: Box<dyn HashBackend>,
    allocator: Arc<WorkAllocator>,
    params: Subscription,
    candidates: CandidateSender,

    /// Challenge the backend buffers currently hold.
    current: Option<Arc<ChallengeSnapshot>>,
}

impl Worker {
    fn run(mut self) {
        let name = self.device.name().to_string();

        if self.wait_for_parameters() {
            match self.device.start_mining() {
                Ok(()) => {
                    info!(
                        device = %name,
                        backend = self.backend.name(),
                        threads = self.device.threads(),
                        "Mining started"
                    );
                    match self.mine() {
                        Exit::Stopped => debug!(device = %name, "Mining stopped"),
                        Exit::Backend(e) => {
                            error!(device = %name, error = %e, "Backend error, stopping device")
                        }
                        Exit::Work(e) => error!(device = %name, error = %e, "Nonce allocation failed"),
                        Exit::Pipeline(e) => {
                            error!(device = %name, error = %e, "Cannot forward candidates")
                        }
                    }
                }
                Err(e) => error!(device = %name, error = %e, "Cannot start mining"),
            }
        }

        if let Err(e) = self.backend.release() {
            error!(device = %name, error = %e, "Failed to release backend");
        }
        self.device.mark_stopped();
        debug!(device = %name, "Worker exited");
    }

    /// Block until a challenge and a target are known. Returns false if
    /// stopped first.
    fn wait_for_parameters(&self) -> bool {
        loop {
            if self.device.stop_requested() {
                return false;
            }
            if self.params.is_ready() {
                return true;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn mine(&mut self) -> Exit {
        let mut exhausted = false;

        loop {
            if self.device.stop_requested() {
                return Exit::Stopped;
            }

            if self.device.is_paused() {
                self.device.reset_counter();
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            match self.push_updates() {
                Ok(true) => exhausted = false,
                Ok(false) => {}
                Err(e) => return Exit::Backend(e),
            }

            let Some(snapshot) = self.current.clone() else {
                thread::sleep(POLL_INTERVAL);
                continue;
            };

            let range = match self.allocator.acquire_range(self.device.threads()) {
                Ok(range) => range,
                Err(e) => return Exit::Work(e),
            };
            if range.is_empty() {
                if !exhausted {
                    debug!(device = %self.device.name(), "No nonces left, waiting for next challenge");
                    exhausted = true;
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            let batch = match self.backend.hash_batch(range) {
                Ok(batch) => batch,
                Err(e) => return Exit::Backend(e),
            };
            self.device.record_hashes(range.len);

            if batch.solution_count == 0 && batch.candidates.is_empty() {
                continue;
            }

            trace!(
                device = %self.device.name(),
                count = batch.solution_count,
                "Batch reported solutions"
            );
            for nonce in batch.candidates {
                let candidate = Candidate {
                    nonce,
                    device: self.device.name().to_string(),
                    snapshot: Arc::clone(&snapshot),
                };
                if let Err(e) = self.candidates.blocking_submit(candidate) {
                    return Exit::Pipeline(e);
                }
            }
            if let Err(e) = self.backend.reset_solution_count() {
                return Exit::Backend(e);
            }
        }
    }

    /// Push a new target or challenge into the backend. Returns whether the
    /// challenge changed.
    fn push_updates(&mut self) -> Result<bool, BackendError> {
        let mode = self.device.mode();
        let mut challenge_changed = false;

        if self.params.has_new_target() {
            if let Some(target) = self.params.take_target() {
                self.backend.push_target(target_buffer(mode, &target))?;
                self.device.reset_counter();
                debug!(device = %self.device.name(), target = %target.target, "Target updated");
            }
        }

        if self.params.has_new_challenge() {
            if let Some(snapshot) = self.params.take_challenge() {
                match mode {
                    MiningMode::Normal => self.backend.push_mid_state(&snapshot.mid_state)?,
                    MiningMode::KingMaking => self.backend.push_message(&snapshot.message)?,
                }
                self.device.reset_counter();
                debug!(
                    device = %self.device.name(),
                    challenge = %snapshot.challenge,
                    generation = snapshot.generation,
                    "Challenge updated"
                );
                self.current = Some(snapshot);
                challenge_changed = true;
            }
        }

        Ok(challenge_changed)
    }
}

fn target_buffer(mode: MiningMode, target: &TargetSnapshot) -> TargetBuffer {
    match mode {
        MiningMode::Normal => TargetBuffer::High64(target.high64),
        MiningMode::KingMaking => TargetBuffer::Full(target.target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockBackend};
    use crate::device::snapshot::SnapshotPublisher;
    use crate::device::DeviceState;
    use crate::pipeline::candidate_queue;
    use crate::types::{Address, Challenge, SolutionTemplate, Target};
    use crate::u256::U256;
    use std::sync::Mutex;
    use std::time::Instant;

    fn device(mode: MiningMode) -> Arc<Device> {
        let backend = MockBackend::new("mock");
        let mut device = Device::new("cpu-0".into(), backend.capabilities().clone(), Some(4.0));
        device.assign(mode).unwrap();
        device.mark_initialized().unwrap();
        Arc::new(device)
    }

    fn publish(publisher: &mut SnapshotPublisher, byte: u8, mode: MiningMode) {
        let king = Address([0x22; 20]);
        let template = match mode {
            MiningMode::Normal => SolutionTemplate::generate(None),
            MiningMode::KingMaking => SolutionTemplate::generate(Some(&king)),
        };
        publisher.publish_challenge(Challenge([byte; 32]), Address([0x11; 20]), template, mode);
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn count(calls: &Arc<Mutex<Vec<Call>>>, pred: impl Fn(&Call) -> bool) -> usize {
        calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    #[test]
    fn test_forwards_candidates_with_their_snapshot() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::Normal);
        publisher.publish_target(Target::new(U256::MAX / 1000));

        let backend = MockBackend::new("mock").then_candidates(&[5, 9]);
        let calls = backend.calls();
        let device = device(MiningMode::Normal);
        let allocator = Arc::new(WorkAllocator::new());
        let (sender, mut rx) = candidate_queue(8);

        let worker = WorkerHandle::spawn(
            Arc::clone(&device),
            Box::new(backend),
            Arc::clone(&allocator),
            publisher.subscribe(),
            sender,
        )
        .unwrap();

        let first = rx.blocking_recv().unwrap();
        let second = rx.blocking_recv().unwrap();
        assert_eq!((first.nonce, second.nonce), (5, 9));
        assert_eq!(first.device, "cpu-0");
        assert_eq!(first.challenge(), &Challenge([1; 32]));
        assert_eq!(first.snapshot.generation, 1);

        device.request_stop();
        worker.join();
        assert_eq!(device.state(), DeviceState::Stopped);

        let calls = calls.lock().unwrap();
        let high64 = (U256::MAX / 1000).high64();
        assert_eq!(calls[0], Call::PushTarget(TargetBuffer::High64(high64)));
        assert_eq!(calls[1], Call::PushMidState);
        assert_eq!(
            calls[2],
            Call::HashBatch(crate::work::NonceRange { start: 0, len: 16 })
        );
        assert_eq!(calls[3], Call::ResetSolutionCount);
        assert_eq!(calls.last(), Some(&Call::Release));
    }

    #[test]
    fn test_ranges_follow_allocator() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::Normal);
        publisher.publish_target(Target::MAX);

        let backend = MockBackend::new("mock");
        let calls = backend.calls();
        let device = device(MiningMode::Normal);
        let allocator = Arc::new(WorkAllocator::new());
        let (sender, _rx) = candidate_queue(8);

        let worker = WorkerHandle::spawn(
            Arc::clone(&device),
            Box::new(backend),
            Arc::clone(&allocator),
            publisher.subscribe(),
            sender,
        )
        .unwrap();

        wait_until(|| count(&calls, |c| matches!(c, Call::HashBatch(_))) >= 3);
        device.request_stop();
        worker.join();

        let starts: Vec<u64> = calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::HashBatch(range) => Some(range.start),
                _ => None,
            })
            .collect();
        for (i, start) in starts.iter().enumerate() {
            assert_eq!(*start, i as u64 * 16);
        }
        assert_eq!(allocator.peek().unwrap(), starts.len() as u64 * 16);
    }

    #[test]
    fn test_paused_device_consumes_no_ranges() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::Normal);
        publisher.publish_target(Target::MAX);

        let backend = MockBackend::new("mock");
        let calls = backend.calls();
        let device = device(MiningMode::Normal);
        device.pause();
        let allocator = Arc::new(WorkAllocator::new());
        let (sender, _rx) = candidate_queue(8);

        let worker = WorkerHandle::spawn(
            Arc::clone(&device),
            Box::new(backend),
            Arc::clone(&allocator),
            publisher.subscribe(),
            sender,
        )
        .unwrap();

        wait_until(|| device.state() == DeviceState::Paused);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(allocator.peek().unwrap(), 0);
        assert_eq!(count(&calls, |c| matches!(c, Call::HashBatch(_))), 0);
        assert!(device.hashrate().is_zero());

        device.resume();
        wait_until(|| allocator.peek().unwrap() > 0);

        device.request_stop();
        worker.join();
    }

    #[test]
    fn test_backend_error_stops_only_this_device() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::Normal);
        publisher.publish_target(Target::MAX);
        let allocator = Arc::new(WorkAllocator::new());

        let failing = MockBackend::new("bad").then_error(BackendError::Hashing("ECC".into()));
        let failing_calls = failing.calls();
        let failing_device = device(MiningMode::Normal);
        let healthy = MockBackend::new("good");
        let healthy_calls = healthy.calls();
        let healthy_device = device(MiningMode::Normal);
        let (sender, _rx) = candidate_queue(8);

        let bad = WorkerHandle::spawn(
            Arc::clone(&failing_device),
            Box::new(failing),
            Arc::clone(&allocator),
            publisher.subscribe(),
            sender.clone(),
        )
        .unwrap();
        let good = WorkerHandle::spawn(
            Arc::clone(&healthy_device),
            Box::new(healthy),
            Arc::clone(&allocator),
            publisher.subscribe(),
            sender,
        )
        .unwrap();

        bad.join();
        assert_eq!(failing_device.state(), DeviceState::Stopped);
        assert_eq!(failing_calls.lock().unwrap().last(), Some(&Call::Release));

        let before = count(&healthy_calls, |c| matches!(c, Call::HashBatch(_)));
        wait_until(|| count(&healthy_calls, |c| matches!(c, Call::HashBatch(_))) > before);
        assert_eq!(healthy_device.state(), DeviceState::Mining);

        healthy_device.request_stop();
        good.join();
    }

    #[test]
    fn test_new_challenge_pushed_once_per_publication() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::Normal);
        publisher.publish_target(Target::MAX);

        let backend = MockBackend::new("mock");
        let calls = backend.calls();
        let device = device(MiningMode::Normal);
        let (sender, _rx) = candidate_queue(8);

        let worker = WorkerHandle::spawn(
            Arc::clone(&device),
            Box::new(backend),
            Arc::new(WorkAllocator::new()),
            publisher.subscribe(),
            sender,
        )
        .unwrap();

        wait_until(|| count(&calls, |c| matches!(c, Call::HashBatch(_))) >= 1);
        publish(&mut publisher, 2, MiningMode::Normal);
        wait_until(|| count(&calls, |c| *c == Call::PushMidState) == 2);

        // Let a few more batches run; no extra pushes happen.
        let batches = count(&calls, |c| matches!(c, Call::HashBatch(_)));
        wait_until(|| count(&calls, |c| matches!(c, Call::HashBatch(_))) >= batches + 3);
        assert_eq!(count(&calls, |c| *c == Call::PushMidState), 2);
        assert_eq!(count(&calls, |c| matches!(c, Call::PushTarget(_))), 1);

        device.request_stop();
        worker.join();
    }

    #[test]
    fn test_king_mode_pushes_message_and_full_target() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::KingMaking);
        let target = Target::new(U256::MAX / 7);
        publisher.publish_target(target);

        let backend = MockBackend::new("mock");
        let calls = backend.calls();
        let device = device(MiningMode::KingMaking);
        let (sender, _rx) = candidate_queue(8);

        let worker = WorkerHandle::spawn(
            Arc::clone(&device),
            Box::new(backend),
            Arc::new(WorkAllocator::new()),
            publisher.subscribe(),
            sender,
        )
        .unwrap();

        wait_until(|| count(&calls, |c| matches!(c, Call::HashBatch(_))) >= 1);
        device.request_stop();
        worker.join();

        let calls = calls.lock().unwrap();
        assert!(calls.contains(&Call::PushTarget(TargetBuffer::Full(target))));
        assert!(calls.contains(&Call::PushMessage));
        assert!(!calls.contains(&Call::PushMidState));
    }

    #[test]
    fn test_stop_while_waiting_for_parameters() {
        let publisher = SnapshotPublisher::new();
        let backend = MockBackend::new("mock");
        let calls = backend.calls();
        let device = device(MiningMode::Normal);
        let (sender, _rx) = candidate_queue(8);

        let worker = WorkerHandle::spawn(
            Arc::clone(&device),
            Box::new(backend),
            Arc::new(WorkAllocator::new()),
            publisher.subscribe(),
            sender,
        )
        .unwrap();
        assert_eq!(worker.name(), "cpu-0");

        device.request_stop();
        worker.join();

        assert_eq!(*calls.lock().unwrap(), vec![Call::Release]);
        assert_eq!(device.state(), DeviceState::Stopped);
    }

    #[test]
    fn test_exhausted_nonce_space_idles() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::Normal);
        publisher.publish_target(Target::MAX);

        let allocator = Arc::new(WorkAllocator::new());
        allocator.acquire_range(u64::MAX).unwrap();

        let backend = MockBackend::new("mock");
        let calls = backend.calls();
        let device = device(MiningMode::Normal);
        let (sender, _rx) = candidate_queue(8);

        let worker = WorkerHandle::spawn(
            Arc::clone(&device),
            Box::new(backend),
            Arc::clone(&allocator),
            publisher.subscribe(),
            sender,
        )
        .unwrap();

        wait_until(|| device.state() == DeviceState::Mining);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count(&calls, |c| matches!(c, Call::HashBatch(_))), 0);

        allocator.reset().unwrap();
        wait_until(|| count(&calls, |c| matches!(c, Call::HashBatch(_))) >= 1);

        device.request_stop();
        worker.join();
    }

    #[test]
    fn test_closed_candidate_queue_ends_loop_with_pipeline_error() {
        let mut publisher = SnapshotPublisher::new();
        publish(&mut publisher, 1, MiningMode::Normal);
        publisher.publish_target(Target::MAX);

        let backend = MockBackend::new("mock").then_candidates(&[3]);
        let calls = backend.calls();
        let (sender, rx) = candidate_queue(1);
        drop(rx);

        let device = device(MiningMode::Normal);
        device.start_mining().unwrap();
        let mut worker = Worker {
            device: Arc::clone(&device),
            backend: Box::new(backend),
            allocator: Arc::new(WorkAllocator::new()),
            params: publisher.subscribe(),
            candidates: sender,
            current: None,
        };

        assert!(matches!(
            worker.mine(),
            Exit::Pipeline(PipelineError::QueueClosed)
        ));
        assert_eq!(count(&calls, |c| *c == Call::ResetSolutionCount), 0);
    }
}
