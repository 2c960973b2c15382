//! Keccak-256 proof-of-work miner.
//!
//! The [`orchestrator`] owns every compute device and turns upstream
//! announcements into challenge and target snapshots. Each device hashes on
//! its own [`worker`] thread through a [`backend::HashBackend`], drawing
//! disjoint nonce ranges from the shared [`work::WorkAllocator`]. Candidates
//! flow into the [`pipeline`], which re-verifies them with a trusted
//! Keccak-256 and submits them to the [`upstream`] feed.

pub mod backend;
pub mod config;
pub mod daemon;
pub mod device;
pub mod keccak;
pub mod midstate;
pub mod orchestrator;
pub mod pipeline;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod upstream;
pub mod work;
pub mod worker;
