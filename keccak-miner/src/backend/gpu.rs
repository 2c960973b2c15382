//! GPU hash backend.
//!
//! The search kernels themselves are native code. [`GpuKernel`] is the
//! boundary to them: raw buffer uploads, a launch over a grid of blocks
//! starting at a work position, and a small solution buffer read back after
//! each launch. Native calls report failures as strings, which
//! [`GpuBackend`] wraps into [`BackendError`].
//!
//! [`GpuDriver`] enumerates the devices a native runtime can see. Builds
//! without a linked runtime use [`NoGpuDriver`], which sees none.

use super::{
    BackendCapabilities, BackendError, BackendKind, HashBackend, HashBatch, TargetBuffer,
};
use crate::device::geometry::{block_size, grid_size};
use crate::midstate::{MidState, MID_STATE_LENGTH};
use crate::tracing::prelude::*;
use crate::types::{HashRate, Message, MiningMode, MESSAGE_LENGTH};
use crate::work::NonceRange;

/// Result type used across the native boundary.
pub type NativeResult<T> = Result<T, String>;

/// One kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    pub mode: MiningMode,

    /// First nonce of the launch.
    pub work_position: u64,

    /// Nonces to hash; threads past this count do nothing.
    pub count: u64,

    pub grid: u64,
    pub block: u64,
}

/// Native GPU kernel bound to one device.
pub trait GpuKernel: Send {
    /// Model name as reported by the runtime.
    fn device_name(&self) -> &str;

    /// Compute version, `major * 100 + minor * 10`.
    fn compute_version(&self) -> u32;

    /// Allocate device buffers, including `max_solutions` solution slots.
    fn open(&mut self, max_solutions: usize) -> NativeResult<()>;

    fn upload_high64_target(&mut self, high64: u64) -> NativeResult<()>;
    fn upload_target(&mut self, target: &[u8; 32]) -> NativeResult<()>;
    fn upload_mid_state(&mut self, mid_state: &[u8; MID_STATE_LENGTH]) -> NativeResult<()>;
    fn upload_message(&mut self, message: &[u8; MESSAGE_LENGTH]) -> NativeResult<()>;

    /// Run one launch and wait for it to complete.
    fn launch(&mut self, launch: &Launch) -> NativeResult<()>;

    /// Copy the solution slots into `out` and return the device-side
    /// solution count, which may exceed the slots filled.
    fn read_solutions(&mut self, out: &mut Vec<u64>) -> NativeResult<u32>;

    /// Zero the device-side solution count and slots.
    fn clear_solutions(&mut self) -> NativeResult<()>;

    /// Free device buffers.
    fn close(&mut self) -> NativeResult<()>;
}

impl<K: GpuKernel + ?Sized> GpuKernel for Box<K> {
    fn device_name(&self) -> &str {
        (**self).device_name()
    }

    fn compute_version(&self) -> u32 {
        (**self).compute_version()
    }

    fn open(&mut self, max_solutions: usize) -> NativeResult<()> {
        (**self).open(max_solutions)
    }

    fn upload_high64_target(&mut self, high64: u64) -> NativeResult<()> {
        (**self).upload_high64_target(high64)
    }

    fn upload_target(&mut self, target: &[u8; 32]) -> NativeResult<()> {
        (**self).upload_target(target)
    }

    fn upload_mid_state(&mut self, mid_state: &[u8; MID_STATE_LENGTH]) -> NativeResult<()> {
        (**self).upload_mid_state(mid_state)
    }

    fn upload_message(&mut self, message: &[u8; MESSAGE_LENGTH]) -> NativeResult<()> {
        (**self).upload_message(message)
    }

    fn launch(&mut self, launch: &Launch) -> NativeResult<()> {
        (**self).launch(launch)
    }

    fn read_solutions(&mut self, out: &mut Vec<u64>) -> NativeResult<u32> {
        (**self).read_solutions(out)
    }

    fn clear_solutions(&mut self) -> NativeResult<()> {
        (**self).clear_solutions()
    }

    fn close(&mut self) -> NativeResult<()> {
        (**self).close()
    }
}

/// Enumerates native GPU devices.
pub trait GpuDriver {
    fn name(&self) -> &str;

    fn device_count(&self) -> NativeResult<usize>;

    /// Bind a kernel to device `index`.
    fn open_kernel(&self, index: usize) -> NativeResult<Box<dyn GpuKernel>>;
}

/// Driver used when no GPU runtime is linked.
#[derive(Debug, Default)]
pub struct NoGpuDriver;

impl GpuDriver for NoGpuDriver {
    fn name(&self) -> &str {
        "none"
    }

    fn device_count(&self) -> NativeResult<usize> {
        Ok(0)
    }

    fn open_kernel(&self, index: usize) -> NativeResult<Box<dyn GpuKernel>> {
        Err(format!("no GPU runtime available for device {}", index))
    }
}

/// Open a backend for every device the driver reports.
///
/// Devices whose kernel cannot be bound are logged and skipped.
pub fn discover(driver: &dyn GpuDriver) -> Vec<GpuBackend<Box<dyn GpuKernel>>> {
    let count = match driver.device_count() {
        Ok(count) => count,
        Err(e) => {
            error!(driver = driver.name(), error = %e, "Failed to enumerate GPUs");
            return Vec::new();
        }
    };

    (0..count)
        .filter_map(|index| match driver.open_kernel(index) {
            Ok(kernel) => Some(GpuBackend::new(format!("gpu-{}", index), kernel)),
            Err(e) => {
                error!(driver = driver.name(), index, error = %e, "Failed to open GPU");
                None
            }
        })
        .collect()
}

/// Inputs uploaded so far, tracked host-side to pick the launch mode.
#[derive(Debug, Default, Clone, Copy)]
struct Uploaded {
    target: bool,
    mode: Option<MiningMode>,
}

/// Backend driving one native GPU kernel.
pub struct GpuBackend<K: GpuKernel> {
    name: String,
    kernel: K,
    capabilities: BackendCapabilities,
    block: u64,
    solutions: Vec<u64>,
    uploaded: Uploaded,
    initialized: bool,
}

impl<K: GpuKernel> GpuBackend<K> {
    pub fn new(name: String, kernel: K) -> Self {
        let compute_version = kernel.compute_version();
        let capabilities = BackendCapabilities {
            kind: BackendKind::Gpu,
            model: kernel.device_name().to_string(),
            compute_version,
            hashrate_estimate: HashRate::from_megahashes(500.0),
        };

        Self {
            name,
            kernel,
            capabilities,
            block: block_size(compute_version),
            solutions: Vec::new(),
            uploaded: Uploaded::default(),
            initialized: false,
        }
    }

    fn ensure_initialized(&self) -> Result<(), BackendError> {
        if self.initialized {
            Ok(())
        } else {
            Err(BackendError::NotInitialized)
        }
    }
}

impl<K: GpuKernel> HashBackend for GpuBackend<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn initialize(&mut self, max_candidates: usize) -> Result<(), BackendError> {
        self.kernel
            .open(max_candidates)
            .map_err(BackendError::Initialization)?;

        self.solutions = Vec::with_capacity(max_candidates);
        self.uploaded = Uploaded::default();
        self.initialized = true;

        debug!(
            backend = %self.name,
            model = %self.capabilities.model,
            compute = self.capabilities.compute_version,
            block = self.block,
            "GPU backend initialized"
        );
        Ok(())
    }

    fn push_target(&mut self, target: TargetBuffer) -> Result<(), BackendError> {
        self.ensure_initialized()?;
        match target {
            TargetBuffer::High64(high64) => self.kernel.upload_high64_target(high64),
            TargetBuffer::Full(target) => self.kernel.upload_target(&target.as_u256().to_be_bytes()),
        }
        .map_err(BackendError::Buffer)?;
        self.uploaded.target = true;
        Ok(())
    }

    fn push_mid_state(&mut self, mid_state: &MidState) -> Result<(), BackendError> {
        self.ensure_initialized()?;
        self.kernel
            .upload_mid_state(&mid_state.to_bytes())
            .map_err(BackendError::Buffer)?;
        self.uploaded.mode = Some(MiningMode::Normal);
        Ok(())
    }

    fn push_message(&mut self, message: &Message) -> Result<(), BackendError> {
        self.ensure_initialized()?;
        self.kernel
            .upload_message(message.as_bytes())
            .map_err(BackendError::Buffer)?;
        self.uploaded.mode = Some(MiningMode::KingMaking);
        Ok(())
    }

    fn hash_batch(&mut self, range: NonceRange) -> Result<HashBatch, BackendError> {
        self.ensure_initialized()?;
        if !self.uploaded.target {
            return Err(BackendError::MissingInput("target"));
        }
        let mode = self
            .uploaded
            .mode
            .ok_or(BackendError::MissingInput("midstate or message"))?;

        if !range.is_empty() {
            let launch = Launch {
                mode,
                work_position: range.start,
                count: range.len,
                grid: grid_size(range.len, self.block),
                block: self.block,
            };
            self.kernel.launch(&launch).map_err(BackendError::Hashing)?;
        }

        self.solutions.clear();
        let solution_count = self
            .kernel
            .read_solutions(&mut self.solutions)
            .map_err(BackendError::Hashing)?;

        Ok(HashBatch {
            candidates: self.solutions.clone(),
            solution_count,
        })
    }

    fn reset_solution_count(&mut self) -> Result<(), BackendError> {
        self.ensure_initialized()?;
        self.kernel.clear_solutions().map_err(BackendError::Hashing)
    }

    fn release(&mut self) -> Result<(), BackendError> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        self.uploaded = Uploaded::default();
        self.kernel.close().map_err(BackendError::Release)
    }
}
