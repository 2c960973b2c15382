//! Throughput geometry derived from intensity.
//!
//! Intensity is the base-2 logarithm of the number of nonces one batch
//! covers. GPU backends additionally split a batch into a launch grid of
//! fixed-size blocks whose size depends on the compute version.

use crate::backend::BackendKind;
use crate::types::MiningMode;

/// Intensity used when nothing better is known.
pub const DEFAULT_INTENSITY: f64 = 14.0;

/// Upper intensity bound for GPUs with compute version 500 or older.
pub const LEGACY_GPU_MAX_INTENSITY: f64 = 40.55;

/// Upper intensity bound for CPU devices.
pub const CPU_MAX_INTENSITY: f64 = 40.0;

/// Upper bound for everything else; `2^63` still fits a u64 batch size.
pub const MAX_INTENSITY: f64 = 63.0;

/// Batch size and launch shape of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Intensity after clamping.
    pub intensity: f64,

    /// Nonces per batch, `2^intensity`.
    pub threads: u64,

    /// Threads per block.
    pub block: u64,

    /// Blocks per launch, `ceil(threads / block)`.
    pub grid: u64,
}

impl Geometry {
    /// Geometry for a device of `kind`.
    ///
    /// `compute_version` is `major * 100 + minor * 10` for GPUs and ignored
    /// for CPUs.
    pub fn new(kind: BackendKind, intensity: f64, compute_version: u32) -> Self {
        let max = match kind {
            BackendKind::Cpu => CPU_MAX_INTENSITY,
            BackendKind::Gpu if compute_version <= 500 => LEGACY_GPU_MAX_INTENSITY,
            BackendKind::Gpu => MAX_INTENSITY,
        };
        let intensity = intensity.clamp(1.0, max);
        let threads = 2f64.powf(intensity) as u64;

        let block = match kind {
            BackendKind::Cpu => threads,
            BackendKind::Gpu => block_size(compute_version),
        };

        Self {
            intensity,
            threads,
            block,
            grid: grid_size(threads, block),
        }
    }
}

/// Threads per block for a GPU compute version.
pub fn block_size(compute_version: u32) -> u64 {
    match compute_version {
        520 | 610 | 700 | 720 | 750 => 1024,
        v if v >= 800 => 1024,
        _ => 384,
    }
}

/// Blocks needed to cover `threads`.
pub fn grid_size(threads: u64, block: u64) -> u64 {
    if block == 0 {
        return 0;
    }
    threads.div_ceil(block)
}

type IntensityTable = &'static [(&'static [&'static str], f64)];

const NORMAL_DEFAULTS: IntensityTable = &[
    (&["2080", "2070 TI", "2070TI", "1080 TI", "1080TI"], 27.00),
    (&["1080", "2070", "1070 TI", "1070TI"], 26.33),
    (&["2060", "1070", "980"], 26.00),
    (&["2050", "1060", "970"], 25.50),
    (&["1050", "960"], 25.00),
];

const KING_MAKING_DEFAULTS: IntensityTable = &[
    (&["2080", "2070", "1080"], 27.54),
    (&["2060", "1070 TI", "1070TI"], 27.46),
    (&["2050", "1070", "980"], 27.01),
    (&["1060", "970"], 26.01),
    (&["1050", "960"], 25.01),
];

/// Default intensity for a GPU model when none is configured.
///
/// Older GPUs (compute version below 500) always get [`DEFAULT_INTENSITY`].
/// Newer ones are matched by model-name substring, first hit wins.
pub fn default_gpu_intensity(model: &str, compute_version: u32, mode: MiningMode) -> f64 {
    if compute_version < 500 {
        return DEFAULT_INTENSITY;
    }

    let table = match mode {
        MiningMode::KingMaking => KING_MAKING_DEFAULTS,
        MiningMode::Normal => NORMAL_DEFAULTS,
    };

    table
        .iter()
        .find(|(models, _)| models.iter().any(|m| model.contains(m)))
        .map(|(_, intensity)| *intensity)
        .unwrap_or(DEFAULT_INTENSITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_from_intensity() {
        let g = Geometry::new(BackendKind::Gpu, 20.0, 610);
        assert_eq!(g.threads, 1 << 20);
        assert_eq!(g.block, 1024);
        assert_eq!(g.grid, 1024);
    }

    #[test]
    fn test_block_size_by_compute_version() {
        for v in [520, 610, 700, 720, 750, 800, 860, 890] {
            assert_eq!(block_size(v), 1024, "compute {}", v);
        }
        for v in [300, 350, 500, 530, 600, 620] {
            assert_eq!(block_size(v), 384, "compute {}", v);
        }
    }

    #[test]
    fn test_grid_rounds_up() {
        let g = Geometry::new(BackendKind::Gpu, 10.0, 600);
        assert_eq!(g.threads, 1024);
        assert_eq!(g.block, 384);
        assert_eq!(g.grid, 3);
    }

    #[test]
    fn test_intensity_clamps() {
        let legacy = Geometry::new(BackendKind::Gpu, 50.0, 500);
        assert_eq!(legacy.intensity, LEGACY_GPU_MAX_INTENSITY);

        let modern = Geometry::new(BackendKind::Gpu, 70.0, 860);
        assert_eq!(modern.intensity, MAX_INTENSITY);
        assert_eq!(modern.threads, 1 << 63);

        let cpu = Geometry::new(BackendKind::Cpu, 45.0, 0);
        assert_eq!(cpu.intensity, CPU_MAX_INTENSITY);
        assert_eq!(cpu.grid, 1);

        let tiny = Geometry::new(BackendKind::Cpu, 0.0, 0);
        assert_eq!(tiny.threads, 2);
    }

    #[test]
    fn test_fractional_intensity() {
        let g = Geometry::new(BackendKind::Gpu, 27.54, 750);
        assert_eq!(g.threads, 2f64.powf(27.54) as u64);
        assert!(g.threads > 1 << 27 && g.threads < 1 << 28);
    }

    #[test]
    fn test_default_gpu_intensity() {
        let normal = MiningMode::Normal;
        let king = MiningMode::KingMaking;

        assert_eq!(default_gpu_intensity("GeForce RTX 2080", 750, normal), 27.00);
        assert_eq!(default_gpu_intensity("GeForce GTX 1080", 610, normal), 26.33);
        assert_eq!(default_gpu_intensity("GeForce GTX 1080 TI", 610, normal), 27.00);
        assert_eq!(default_gpu_intensity("GeForce GTX 1060", 610, normal), 25.50);
        assert_eq!(default_gpu_intensity("GeForce GTX 960", 520, normal), 25.00);

        assert_eq!(default_gpu_intensity("GeForce GTX 1080", 610, king), 27.54);
        assert_eq!(default_gpu_intensity("GeForce GTX 1070 TI", 610, king), 27.46);
        assert_eq!(default_gpu_intensity("GeForce GTX 1070", 610, king), 27.01);

        assert_eq!(default_gpu_intensity("Tesla K80", 370, normal), DEFAULT_INTENSITY);
        assert_eq!(default_gpu_intensity("Unknown", 860, normal), DEFAULT_INTENSITY);
    }
}
