//! Hashrate measurement type.

use std::iter::Sum;
use std::ops::Add;
use std::time::Duration;

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Rate from a hash count over an elapsed window.
    ///
    /// An empty window yields zero rather than infinity.
    pub fn from_count(hashes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self(0);
        }
        Self((hashes as f64 / secs) as u64)
    }

    /// Create from megahashes per second
    pub fn from_megahashes(mh: f64) -> Self {
        Self((mh * 1_000_000.0) as u64)
    }

    /// Create from gigahashes per second
    pub fn from_gigahashes(gh: f64) -> Self {
        Self((gh * 1_000_000_000.0) as u64)
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Returns true if the hashrate is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.as_gigahashes())
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else if self.0 >= 1_000 {
            format!("{:.2} KH/s", self.0 as f64 / 1_000.0)
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl Add for HashRate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sum for HashRate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl std::fmt::Display for HashRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_conversions() {
        let rate = HashRate::from_gigahashes(1.5);
        assert_eq!(rate.as_megahashes(), 1_500.0);
        assert_eq!(rate.to_human_readable(), "1.50 GH/s");

        let rate = HashRate::from_megahashes(12.0);
        assert_eq!(rate.to_human_readable(), "12.00 MH/s");

        assert_eq!(HashRate(512).to_human_readable(), "512 H/s");
    }

    #[test]
    fn test_from_count() {
        let rate = HashRate::from_count(1_000_000, Duration::from_secs(2));
        assert_eq!(rate, HashRate(500_000));
        assert!(HashRate::from_count(100, Duration::ZERO).is_zero());
    }

    #[test]
    fn test_sum_of_devices() {
        let total: HashRate = [HashRate(10), HashRate(20), HashRate(0)].into_iter().sum();
        assert_eq!(total, HashRate(30));
    }
}
