//! Cache byte budget derived from system memory.
//!
//! `budget = (available - reserve) * fraction`, never below [`MIN_BUDGET`].

use log::info;
use sysinfo::System;

/// Smallest budget handed to the frame cache
pub const MIN_BUDGET: usize = 64 * 1024 * 1024;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Compute a budget from available memory.
///
/// # Arguments
///
/// * `mem_fraction` - Fraction of available memory (clamped to 0.0-1.0)
/// * `reserve_gb` - Memory left for the system (GB)
///
/// # Example
///
/// ```rust,no_run
/// # use seqplay::core::budget::from_system;
/// let budget = from_system(0.75, 2.0); // 75% of available, reserve 2GB
/// ```
pub fn from_system(mem_fraction: f64, reserve_gb: f64) -> usize {
    let mut sys = System::new();
    sys.refresh_memory();
    let available = sys.available_memory() as usize;
    let budget = compute(available, mem_fraction, reserve_gb);

    info!(
        "Cache budget: available={} MB, reserve={} MB, limit={} MB ({}%)",
        available / 1024 / 1024,
        (reserve_gb.max(0.0) * GB) as usize / 1024 / 1024,
        budget / 1024 / 1024,
        (mem_fraction.clamp(0.0, 1.0) * 100.0) as u32
    );
    budget
}

/// Pure part of [`from_system`], split out for tests.
pub fn compute(available: usize, mem_fraction: f64, reserve_gb: f64) -> usize {
    let reserve = (reserve_gb.max(0.0) * GB) as usize;
    let usable = available.saturating_sub(reserve);
    let budget = (usable as f64 * mem_fraction.clamp(0.0, 1.0)) as usize;
    budget.max(MIN_BUDGET)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: usize = 1024 * 1024 * 1024;

    #[test]
    fn test_compute_fraction_after_reserve() {
        assert_eq!(compute(10 * GIB, 0.5, 2.0), 4 * GIB);
    }

    #[test]
    fn test_compute_floor() {
        assert_eq!(compute(GIB, 0.75, 2.0), MIN_BUDGET);
        assert_eq!(compute(10 * GIB, 0.0, 0.0), MIN_BUDGET);
    }

    #[test]
    fn test_compute_clamps_inputs() {
        assert_eq!(compute(4 * GIB, 3.0, -1.0), 4 * GIB);
    }

    #[test]
    fn test_from_system_nonzero() {
        assert!(from_system(0.5, 1.0) >= MIN_BUDGET);
    }
}
