//! Core selection for the poll thread.
//!
//! The poll thread spins or parks briefly and is latency-sensitive, so on a
//! machine with spare physical cores it is worth giving it one of its own.
//! Core 0 is avoided because it usually takes most device interrupts.

use core_affinity::CoreId;

use crate::config::Placement;

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT siblings).
    pub logical_cores: usize,
    pub physical_cores: usize,
    /// Core ids this process may be pinned to.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            available_cores,
        }
    }

    /// Highest available core that is not 0 and, on most systems, not an SMT
    /// sibling (siblings are enumerated after every physical core).
    #[must_use]
    pub fn poll_core(&self) -> Option<usize> {
        if self.physical_cores < 2 {
            return None;
        }
        self.available_cores
            .iter()
            .copied()
            .filter(|&id| id != 0 && id < self.physical_cores)
            .max()
    }
}

/// Turns a configured placement into a core id, if any.
#[must_use]
pub fn resolve(placement: Placement) -> Option<usize> {
    match placement {
        Placement::Unpinned => None,
        Placement::Auto => CpuTopology::detect().poll_core(),
        Placement::Core(id) => Some(id),
    }
}

/// Pins the calling thread. Returns `false` if the OS refused.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();
        assert!(topo.logical_cores > 0);
        assert!(topo.physical_cores > 0);
        assert!(topo.logical_cores >= topo.physical_cores);
        assert!(!topo.available_cores.is_empty());
    }

    #[test]
    fn poll_core_avoids_core_zero_and_siblings() {
        let topo = CpuTopology {
            logical_cores: 8,
            physical_cores: 4,
            available_cores: (0..8).collect(),
        };
        assert_eq!(topo.poll_core(), Some(3));
    }

    #[test]
    fn single_core_is_left_alone() {
        let topo = CpuTopology {
            logical_cores: 2,
            physical_cores: 1,
            available_cores: vec![0, 1],
        };
        assert_eq!(topo.poll_core(), None);
    }

    #[test]
    fn auto_resolves_to_an_available_core() {
        let topo = CpuTopology::detect();
        if let Some(core) = resolve(Placement::Auto) {
            assert!(topo.available_cores.contains(&core));
        }
    }

    #[test]
    fn explicit_placements_resolve_as_given() {
        assert_eq!(resolve(Placement::Unpinned), None);
        assert_eq!(resolve(Placement::Core(5)), Some(5));
    }
}
