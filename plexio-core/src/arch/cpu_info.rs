//! Core counts used to size and place event loop threads.

use std::fmt;

/// Logical and physical core counts of the machine.
#[derive(Clone, PartialEq, Eq)]
pub struct CpuInfo {
    /// Logical cores (hardware threads); at least 1
    logical_cores: usize,
    /// Physical cores, when the platform reports them
    physical_cores: Option<usize>,
}

impl fmt::Debug for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuInfo")
            .field("logical_cores", &self.logical_cores)
            .field("physical_cores", &self.physical_cores)
            .finish()
    }
}

impl CpuInfo {
    /// Reads the core counts of the current machine.
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get().max(1);
        let physical_cores = match num_cpus::get_physical() {
            0 => None,
            count => Some(count),
        };

        tracing::debug!(
            "Detected {} logical core(s), {:?} physical",
            logical_cores,
            physical_cores
        );
        Self {
            logical_cores,
            physical_cores,
        }
    }

    /// A fixed topology with `logical_cores` cores, for tests.
    pub fn mock(logical_cores: usize) -> Self {
        Self {
            logical_cores: logical_cores.max(1),
            physical_cores: Some(logical_cores.max(1)),
        }
    }

    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    pub fn physical_cores(&self) -> Option<usize> {
        self.physical_cores
    }

    /// The core the `index`th worker should run on. Workers are spread
    /// round-robin over the logical cores.
    pub fn core_for_worker(&self, index: usize) -> usize {
        index % self.logical_cores
    }
}
