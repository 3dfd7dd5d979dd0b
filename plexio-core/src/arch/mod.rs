//! Core detection and worker thread placement.
//!
//! Event loop groups and the file I/O engine start their threads through a
//! [`ThreadBuilder`], which names them and optionally pins each one to a
//! core chosen round-robin from the detected [`CpuInfo`].

pub mod cpu_info;
pub mod thread_builder;

pub use cpu_info::CpuInfo;
pub use thread_builder::{PinningResult, ThreadBuilder, WorkerThread};

/// Detects the current machine's core counts.
pub fn detect_cpu_topology() -> CpuInfo {
    CpuInfo::detect()
}
