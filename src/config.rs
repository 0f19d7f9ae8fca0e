//! Kernel configuration.
//!
//! Table sizes and scheduling constants the original kernel baked in as
//! preprocessor constants (`MAX_PROC`, `SCHED_MAX_LEVEL`, ...) are collected
//! here as runtime configuration, with [`KernelConfig::default`] matching
//! the original's values.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of simulated CPU cores.
    pub max_cores: usize,
    /// Size of the process table.
    pub max_proc: usize,
    /// Highest legal port number (ports run `1..=max_port`; 0 is `NOPORT`).
    pub max_port: u16,
    /// Size of a process's file-id table.
    pub max_fileid: usize,
    /// Capacity, in bytes, of a pipe's ring buffer.
    pub pipe_buffer_size: usize,
    /// Number of scheduler priority levels (0 is highest priority).
    pub sched_max_level: usize,
    /// Threads allowed to run from the current level before the scheduler
    /// is forced to also consider lower-priority levels, preventing
    /// starvation.
    pub sched_max_scheduled: u32,
    /// Length, in ticks, of a scheduling quantum.
    pub quantum_ticks: u64,
    /// Wall-clock period of one simulated tick.
    pub tick_period: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_cores: 2,
            max_proc: 128,
            max_port: 1023,
            max_fileid: 16,
            pipe_buffer_size: 8192,
            sched_max_level: 3,
            sched_max_scheduled: 3,
            quantum_ticks: 10,
            tick_period: Duration::from_millis(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.pipe_buffer_size, 8192);
        assert_eq!(cfg.sched_max_level, 3);
        assert_eq!(cfg.sched_max_scheduled, 3);
    }
}
