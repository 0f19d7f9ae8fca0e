//! `tinykernel-core`: the scheduler, process/thread lifecycle, pipe, and
//! stream-socket subsystems of a small teaching operating-system kernel,
//! packaged as a standalone, host-runnable crate.
//!
//! There is no bootloader and no bare-metal target here: every simulated
//! CPU core is a native OS thread, and [`bios`] stands in for the timer,
//! halt/restart, and context-switch services a real BIOS would supply.
//! [`kernel::Kernel`] is the single explicit context object that replaces
//! the original's global mutable tables (`PT[]`, `PORT_MAP[]`, `SCHED[]`);
//! every operation a user-mode system call would have dispatched to is a
//! method on it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tinykernel_core::config::KernelConfig;
//! use tinykernel_core::kernel::Kernel;
//!
//! let kernel = Kernel::new(KernelConfig::default());
//! let task: tinykernel_core::kernel::Task = Arc::new(|_k, _tid, _args| 42);
//! let tid = kernel.spawn_init(task, Vec::new()).unwrap();
//! // ... wait_child, pipe, socket, etc. all take the calling Tid explicitly.
//! let _ = tid;
//! kernel.shutdown();
//! ```

pub(crate) mod bios;
pub mod config;
pub mod error;
pub mod ids;
pub mod kernel;
pub(crate) mod ipc;
pub(crate) mod proc;
pub(crate) mod sched;
