//! Kernel error type.
//!
//! The original kernel reported failures as sentinel integers (`NOPROC`,
//! `NOFILE`, `NOPORT`, or a bare `-1`) returned in place of a handle.
//! `KernelError` keeps that sentinel mapping available via
//! [`KernelError::legacy_code`] for callers that want it, while giving
//! every other caller a real `Result<T, KernelError>` to match on.

use thiserror::Error;

use crate::ids::{Fid, Pid, Port};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("no free process table entry")]
    NoFreeProcess,
    #[error("pid {0:?} does not name a live process")]
    NoSuchProcess(Pid),
    #[error("no free file-id slot in the calling process")]
    NoFreeFile,
    #[error("fid {0:?} is not a valid file descriptor")]
    BadFileId(Fid),
    #[error("fid is not open for this operation")]
    WrongKind,
    #[error("tid does not name a thread of the calling process")]
    NoSuchThread,
    #[error("thread handle refers to a slot that has since been recycled")]
    StaleHandle,
    #[error("a thread cannot join itself")]
    JoinSelf,
    #[error("target thread has been detached and cannot be joined")]
    Detached,
    #[error("port {0:?} is outside the legal [NOPORT, MAX_PORT] range")]
    BadPort(Port),
    #[error("port is already bound by a listener")]
    PortInUse,
    #[error("port is not bound by a listener")]
    NoListener,
    #[error("the peer end of this connection is gone")]
    PeerGone,
    #[error("the calling process already closed its own read side of this endpoint")]
    ReadClosed,
    #[error("operation timed out")]
    TimedOut,
    #[error("pid is not a child of the calling process")]
    NotAChild,
    #[error("calling process has no children left to wait for")]
    NoChildren,
}

impl KernelError {
    /// The sentinel integer the original ABI would have returned in place
    /// of this error. Resource-table exhaustion and dead-handle errors map
    /// back to the domain's own sentinel (`NOPROC`/`NOFILE`); everything
    /// else collapses to the original's generic `-1`.
    pub fn legacy_code(&self) -> i64 {
        match self {
            KernelError::NoFreeProcess | KernelError::NoSuchProcess(_) => {
                crate::ids::NOPROC.as_u32() as i64
            }
            KernelError::NoFreeFile | KernelError::BadFileId(_) => {
                crate::ids::NOFILE.as_i32() as i64
            }
            KernelError::BadPort(_) | KernelError::NoListener => {
                crate::ids::NOPORT.as_u16() as i64
            }
            _ => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
