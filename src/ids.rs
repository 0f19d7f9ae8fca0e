//! Handle types for the kernel's addressable objects.
//!
//! `Pid`, `Tid`, `Fid` and `Port` are newtypes instead of the raw integers
//! (or, in the case of `Tid`, a raw pointer) the original kernel used. `Tid`
//! in particular carries a generation counter so that a handle to a thread
//! that has since exited and had its slot reused is rejected instead of
//! silently aliasing the wrong thread.

use std::fmt;

/// Reserved value meaning "no such process".
pub const NOPROC: Pid = Pid(u32::MAX);
/// Reserved value meaning "no such file".
pub const NOFILE: Fid = Fid(-1);
/// Reserved value meaning "no such port" / "unbound".
pub const NOPORT: Port = Port(0);
/// Reserved timeout value meaning "wait forever".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// A process identifier.
///
/// Pid 0 is reserved for the scheduler's bookkeeping process (the owner of
/// the per-core idle threads); real processes start at Pid 1, the boot
/// process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub(crate) u32);

impl Pid {
    pub(crate) fn new(raw: u32) -> Self {
        Pid(raw)
    }

    pub fn is_noproc(self) -> bool {
        self == NOPROC
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == NOPROC {
            write!(f, "Pid(NOPROC)")
        } else {
            write!(f, "Pid({})", self.0)
        }
    }
}

/// A handle to a thread: which process it belongs to, which slot in that
/// process's thread table, and the generation of that slot at the time the
/// handle was issued.
///
/// Unlike the original `PTCB*`, a stale `Tid` (one whose slot has been
/// recycled for a different thread since) is detected and rejected rather
/// than dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid {
    pub(crate) pid: Pid,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl Tid {
    pub(crate) fn new(pid: Pid, slot: u32, generation: u32) -> Self {
        Tid { pid, slot, generation }
    }

    pub fn pid(self) -> Pid {
        self.pid
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tid(pid={}, slot={}, gen={})",
            self.pid.0, self.slot, self.generation
        )
    }
}

/// A file descriptor, scoped to a single process's file-id table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fid(pub(crate) i32);

impl Fid {
    pub(crate) fn new(raw: i32) -> Self {
        Fid(raw)
    }

    pub fn is_nofile(self) -> bool {
        self == NOFILE
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == NOFILE {
            write!(f, "Fid(NOFILE)")
        } else {
            write!(f, "Fid({})", self.0)
        }
    }
}

/// A socket port number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(pub(crate) u16);

impl Port {
    pub fn new(raw: u16) -> Self {
        Port(raw)
    }

    pub fn is_noport(self) -> bool {
        self == NOPORT
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == NOPORT {
            write!(f, "Port(NOPORT)")
        } else {
            write!(f, "Port({})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_recognized() {
        assert!(NOPROC.is_noproc());
        assert!(NOFILE.is_nofile());
        assert!(NOPORT.is_noport());
        assert!(!Pid::new(1).is_noproc());
    }

    #[test]
    fn tid_generation_distinguishes_handles() {
        let pid = Pid::new(1);
        let a = Tid::new(pid, 0, 0);
        let b = Tid::new(pid, 0, 1);
        assert_ne!(a, b);
        assert_eq!(a.pid(), b.pid());
    }
}
