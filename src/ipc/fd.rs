//! Per-process file-id table.
//!
//! Each slot holds one open file description: a pipe half, a socket, or an
//! `OpenInfo` stream, wrapped in an `Arc<Fcb>`. `Exec`'s "duplicate the
//! parent's FIDT and incref each FCB" step ([`FidTable::fork`]) clones that
//! `Arc` rather than the `Fcb` it points to, so a description shared across
//! a parent and its child (or across several of the parent's own fids, were
//! this crate to grow a `dup`) is the same object everywhere it is held.
//! [`Kernel::close_fcb_locked`](crate::kernel::Kernel) only performs the
//! underlying pipe/socket teardown once the `Arc`'s strong count says this
//! is the last reference; every earlier close is a plain decref, the same
//! as the original's FCB refcount, minus the hand-maintained counter.

use std::sync::Arc;

use parking_lot::Mutex;

use super::info::InfoStream;
use super::pipe::Picb;
use super::socket::Scb;

pub(crate) enum Fcb {
    PipeRead(Arc<Mutex<Picb>>),
    PipeWrite(Arc<Mutex<Picb>>),
    Socket(Arc<Mutex<Scb>>),
    Info(Arc<Mutex<InfoStream>>),
}

/// A process's file-id table: a fixed number of slots, allocated lowest
/// index first.
pub(crate) struct FidTable {
    slots: Vec<Option<Arc<Fcb>>>,
}

impl FidTable {
    pub(crate) fn new(capacity: usize) -> Self {
        FidTable {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub(crate) fn alloc(&mut self, fcb: Fcb) -> Option<i32> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Arc::new(fcb));
                return Some(i as i32);
            }
        }
        None
    }

    pub(crate) fn get(&self, fid: i32) -> Option<&Fcb> {
        if fid < 0 {
            return None;
        }
        self.slots.get(fid as usize)?.as_deref()
    }

    pub(crate) fn take(&mut self, fid: i32) -> Option<Arc<Fcb>> {
        if fid < 0 {
            return None;
        }
        self.slots.get_mut(fid as usize)?.take()
    }

    /// Build a new table of the same capacity with every occupied slot's
    /// `Arc<Fcb>` cloned (an incref, not a copy) rather than moved. Used by
    /// `Exec` to hand a child process its parent's open files.
    pub(crate) fn fork(&self) -> Self {
        FidTable {
            slots: self.slots.clone(),
        }
    }

    /// Take every occupied slot out, leaving the table empty. Used when a
    /// process terminates, to decref every FIDT slot it still held open.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Fcb>> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_fcb() -> Fcb {
        Fcb::Info(Arc::new(Mutex::new(InfoStream::render(std::iter::empty()))))
    }

    #[test]
    fn allocates_lowest_free_slot() {
        let mut t = FidTable::new(4);
        let a = t.alloc(info_fcb()).unwrap();
        let b = t.alloc(info_fcb()).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        t.take(a);
        let c = t.alloc(info_fcb()).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut t = FidTable::new(1);
        assert!(t.alloc(info_fcb()).is_some());
        assert!(t.alloc(info_fcb()).is_none());
    }

    #[test]
    fn fork_shares_the_same_underlying_endpoint() {
        let mut parent = FidTable::new(4);
        let fid = parent.alloc(info_fcb()).unwrap();
        let child = parent.fork();
        let (Some(Fcb::Info(a)), Some(Fcb::Info(b))) = (parent.get(fid), child.get(fid)) else {
            panic!("expected both tables to reference the same info stream");
        };
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn closing_one_forked_reference_does_not_drop_the_shared_fcb() {
        let mut parent = FidTable::new(4);
        let fid = parent.alloc(info_fcb()).unwrap();
        let mut child = parent.fork();

        let taken = child.take(fid).unwrap();
        assert_eq!(Arc::strong_count(&taken), 2, "parent's slot still holds a reference");
        drop(taken);
        assert!(parent.get(fid).is_some(), "parent's own fid is unaffected by the child closing its copy");
    }
}
