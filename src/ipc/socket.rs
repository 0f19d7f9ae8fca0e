//! Stream socket endpoints.
//!
//! A socket endpoint starts life `Unbound`. `Listen` turns it into a
//! `Listener` bound to a port, after which `Connect` calls queue a
//! [`Request`] there for `Accept` to pick up. `Accept` wires a freshly
//! allocated endpoint on the listener's side and the connector's
//! previously-`Unbound` endpoint together into a `Peer` pair by handing
//! each one end of two independent pipes, so that what one side writes the
//! other reads.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::Port;
use crate::sched::kcondvar::KCondVar;

use super::pipe::Picb;

pub(crate) enum Scb {
    /// Carries the port given to `Socket(port)` at creation time, so that
    /// `Listen(fid)` (which takes no port argument of its own) has
    /// something to bind.
    Unbound { port: Port },
    Listener(Listener),
    Peer { send: Arc<Mutex<Picb>>, recv: Arc<Mutex<Picb>> },
}

pub(crate) struct Listener {
    pub port: Port,
    pub pending: std::collections::VecDeque<Arc<Request>>,
    /// Threads parked in `Accept` waiting for a request to arrive.
    pub incoming: KCondVar,
}

/// The rendezvous between one `Connect` call and the `Accept` call that
/// eventually serves it.
pub(crate) struct Request {
    pub connector: Arc<Mutex<Scb>>,
    pub outcome: Mutex<RequestOutcome>,
    /// The connecting thread, parked waiting for `outcome` to resolve.
    pub ready: KCondVar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOutcome {
    Pending,
    Accepted,
    TimedOut,
}

/// The `port -> listening socket` table. Index 0 is never used (it is
/// [`crate::ids::NOPORT`]).
pub(crate) struct PortMap {
    ports: Vec<Option<Arc<Mutex<Scb>>>>,
}

impl PortMap {
    pub(crate) fn new(max_port: u16) -> Self {
        PortMap {
            ports: (0..=max_port).map(|_| None).collect(),
        }
    }

    pub(crate) fn get(&self, port: Port) -> Option<Arc<Mutex<Scb>>> {
        self.ports.get(port.as_u16() as usize).and_then(|p| p.clone())
    }

    pub(crate) fn bind(&mut self, port: Port, scb: Arc<Mutex<Scb>>) -> bool {
        match self.ports.get_mut(port.as_u16() as usize) {
            Some(slot @ None) => {
                *slot = Some(scb);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn unbind(&mut self, port: Port) {
        if let Some(slot) = self.ports.get_mut(port.as_u16() as usize) {
            *slot = None;
        }
    }
}
