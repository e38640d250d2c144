//! The seams between a [`crate::session::Session`] and the platform it runs on.

use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::error::Result;

/// The raw channel a session sends echo requests through.
///
/// Inbound delivery is wired up by whoever builds the transport; the session
/// only controls the lifetime of its own handle.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Acquire the handle. Calling it on an open handle is a no-op.
    fn open(&mut self) -> Result<()>;

    fn send_to(&mut self, target: Ipv4Addr, packet: &[u8]) -> Result<()>;

    /// Release the handle. Calling it on a closed handle is a no-op.
    fn close(&mut self);
}

/// The two timers driving a session.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TimerKind {
    /// Fires `timeout` after a probe was sent.
    Deadline,
    /// Fires shortly after a reply was accepted.
    Settle,
}

/// A timer tagged with the probe epoch it was armed for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Timer {
    pub kind: TimerKind,
    pub epoch: u64,
}

/// Clock and one-shot timers.
///
/// When an armed timer elapses the owner of the scheduler must hand it back to
/// [`crate::session::Session::on_timer`].
#[cfg_attr(test, mockall::automock)]
pub trait Scheduler {
    fn now(&self) -> Instant;

    /// Arm `timer`, replacing any pending timer of the same kind.
    fn arm(&mut self, timer: Timer, after: Duration);

    fn disarm(&mut self, kind: TimerKind);
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum LinkLookup {
    Resolved(MacAddr),
    /// The answer will arrive later through [`crate::session::Session::link_resolved`].
    Pending,
    Unavailable,
}

/// Maps a network address to the link-layer address of the neighbour answering for it.
#[cfg_attr(test, mockall::automock)]
pub trait LinkResolver {
    fn lookup(&mut self, addr: Ipv4Addr) -> LinkLookup;
}

impl<L: LinkResolver> LinkResolver for Option<L> {
    fn lookup(&mut self, addr: Ipv4Addr) -> LinkLookup {
        match self {
            Some(resolver) => resolver.lookup(addr),
            None => LinkLookup::Unavailable,
        }
    }
}
