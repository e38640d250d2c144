//! The state machine for a single ping run.
//!
//! A [`Session`] never blocks and never spawns: it reacts to `begin`, inbound
//! packets and timer fires, and tells its collaborators what to do next. All of
//! its entry points must be serialized by the caller.

use log::{debug, trace, warn};
use pnet::util::MacAddr;
use rand::Rng;
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use crate::constants::DEFAULT_SETTLE_DELAY;
use crate::error::{Error, Result};
use crate::net::{LinkLookup, LinkResolver, Scheduler, Timer, TimerKind, Transport};
use crate::packet::{parse_echo_reply, EchoRequest};
use crate::probe::{ProbeResult, SessionStats};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum State {
    /// Nothing armed.
    #[default]
    Idle,
    /// Waiting for a host name to resolve.
    AwaitingTarget,
    /// One request sent, deadline armed.
    ProbeInFlight,
    /// A reply was accepted, the report is pending.
    ReplySettling,
    /// Completion reported, transport released.
    Done,
}

/// What moves a session from one [`State`] to the next.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Trigger {
    Resolve,
    Unresolved,
    Send,
    Accept,
    Report { remaining: bool },
    Reset,
    Stop,
}

impl State {
    /// The state reached by applying `trigger`, or `None` if it is not legal here.
    pub fn next(self, trigger: Trigger) -> Option<State> {
        use State::*;
        match (self, trigger) {
            (Idle | Done, Trigger::Resolve) => Some(AwaitingTarget),
            (AwaitingTarget, Trigger::Unresolved) => Some(Idle),
            (Idle | Done | AwaitingTarget, Trigger::Send) => Some(ProbeInFlight),
            (ProbeInFlight, Trigger::Accept) => Some(ReplySettling),
            (ProbeInFlight | ReplySettling, Trigger::Report { remaining: true }) => {
                Some(ProbeInFlight)
            }
            (ProbeInFlight | ReplySettling, Trigger::Report { remaining: false }) => Some(Done),
            (Done, Trigger::Reset) => Some(Idle),
            (_, Trigger::Stop) => Some(Idle),
            _ => None,
        }
    }

    /// Whether a probe is outstanding or about to be reported.
    pub fn is_in_flight(self) -> bool {
        matches!(self, State::ProbeInFlight | State::ReplySettling)
    }
}

pub type ProbeCallback = Box<dyn FnMut(&ProbeResult, &SessionStats) -> ControlFlow<()> + Send>;
pub type CompleteCallback = Box<dyn FnMut(&ProbeResult, &SessionStats) + Send>;

#[derive(Default)]
struct Callbacks {
    probe: Option<ProbeCallback>,
    complete: Option<CompleteCallback>,
}

impl Callbacks {
    fn probe(&mut self, probe: &ProbeResult, stats: &SessionStats) -> ControlFlow<()> {
        match self.probe.as_mut() {
            Some(callback) => callback(probe, stats),
            None => ControlFlow::Continue(()),
        }
    }

    fn complete(&mut self, probe: &ProbeResult, stats: &SessionStats) {
        if let Some(callback) = self.complete.as_mut() {
            callback(probe, stats);
        }
    }
}

/// One ping run against one target.
pub struct Session<T: Transport, S: Scheduler, L: LinkResolver> {
    identifier: u16,
    state: State,
    request: EchoRequest,
    outstanding: Option<u16>,
    epoch: u64,
    probes_requested: u16,
    probes_remaining: u16,
    timeout: Duration,
    settle_delay: Duration,
    started_at: Option<Instant>,
    last_sent_at: Option<Instant>,
    /// Source address the link lookup was issued for, at most once per run.
    link_lookup: Option<Ipv4Addr>,
    probe: ProbeResult,
    stats: SessionStats,
    callbacks: Callbacks,
    transport: T,
    scheduler: S,
    links: L,
}

impl<T: Transport, S: Scheduler, L: LinkResolver> Session<T, S, L> {
    /// Creates an idle session; `rng` draws the identifier carried by every probe.
    pub fn new<R: Rng>(transport: T, scheduler: S, links: L, rng: &mut R) -> Self {
        Self {
            identifier: rng.gen(),
            state: State::Idle,
            request: EchoRequest::new(),
            outstanding: None,
            epoch: 0,
            probes_requested: 0,
            probes_remaining: 0,
            timeout: Duration::ZERO,
            settle_delay: DEFAULT_SETTLE_DELAY,
            started_at: None,
            last_sent_at: None,
            link_lookup: None,
            probe: ProbeResult::default(),
            stats: SessionStats::default(),
            callbacks: Callbacks::default(),
            transport,
            scheduler,
            links,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Overrides the random identifier, e.g. to keep concurrent sessions apart.
    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn probe(&self) -> &ProbeResult {
        &self.probe
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn probes_requested(&self) -> u16 {
        self.probes_requested
    }

    pub fn probes_remaining(&self) -> u16 {
        self.probes_remaining
    }

    /// The sequence number a reply must carry to be accepted.
    pub fn outstanding(&self) -> Option<u16> {
        self.outstanding
    }

    /// Replaces the per-probe callback. Returning [`ControlFlow::Break`] cancels
    /// the remaining probes.
    pub fn on_probe<F>(&mut self, callback: F)
    where
        F: FnMut(&ProbeResult, &SessionStats) -> ControlFlow<()> + Send + 'static,
    {
        self.callbacks.probe = Some(Box::new(callback));
    }

    /// Replaces the completion callback.
    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: FnMut(&ProbeResult, &SessionStats) + Send + 'static,
    {
        self.callbacks.complete = Some(Box::new(callback));
    }

    /// Starts sending `count` probes to `target`, one per `timeout` at most.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `count` is zero or the session is
    /// not idle or done. The session is left untouched in that case.
    pub fn begin(&mut self, target: Ipv4Addr, count: u16, timeout: Duration) -> Result<()> {
        Self::validate(self.state, count)?;
        if self.state == State::AwaitingTarget {
            return Err(Error::InvalidArgument("a target is already being resolved"));
        }
        self.start(target, count, timeout)
    }

    /// Marks the session as waiting for host-name resolution.
    ///
    /// # Errors
    /// Same as [`Session::begin`].
    pub fn await_target(&mut self, count: u16, timeout: Duration) -> Result<()> {
        Self::validate(self.state, count)?;
        if !self.transition(Trigger::Resolve) {
            return Err(Error::InvalidArgument("a target is already being resolved"));
        }
        self.probes_requested = count;
        self.timeout = timeout;
        Ok(())
    }

    /// Continues a session started with [`Session::await_target`].
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if the session stopped waiting meanwhile.
    pub fn target_resolved(&mut self, target: Ipv4Addr) -> Result<()> {
        if self.state != State::AwaitingTarget {
            return Err(Error::Cancelled);
        }
        self.start(target, self.probes_requested, self.timeout)
    }

    pub fn target_unresolved(&mut self) {
        if self.transition(Trigger::Unresolved) {
            self.probes_requested = 0;
        }
    }

    /// Requests that no further probe is sent.
    ///
    /// The pending timer still fires once and drives the final report. While a
    /// host name is resolving the session goes straight back to idle.
    pub fn cancel(&mut self) {
        self.probes_remaining = 0;
        if self.state == State::AwaitingTarget {
            self.target_unresolved();
        }
    }

    /// Offers an inbound IPv4 datagram to the session.
    ///
    /// Returns `true` if the packet was the reply to the outstanding probe and
    /// has been consumed; other packets are left for other receivers.
    pub fn handle_packet(&mut self, source: Ipv4Addr, bytes: &[u8]) -> bool {
        let Some(reply) = parse_echo_reply(bytes) else {
            return false;
        };
        if !self.state.is_in_flight()
            || reply.identifier != self.identifier
            || Some(reply.sequence) != self.outstanding
        {
            trace!(
                "ignoring echo reply id={} seq={} from {}",
                reply.identifier,
                reply.sequence,
                source
            );
            return false;
        }
        if self.state == State::ReplySettling {
            trace!("duplicate echo reply seq={} from {}", reply.sequence, source);
            return true;
        }

        let now = self.scheduler.now();
        let sent_at = self.last_sent_at.unwrap_or(now);
        self.probe.round_trip_time = now.saturating_duration_since(sent_at);
        self.probe.ttl = reply.ttl;
        self.probe.answered = true;
        self.stats.total_received += 1;
        trace!(
            "echo reply from {}: seq={} ttl={} time={:?}",
            source,
            reply.sequence,
            reply.ttl,
            self.probe.round_trip_time
        );

        if self.link_lookup.is_none() && self.probe.link_address.is_none() {
            self.link_lookup = Some(source);
            match self.links.lookup(source) {
                LinkLookup::Resolved(mac) => self.probe.link_address = Some(mac),
                LinkLookup::Pending => debug!("link address of {} pending", source),
                LinkLookup::Unavailable => {}
            }
        }

        self.transition(Trigger::Accept);
        self.scheduler.disarm(TimerKind::Deadline);
        self.scheduler.arm(
            Timer {
                kind: TimerKind::Settle,
                epoch: self.epoch,
            },
            self.settle_delay,
        );
        true
    }

    /// Stores the answer to a [`LinkLookup::Pending`] lookup.
    ///
    /// Answers for any address other than the one looked up in this run are dropped.
    pub fn link_resolved(&mut self, addr: Ipv4Addr, mac: MacAddr) {
        if self.link_lookup != Some(addr) || self.probe.link_address.is_some() {
            trace!("ignoring link address {} for {}", mac, addr);
            return;
        }
        debug!("link address of {} is {}", addr, mac);
        self.probe.link_address = Some(mac);
    }

    /// Handles an elapsed timer previously armed through the scheduler.
    pub fn on_timer(&mut self, timer: Timer) {
        let due = timer.epoch == self.epoch
            && matches!(
                (timer.kind, self.state),
                (TimerKind::Deadline, State::ProbeInFlight)
                    | (TimerKind::Settle, State::ReplySettling)
            );
        if !due {
            trace!("stale {:?} timer in {:?}", timer, self.state);
            return;
        }
        if timer.kind == TimerKind::Deadline {
            trace!("no reply for seq={}", self.probe.sequence);
        }
        self.report();
    }

    /// Returns a finished session to idle, clearing its last results.
    pub fn reset(&mut self) {
        if self.transition(Trigger::Reset) {
            self.clear();
        }
    }

    /// Detaches both timers and releases the transport, whatever the state.
    ///
    /// No callback fires.
    pub fn stop(&mut self) {
        self.scheduler.disarm(TimerKind::Deadline);
        self.scheduler.disarm(TimerKind::Settle);
        self.transport.close();
        self.probes_remaining = 0;
        self.outstanding = None;
        self.transition(Trigger::Stop);
    }

    fn validate(state: State, count: u16) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument("probe count must be positive"));
        }
        if state.is_in_flight() {
            return Err(Error::InvalidArgument("a probe is already in flight"));
        }
        Ok(())
    }

    fn start(&mut self, target: Ipv4Addr, count: u16, timeout: Duration) -> Result<()> {
        self.transport.open()?;
        self.clear();
        self.probes_requested = count;
        self.probes_remaining = count;
        self.timeout = timeout;
        self.probe = ProbeResult::new(target, timeout);
        debug!(
            "pinging {} with {} probes, id={}",
            target, count, self.identifier
        );
        self.transition(Trigger::Send);
        self.send_probe();
        Ok(())
    }

    fn clear(&mut self) {
        self.request.reset();
        self.outstanding = None;
        self.stats = SessionStats::default();
        self.started_at = None;
        self.last_sent_at = None;
        self.link_lookup = None;
        self.probe.link_address = None;
    }

    fn send_probe(&mut self) {
        self.epoch += 1;
        let now = self.scheduler.now();
        match self.request.build(self.identifier) {
            Ok(bytes) => {
                if let Err(err) = self.transport.send_to(self.probe.target, bytes) {
                    warn!("failed to send echo request to {}: {}", self.probe.target, err);
                }
            }
            Err(err) => warn!("dropping probe to {}: {}", self.probe.target, err),
        }
        let sequence = self.request.sequence();
        self.probe.reset(sequence);
        self.outstanding = Some(sequence);
        self.stats.total_sent += 1;
        self.probes_remaining = self.probes_remaining.saturating_sub(1);
        self.started_at.get_or_insert(now);
        self.last_sent_at = Some(now);
        self.scheduler.arm(
            Timer {
                kind: TimerKind::Deadline,
                epoch: self.epoch,
            },
            self.timeout,
        );
    }

    fn report(&mut self) {
        if self.callbacks.probe(&self.probe, &self.stats).is_break() {
            debug!("cancelled by probe callback");
            self.probes_remaining = 0;
        }
        if self.probes_remaining > 0 {
            self.transition(Trigger::Report { remaining: true });
            self.send_probe();
        } else {
            self.finish();
        }
    }

    fn finish(&mut self) {
        let now = self.scheduler.now();
        self.stats.total_elapsed = self
            .started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        self.outstanding = None;
        debug!(
            "{} done: {}/{} replies in {:?}",
            self.probe.target,
            self.stats.total_received,
            self.stats.total_sent,
            self.stats.total_elapsed
        );
        self.callbacks.complete(&self.probe, &self.stats);
        self.transport.close();
        self.transition(Trigger::Report { remaining: false });
    }

    fn transition(&mut self, trigger: Trigger) -> bool {
        match self.state.next(trigger) {
            Some(next) => {
                trace!("{:?} -> {:?} on {:?}", self.state, next, trigger);
                self.state = next;
                true
            }
            None => false,
        }
    }
}

impl<T: Transport, S: Scheduler, L: LinkResolver> Drop for Session<T, S, L> {
    fn drop(&mut self) {
        self.stop();
    }
}
