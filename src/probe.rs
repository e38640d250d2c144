use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::constants::ECHO_PACKET_LEN;

/// The observation for the probe currently being reported.
///
/// A single value is reused for the whole session: [`ProbeResult::reset`] runs
/// each time a probe is sent, while `link_address` survives across probes once
/// it has been resolved.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ProbeResult {
    pub target: Ipv4Addr,
    pub sequence: u16,
    pub answered: bool,
    pub round_trip_time: Duration,
    pub ttl: u8,
    pub link_address: Option<MacAddr>,
    pub size: usize,
    pub timeout: Duration,
}

impl Default for ProbeResult {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, Duration::ZERO)
    }
}

impl ProbeResult {
    pub fn new(target: Ipv4Addr, timeout: Duration) -> Self {
        Self {
            target,
            sequence: 0,
            answered: false,
            round_trip_time: Duration::ZERO,
            ttl: 0,
            link_address: None,
            size: ECHO_PACKET_LEN,
            timeout,
        }
    }

    pub(crate) fn reset(&mut self, sequence: u16) {
        self.sequence = sequence;
        self.answered = false;
        self.round_trip_time = Duration::ZERO;
        self.ttl = 0;
    }
}

/// Aggregate counters for one session.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SessionStats {
    pub total_sent: u32,
    pub total_received: u32,
    /// Time from the first send until completion; zero until the session is done.
    pub total_elapsed: Duration,
}

impl SessionStats {
    /// Fraction of sent probes that went unanswered, in `0.0..=1.0`.
    pub fn loss(&self) -> f64 {
        if self.total_sent == 0 {
            return 0.0;
        }
        f64::from(self.total_sent - self.total_received) / f64::from(self.total_sent)
    }
}
