use std::time::Duration;

pub(crate) const MAC_ADDR_LEN: u8 = 6;
pub(crate) const IP_V4_LEN: u8 = 4;
pub(crate) const ARP_PACK_LEN: usize = 28;
pub(crate) const ETH_PACK_LEN: usize = 14 + ARP_PACK_LEN;

pub(crate) const IPV4_HEADER_LEN: usize = 20;
pub(crate) const ICMP_HEADER_LEN: usize = 8;
/// Total size of an echo request, header included.
pub const ECHO_PACKET_LEN: usize = 64;
/// Filler bytes following the echo header.
pub const ECHO_PAYLOAD_LEN: usize = ECHO_PACKET_LEN - ICMP_HEADER_LEN;

/// Sequence numbers wrap back to zero instead of reaching this value.
pub const SEQUENCE_CEILING: u16 = 0x7fff;

/// Delay between accepting a reply and reporting the probe.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);

pub(crate) const OUTGOING_TTL: u8 = 64;
pub(crate) const RECV_BUFFER_LEN: usize = 4096;
pub(crate) const LISTENER_POLL_INTERVAL: Duration = Duration::from_millis(100);
