//! ICMP echo request construction and echo reply parsing.
//!
//! The request layout is fixed: an 8-byte echo header followed by 56 filler
//! bytes where byte `i` holds `i` truncated to 8 bits, the same pattern the
//! common `ping` implementations put on the wire.

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;

use crate::constants::{ECHO_PACKET_LEN, ICMP_HEADER_LEN, SEQUENCE_CEILING};
use crate::error::{Error, Result};

/// Returns the sequence number following `current`, wrapping to zero instead
/// of reaching [`SEQUENCE_CEILING`].
pub fn next_sequence(current: u16) -> u16 {
    match current.wrapping_add(1) {
        next if next >= SEQUENCE_CEILING => 0,
        next => next,
    }
}

/// A reusable echo request buffer together with the sequence counter it stamps.
///
/// The filler payload is written once; each [`EchoRequest::build`] only rewrites
/// the header in place.
#[derive(Debug, Clone)]
pub struct EchoRequest {
    buf: [u8; ECHO_PACKET_LEN],
    sequence: u16,
}

impl Default for EchoRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoRequest {
    pub fn new() -> Self {
        let mut buf = [0; ECHO_PACKET_LEN];
        for (i, byte) in buf[ICMP_HEADER_LEN..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        Self { buf, sequence: 0 }
    }

    /// The sequence number stamped by the last [`EchoRequest::build`], or zero
    /// if nothing was built since the last reset.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn reset(&mut self) {
        self.sequence = 0;
    }

    /// Advances the sequence counter and rewrites the header for the next probe.
    ///
    /// # Errors
    /// Returns [`Error::AllocationFailure`] if the buffer cannot hold an echo
    /// request, in which case the counter is left untouched.
    pub fn build(&mut self, identifier: u16) -> Result<&[u8]> {
        let sequence = next_sequence(self.sequence);
        let mut packet =
            MutableEchoRequestPacket::new(&mut self.buf).ok_or(Error::AllocationFailure)?;
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_checksum(0);
        let checksum = IcmpPacket::new(packet.packet())
            .map(|icmp| icmp::checksum(&icmp))
            .ok_or(Error::AllocationFailure)?;
        packet.set_checksum(checksum);
        self.sequence = sequence;
        Ok(&self.buf)
    }
}

/// The fields of an inbound echo reply needed for correlation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub ttl: u8,
}

/// Parses an IPv4 datagram, returning the echo reply it carries.
///
/// Anything that is not an ICMP echo reply yields `None`.
pub fn parse_echo_reply(bytes: &[u8]) -> Option<EchoReply> {
    let ip = Ipv4Packet::new(bytes)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let icmp = IcmpPacket::new(ip.payload())?;
    if icmp.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    let reply = EchoReplyPacket::new(ip.payload())?;
    Some(EchoReply {
        identifier: reply.get_identifier(),
        sequence: reply.get_sequence_number(),
        ttl: ip.get_ttl(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::{ECHO_PAYLOAD_LEN, IPV4_HEADER_LEN};
    use pnet::packet::icmp::echo_reply::MutableEchoReplyPacket;
    use pnet::packet::icmp::IcmpType;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use std::net::Ipv4Addr;

    /// Builds an IPv4 datagram carrying an ICMP message of the given type.
    pub(crate) fn icmp_datagram(
        icmp_type: IcmpType,
        identifier: u16,
        sequence: u16,
        ttl: u8,
    ) -> Vec<u8> {
        let total_len = IPV4_HEADER_LEN + ECHO_PACKET_LEN;
        let mut buf = vec![0; total_len];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(total_len as u16);
            ip.set_ttl(ttl);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            ip.set_source(Ipv4Addr::new(10, 0, 0, 1));
            ip.set_destination(Ipv4Addr::new(10, 0, 0, 2));
        }
        let mut reply = MutableEchoReplyPacket::new(&mut buf[IPV4_HEADER_LEN..]).unwrap();
        reply.set_icmp_type(icmp_type);
        reply.set_identifier(identifier);
        reply.set_sequence_number(sequence);
        buf
    }

    pub(crate) fn echo_reply(identifier: u16, sequence: u16, ttl: u8) -> Vec<u8> {
        icmp_datagram(IcmpTypes::EchoReply, identifier, sequence, ttl)
    }

    #[test]
    fn test_request_layout() {
        let mut request = EchoRequest::new();
        let bytes = request.build(0xbeef).unwrap();
        assert_eq!(bytes.len(), ECHO_PACKET_LEN);
        assert_eq!(bytes[0], 8);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[4..6], &[0xbe, 0xef]);
        assert_eq!(&bytes[6..8], &[0x00, 0x01]);
        let payload = &bytes[ICMP_HEADER_LEN..];
        assert_eq!(payload.len(), ECHO_PAYLOAD_LEN);
        for (i, byte) in payload.iter().enumerate() {
            assert_eq!(*byte, i as u8);
        }
    }

    fn ones_complement_sum(bytes: &[u8]) -> u16 {
        let mut sum: u32 = bytes
            .chunks(2)
            .map(|word| u32::from(u16::from_be_bytes([word[0], *word.get(1).unwrap_or(&0)])))
            .sum();
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    #[test]
    fn test_request_checksum_verifies() {
        let mut request = EchoRequest::new();
        for _ in 0..3 {
            let bytes = request.build(42).unwrap();
            // a correct checksum makes the folded sum over the whole message all ones
            assert_eq!(ones_complement_sum(bytes), 0xffff);
        }
    }

    #[test]
    fn test_checksum_recomputed_from_zero() {
        let mut request = EchoRequest::new();
        let first = request.build(7).unwrap().to_vec();
        let mut again = EchoRequest::new();
        let second = again.build(7).unwrap().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sequence_advances_per_build() {
        let mut request = EchoRequest::new();
        assert_eq!(request.sequence(), 0);
        request.build(1).unwrap();
        request.build(1).unwrap();
        assert_eq!(request.sequence(), 2);
        request.reset();
        assert_eq!(request.sequence(), 0);
    }

    #[test]
    fn test_sequence_wraps_below_ceiling() {
        assert_eq!(next_sequence(0), 1);
        assert_eq!(next_sequence(SEQUENCE_CEILING - 2), SEQUENCE_CEILING - 1);
        assert_eq!(next_sequence(SEQUENCE_CEILING - 1), 0);
        assert_eq!(next_sequence(u16::MAX), 0);
    }

    #[test]
    fn test_parse_echo_reply() {
        let bytes = echo_reply(0x1234, 9, 57);
        assert_eq!(
            parse_echo_reply(&bytes),
            Some(EchoReply {
                identifier: 0x1234,
                sequence: 9,
                ttl: 57
            })
        );
    }

    #[test]
    fn test_parse_rejects_other_icmp_types() {
        let bytes = icmp_datagram(IcmpTypes::EchoRequest, 0x1234, 9, 57);
        assert_eq!(parse_echo_reply(&bytes), None);
        let bytes = icmp_datagram(IcmpTypes::DestinationUnreachable, 0x1234, 9, 57);
        assert_eq!(parse_echo_reply(&bytes), None);
    }

    #[test]
    fn test_parse_rejects_other_protocols() {
        let mut bytes = echo_reply(0x1234, 9, 57);
        MutableIpv4Packet::new(&mut bytes)
            .unwrap()
            .set_next_level_protocol(IpNextHeaderProtocols::Udp);
        assert_eq!(parse_echo_reply(&bytes), None);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = echo_reply(0x1234, 9, 57);
        assert_eq!(parse_echo_reply(&bytes[..IPV4_HEADER_LEN - 1]), None);
    }
}
