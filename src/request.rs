use pnet::{
    packet::{
        arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket},
        ethernet::{EtherTypes, MutableEthernetPacket},
        Packet,
    },
    util::MacAddr,
};
use std::net::Ipv4Addr;

use crate::constants::{ARP_PACK_LEN, ETH_PACK_LEN, IP_V4_LEN, MAC_ADDR_LEN};

/// The local side of an ARP exchange.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Sender {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

/// Builds a broadcast "who-has `target_ip`" frame.
pub(super) fn who_has(sender: Sender, target_ip: Ipv4Addr) -> [u8; ETH_PACK_LEN] {
    let mut eth_buf = [0; ETH_PACK_LEN];
    let mut arp_buf = [0; ARP_PACK_LEN];
    if let Some(mut arp_packet) = MutableArpPacket::new(&mut arp_buf) {
        arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp_packet.set_protocol_type(EtherTypes::Ipv4);
        arp_packet.set_hw_addr_len(MAC_ADDR_LEN);
        arp_packet.set_proto_addr_len(IP_V4_LEN);
        arp_packet.set_operation(ArpOperations::Request);
        arp_packet.set_sender_hw_addr(sender.mac);
        arp_packet.set_sender_proto_addr(sender.ip);
        arp_packet.set_target_hw_addr(MacAddr::zero());
        arp_packet.set_target_proto_addr(target_ip);
    }
    if let Some(mut eth_packet) = MutableEthernetPacket::new(&mut eth_buf) {
        eth_packet.set_destination(MacAddr::broadcast());
        eth_packet.set_source(sender.mac);
        eth_packet.set_ethertype(EtherTypes::Arp);
        eth_packet.set_payload(&arp_buf);
    }
    eth_buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::arp::ArpPacket;
    use pnet::packet::ethernet::EthernetPacket;

    #[test]
    fn test_who_has() {
        let sender = Sender {
            mac: MacAddr::new(0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E),
            ip: Ipv4Addr::new(10, 1, 1, 100),
        };
        let target_ip = Ipv4Addr::new(10, 1, 1, 1);
        let frame = who_has(sender, target_ip);

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_destination(), MacAddr::broadcast());
        assert_eq!(eth.get_source(), sender.mac);
        assert_eq!(eth.get_ethertype(), EtherTypes::Arp);

        let arp = ArpPacket::new(eth.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_sender_hw_addr(), sender.mac);
        assert_eq!(arp.get_sender_proto_addr(), sender.ip);
        assert_eq!(arp.get_target_hw_addr(), MacAddr::zero());
        assert_eq!(arp.get_target_proto_addr(), target_ip);
    }
}
