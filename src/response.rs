use std::net::Ipv4Addr;
use std::sync::Arc;

use afpacket::tokio::RawPacketStream;
use log::trace;
use pnet::packet::arp::{ArpOperations, ArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use tokio::io::AsyncReadExt;

use crate::caching::LinkCache;
use crate::constants::ETH_PACK_LEN;
use crate::error::{Error, Result};

/// Feeds every ARP reply seen on the interface into the cache.
pub(super) struct Listener {
    stream: RawPacketStream,
    cache: Arc<LinkCache>,
}

impl Listener {
    pub(super) fn new(stream: RawPacketStream, cache: Arc<LinkCache>) -> Self {
        Self { stream, cache }
    }

    pub(super) async fn listen(&mut self) -> Result<()> {
        let mut buf = [0; ETH_PACK_LEN];
        while let Ok(read_bytes) = self.stream.read(&mut buf).await {
            if let Ok((ip, mac)) = parse_arp_reply(&buf[..read_bytes]) {
                trace!("ARP reply: {} is at {}", ip, mac);
                self.cache.insert(ip, mac);
            }
        }
        Err(Error::Opaque(
            "error while reading the interface traffic".into(),
        ))
    }
}

/// Extracts the announced `(ip, mac)` pair from an Ethernet frame carrying an ARP reply.
pub(super) fn parse_arp_reply(bytes: &[u8]) -> Result<(Ipv4Addr, MacAddr)> {
    let ethernet_packet =
        EthernetPacket::new(bytes).ok_or(Error::Opaque("failed to parse Ethernet frame".into()))?;
    if ethernet_packet.get_ethertype() != EtherTypes::Arp {
        return Err(Error::Opaque("not an ARP packet".into()));
    }
    let arp = ArpPacket::new(ethernet_packet.payload())
        .ok_or(Error::Opaque("failed to parse ARP packet".into()))?;
    if arp.get_operation() != ArpOperations::Reply {
        return Err(Error::Opaque("not an ARP reply".into()));
    }
    Ok((arp.get_sender_proto_addr(), arp.get_sender_hw_addr()))
}
