//! A raw ICMP channel shared by any number of sessions.

use log::{trace, warn};
use parking_lot::Mutex;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet::packet::Packet;
use pnet::transport::{
    ipv4_packet_iter, transport_channel, TransportChannelType, TransportReceiver, TransportSender,
};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    ECHO_PACKET_LEN, IPV4_HEADER_LEN, LISTENER_POLL_INTERVAL, OUTGOING_TTL, RECV_BUFFER_LEN,
};
use crate::error::{Error, Result};
use crate::net::Transport;

/// Offered every inbound IPv4 datagram with its source; returns `true` to consume it.
pub type Receiver = Arc<dyn Fn(Ipv4Addr, &[u8]) -> bool + Send + Sync>;

#[derive(Default)]
pub(crate) struct Registry {
    next_token: AtomicU64,
    receivers: Mutex<Vec<(u64, Receiver)>>,
}

impl Registry {
    fn register(self: &Arc<Self>, receiver: Receiver) -> Registration {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.receivers.lock().push((token, receiver));
        Registration {
            registry: Arc::downgrade(self),
            token,
        }
    }

    /// Offers the packet to each receiver in registration order until one consumes it.
    pub(crate) fn dispatch(&self, source: Ipv4Addr, bytes: &[u8]) -> bool {
        // receivers may take their own locks, so call them outside ours
        let receivers: Vec<Receiver> = self
            .receivers
            .lock()
            .iter()
            .map(|(_, receiver)| Arc::clone(receiver))
            .collect();
        receivers.iter().any(|receiver| receiver(source, bytes))
    }

    fn len(&self) -> usize {
        self.receivers.lock().len()
    }
}

/// Keeps a receiver registered until dropped.
pub struct Registration {
    registry: Weak<Registry>,
    token: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .receivers
                .lock()
                .retain(|(token, _)| *token != self.token);
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .finish()
    }
}

/// A layer-3 raw ICMP socket and the thread reading from it.
///
/// Opening one requires `CAP_NET_RAW` (or root).
pub struct IcmpChannel {
    sender: Mutex<TransportSender>,
    registry: Arc<Registry>,
    token: CancellationToken,
}

impl IcmpChannel {
    /// Opens the raw socket and starts dispatching inbound packets.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be created.
    pub fn open() -> Result<Arc<Self>> {
        let (sender, receiver) = transport_channel(
            RECV_BUFFER_LEN,
            TransportChannelType::Layer3(IpNextHeaderProtocols::Icmp),
        )
        .map_err(|err| {
            Error::Opaque(format!("failed to open ICMP channel, reason: {}", err).into())
        })?;
        let registry = Arc::new(Registry::default());
        let token = CancellationToken::new();
        {
            let registry = Arc::clone(&registry);
            let token = token.clone();
            thread::Builder::new()
                .name("icmp-listener".into())
                .spawn(move || listen(receiver, registry, token))
                .map_err(|err| {
                    Error::Opaque(format!("failed to spawn listener, reason: {}", err).into())
                })?;
        }
        Ok(Arc::new(Self {
            sender: Mutex::new(sender),
            registry,
            token,
        }))
    }

    /// Registers `receiver` for inbound packets until the returned guard is dropped.
    pub fn register(&self, receiver: Receiver) -> Registration {
        self.registry.register(receiver)
    }

    /// Number of live registrations.
    pub fn receivers(&self) -> usize {
        self.registry.len()
    }

    /// Sends an ICMP message to `target`, prefixed with an IPv4 header.
    ///
    /// # Errors
    /// Returns an error if the message is larger than an echo request or the
    /// socket rejects it.
    pub fn send_to(&self, target: Ipv4Addr, icmp: &[u8]) -> Result<()> {
        let mut buf = [0; IPV4_HEADER_LEN + ECHO_PACKET_LEN];
        let total_len = IPV4_HEADER_LEN + icmp.len();
        let datagram = buf
            .get_mut(..total_len)
            .and_then(|buf| wrap_ipv4(buf, target, icmp))
            .ok_or(Error::AllocationFailure)?;
        self.sender
            .lock()
            .send_to(datagram, IpAddr::V4(target))
            .map_err(|err| {
                Error::Opaque(format!("failed to send to {}, reason: {}", target, err).into())
            })?;
        Ok(())
    }
}

impl Drop for IcmpChannel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for IcmpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcmpChannel")
            .field("receivers", &self.registry.len())
            .finish()
    }
}

fn wrap_ipv4<'a>(
    buf: &'a mut [u8],
    target: Ipv4Addr,
    icmp: &[u8],
) -> Option<MutableIpv4Packet<'a>> {
    if buf.len() != IPV4_HEADER_LEN + icmp.len() {
        return None;
    }
    let total_len = u16::try_from(buf.len()).ok()?;
    let mut ip = MutableIpv4Packet::new(buf)?;
    ip.set_version(4);
    ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
    ip.set_total_length(total_len);
    ip.set_flags(Ipv4Flags::DontFragment);
    ip.set_ttl(OUTGOING_TTL);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
    // the kernel picks the source address when it is left unspecified
    ip.set_source(Ipv4Addr::UNSPECIFIED);
    ip.set_destination(target);
    ip.set_payload(icmp);
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);
    Some(ip)
}

fn listen(mut receiver: TransportReceiver, registry: Arc<Registry>, token: CancellationToken) {
    let mut packets = ipv4_packet_iter(&mut receiver);
    while !token.is_cancelled() {
        match packets.next_with_timeout(LISTENER_POLL_INTERVAL) {
            Ok(Some((packet, IpAddr::V4(source)))) => {
                if !registry.dispatch(source, packet.packet()) {
                    trace!("unclaimed ICMP packet from {}", source);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("error while reading ICMP traffic: {}", err);
                break;
            }
        }
    }
}

/// A session's handle on an [`IcmpChannel`].
pub struct ChannelTransport {
    channel: Arc<IcmpChannel>,
    receiver: Receiver,
    registration: Option<Registration>,
}

impl ChannelTransport {
    pub fn new(channel: Arc<IcmpChannel>, receiver: Receiver) -> Self {
        Self {
            channel,
            receiver,
            registration: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.registration.is_some()
    }
}

impl Transport for ChannelTransport {
    fn open(&mut self) -> Result<()> {
        if self.registration.is_none() {
            self.registration = Some(self.channel.register(Arc::clone(&self.receiver)));
        }
        Ok(())
    }

    fn send_to(&mut self, target: Ipv4Addr, packet: &[u8]) -> Result<()> {
        self.channel.send_to(target, packet)
    }

    fn close(&mut self) {
        self.registration = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ipv4::Ipv4Packet;
    use std::sync::atomic::AtomicUsize;

    const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);

    fn counting(consume: bool) -> (Receiver, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let receiver: Receiver = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            consume
        });
        (receiver, calls)
    }

    #[test]
    fn test_dispatch_stops_at_first_consumer() {
        let registry = Arc::new(Registry::default());
        let (skip, skipped) = counting(false);
        let (take, taken) = counting(true);
        let (late, never) = counting(true);
        let _a = registry.register(skip);
        let _b = registry.register(take);
        let _c = registry.register(late);

        assert!(registry.dispatch(SOURCE, &[]));
        assert_eq!(skipped.load(Ordering::SeqCst), 1);
        assert_eq!(taken.load(Ordering::SeqCst), 1);
        assert_eq!(never.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unclaimed_packet() {
        let registry = Arc::new(Registry::default());
        let (skip, _) = counting(false);
        let _a = registry.register(skip);
        assert!(!registry.dispatch(SOURCE, &[]));
    }

    #[test]
    fn test_dropping_registration_unregisters() {
        let registry = Arc::new(Registry::default());
        let (take, taken) = counting(true);
        let registration = registry.register(take);
        assert_eq!(registry.len(), 1);
        drop(registration);
        assert_eq!(registry.len(), 0);
        assert!(!registry.dispatch(SOURCE, &[]));
        assert_eq!(taken.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registration_outlives_registry() {
        let registry = Arc::new(Registry::default());
        let (take, _) = counting(true);
        let registration = registry.register(take);
        drop(registry);
        drop(registration);
    }

    #[test]
    fn test_wrap_ipv4() {
        let icmp = [8u8; ECHO_PACKET_LEN];
        let target = Ipv4Addr::new(192, 168, 1, 1);
        let mut buf = [0; IPV4_HEADER_LEN + ECHO_PACKET_LEN];
        let datagram = wrap_ipv4(&mut buf, target, &icmp).unwrap().packet().to_vec();

        let ip = Ipv4Packet::new(&datagram).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_total_length() as usize, IPV4_HEADER_LEN + ECHO_PACKET_LEN);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Icmp);
        assert_eq!(ip.get_destination(), target);
        assert_eq!(ip.get_ttl(), OUTGOING_TTL);
        assert_eq!(ip.payload(), &icmp[..]);
        assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));
    }

    #[test]
    fn test_wrap_ipv4_rejects_oversized() {
        let icmp = [0u8; ECHO_PACKET_LEN + 1];
        let mut buf = [0; IPV4_HEADER_LEN + ECHO_PACKET_LEN];
        assert!(wrap_ipv4(&mut buf, Ipv4Addr::LOCALHOST, &icmp).is_none());
    }

    #[test]
    #[ignore = "requires CAP_NET_RAW"]
    fn test_open_channel() {
        let channel = IcmpChannel::open().unwrap();
        let (take, _) = counting(true);
        let mut transport = ChannelTransport::new(Arc::clone(&channel), take);
        assert!(!transport.is_open());
        transport.open().unwrap();
        transport.open().unwrap();
        assert!(transport.is_open());
        assert_eq!(channel.receivers(), 1);
        transport.close();
        assert!(!transport.is_open());
        assert_eq!(channel.receivers(), 0);
    }
}
