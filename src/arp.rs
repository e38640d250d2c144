//! Link-layer address lookup over ARP.

use afpacket::tokio::RawPacketStream;
use log::{debug, trace};
use pnet::datalink::{self, NetworkInterface};
use pnet::util::MacAddr;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::Mutex;

use crate::caching::LinkCache;
use crate::client::BackgroundTaskSpawner;
use crate::error::{Error, Result};
use crate::net::{LinkLookup, LinkResolver};
use crate::request::{who_has, Sender};
use crate::response::Listener;

#[derive(Debug, Clone)]
pub struct ArpConfig {
    pub interface_name: String,
    pub response_timeout: Duration,
    pub cache_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ArpConfigBuilder {
    interface_name: String,
    response_timeout: Duration,
    cache_timeout: Duration,
}

impl ArpConfigBuilder {
    pub fn new(interface_name: &str) -> Self {
        Self {
            interface_name: interface_name.into(),
            response_timeout: Duration::from_secs(1),
            cache_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    pub fn build(self) -> ArpConfig {
        ArpConfig {
            interface_name: self.interface_name,
            response_timeout: self.response_timeout,
            cache_timeout: self.cache_timeout,
        }
    }
}

/// Resolves neighbours on one interface by broadcasting ARP requests.
///
/// Every reply seen on the interface is cached, whether or not it was asked for.
///
/// # Example
/// ```no_run
/// use async_ping::{ArpClient, ArpConfigBuilder};
/// use std::net::Ipv4Addr;
///
/// tokio_test::block_on(async {
///     let client = ArpClient::new(ArpConfigBuilder::new("eth0").build()).unwrap();
///     let mac = client.resolve(Ipv4Addr::new(192, 168, 1, 1)).await.unwrap();
///     println!("192.168.1.1 is at {}", mac);
/// })
/// ```
pub struct ArpClient {
    interface: NetworkInterface,
    sender: Sender,
    response_timeout: Duration,
    stream: Mutex<RawPacketStream>,
    cache: Arc<LinkCache>,
    _task_spawner: BackgroundTaskSpawner,
}

impl ArpClient {
    /// Binds a raw packet stream to the configured interface and starts listening for replies.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the interface does not exist, lacks a MAC or IPv4
    /// address, or if the packet stream cannot be created or bound.
    pub fn new(config: ArpConfig) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == config.interface_name)
            .ok_or_else(|| {
                Error::Opaque(format!("interface {} not found", config.interface_name).into())
            })?;
        let mac = interface
            .mac
            .ok_or(Error::InvalidArgument("interface does not have a MAC address"))?;
        let ip = interface
            .ips
            .iter()
            .find_map(|net| match net.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or(Error::InvalidArgument("interface does not have an IPv4 address"))?;

        let mut stream = RawPacketStream::new().map_err(|err| {
            Error::Opaque(format!("failed to create packet stream, reason: {}", err).into())
        })?;
        stream.bind(&config.interface_name).map_err(|err| {
            Error::Opaque(format!("failed to bind interface to stream, reason {}", err).into())
        })?;

        let cache = Arc::new(LinkCache::new(config.cache_timeout));
        let mut task_spawner = BackgroundTaskSpawner::new();
        let mut listener = Listener::new(stream.clone(), Arc::clone(&cache));
        task_spawner.spawn(async move {
            if let Err(err) = listener.listen().await {
                debug!("ARP listener stopped: {}", err);
            }
        });

        Ok(Self {
            interface,
            sender: Sender { mac, ip },
            response_timeout: config.response_timeout,
            stream: Mutex::new(stream),
            cache,
            _task_spawner: task_spawner,
        })
    }

    /// Whether `addr` lies in one of the interface's IPv4 networks.
    pub fn on_link(&self, addr: Ipv4Addr) -> bool {
        self.interface
            .ips
            .iter()
            .any(|net| net.is_ipv4() && net.contains(IpAddr::V4(addr)))
    }

    pub fn cached(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        self.cache.get(&addr)
    }

    /// Returns the link-layer address of `target_ip`, asking the network if it is not cached.
    ///
    /// # Errors
    /// Returns [`Error::ResponseTimeout`] if nobody answers within the response
    /// timeout, or an opaque error if the request cannot be sent.
    pub async fn resolve(&self, target_ip: Ipv4Addr) -> Result<MacAddr> {
        let response = self.cache.subscribe(target_ip);
        if let Some(cached) = self.cache.get(&target_ip) {
            drop(response);
            self.cache.prune(&target_ip);
            return Ok(cached);
        }
        let frame = who_has(self.sender, target_ip);
        let sent = self.stream.lock().await.write_all(&frame).await;
        if let Err(err) = sent {
            drop(response);
            self.cache.prune(&target_ip);
            return Err(Error::Opaque(
                format!("failed to send request, reason: {}", err).into(),
            ));
        }
        trace!("who-has {} sent on {}", target_ip, self.interface.name);

        let outcome = match tokio::time::timeout(self.response_timeout, response).await {
            Ok(Ok(mac)) => return Ok(mac),
            Ok(Err(_)) => Err(Error::Opaque("ARP listener stopped".into())),
            Err(_) => Err(Error::ResponseTimeout),
        };
        self.cache.prune(&target_ip);
        outcome
    }
}

impl fmt::Debug for ArpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArpClient")
            .field("interface", &self.interface.name)
            .field("sender", &self.sender)
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

/// Called with the answer to a lookup that returned [`LinkLookup::Pending`].
pub type LinkSink = Arc<dyn Fn(Ipv4Addr, MacAddr) + Send + Sync>;

/// A [`LinkResolver`] backed by an [`ArpClient`].
///
/// Cached neighbours resolve immediately; anything else on-link is looked up
/// on the runtime and handed to `deliver` once answered.
pub struct ArpLinkResolver {
    client: Arc<ArpClient>,
    runtime: Handle,
    deliver: LinkSink,
}

impl ArpLinkResolver {
    pub fn new(client: Arc<ArpClient>, runtime: Handle, deliver: LinkSink) -> Self {
        Self {
            client,
            runtime,
            deliver,
        }
    }
}

impl LinkResolver for ArpLinkResolver {
    fn lookup(&mut self, addr: Ipv4Addr) -> LinkLookup {
        if let Some(mac) = self.client.cached(addr) {
            return LinkLookup::Resolved(mac);
        }
        if !self.client.on_link(addr) {
            trace!("{} is not on-link, skipping ARP", addr);
            return LinkLookup::Unavailable;
        }
        let client = Arc::clone(&self.client);
        let deliver = Arc::clone(&self.deliver);
        self.runtime.spawn(async move {
            match client.resolve(addr).await {
                Ok(mac) => deliver(addr, mac),
                Err(err) => debug!("link address of {} unavailable: {}", addr, err),
            }
        });
        LinkLookup::Pending
    }
}

impl fmt::Debug for ArpLinkResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArpLinkResolver")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
