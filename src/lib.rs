//! # async-ping
//!
//! A non-blocking ICMP echo ("ping") session for one target at a time. Each
//! [`Pinger`] sends a bounded number of echo requests, one after the other,
//! matches replies against the outstanding request, measures round-trip time
//! and responder TTL, and optionally looks up the responder's MAC address over
//! ARP. Results are reported per probe and once at the end through callbacks.
//!
//! Any number of pingers can share a single raw [`IcmpChannel`]. The state
//! machine itself lives in [`session::Session`] and knows nothing about
//! sockets or runtimes, so it can be driven by other transports and clocks.
//!
//! Opening an [`IcmpChannel`] requires `CAP_NET_RAW` (or root).
//!
//! ## Example
//! Pinging a host from the command line, with an optional interface for link-address lookup:
//! ```rust,no_run
#![doc = include_str!("../demos/ping.rs")]
//! ```

pub mod arp;
pub mod channel;
pub mod client;
pub mod constants;
pub mod error;
pub mod net;
pub mod packet;
pub mod probe;
pub mod resolve;
pub mod session;
pub mod timer;

pub(crate) mod caching;
pub(crate) mod request;
pub(crate) mod response;

pub use arp::{ArpClient, ArpConfig, ArpConfigBuilder, ArpLinkResolver};
pub use channel::IcmpChannel;
pub use client::{Pinger, PingerBuilder};
pub use error::{Error, Result};
pub use probe::{ProbeResult, SessionStats};
pub use resolve::Target;
pub use session::{Session, State};
