//! A single-writer orchestrator for Network Service Discovery (NSD).
//!
//! This library multiplexes many client applications onto an mDNS / DNS-SD
//! (RFC 6762 / RFC 6763) discovery, resolution and advertising backend. It
//! creates one worker thread that owns all service state, and exposes an API
//! that interacts with that thread via [`flume`](https://crates.io/crates/flume)
//! channels. The channels support both `recv()` and `recv_async()`.
//!
//! A client discovering a service type behaves like this:
//!```text
//!  Client       <channel>          orchestrator thread
//!    |                                | runs its event loop.
//!    |  -- DiscoverServices -->       |
//!    |  <-- DiscoverServicesStarted - | forwards to a backend
//!    |                                | backend reports instance A
//!    |  <-- ServiceFound(A) --        |
//!    |           ...                  |
//!    |  -- StopDiscovery -->          |
//!    |  <-- StopDiscoverySucceeded -  |
//!```
//!
//! Two interchangeable backends serve each request: a legacy out-of-process
//! mDNS daemon driven through four operation verbs, and a modern in-process
//! engine driven through per-request listeners. The orchestrator picks one
//! per request based on the client's preference, global feature flags and a
//! per-service-type allowlist, and routes every asynchronous backend event
//! back to the originating client channel.
//!
//! All commands in the public API are posted to the worker thread with
//! non-blocking sends, so the API can be used from both sync and async code
//! with no dependency on any particular async runtime.
//!
//! # Usage
//!
//! The embedding process wires the backends (see [`backend`]) into
//! [`NsdDependencies`] and creates one [`NsdService`]. Each client app then
//! calls [`connect`](NsdService::connect) to obtain a [`Connector`] carrying
//! its identity plus a [`Receiver`] of [`ClientEvent`]s, and issues verbs
//! such as [`discover_services`](Connector::discover_services) or
//! [`register_service`](Connector::register_service) against the connector.
//! Dropping the connector cancels everything the client had outstanding.
//!
//! The orchestrator itself never parses or emits mDNS packets and performs
//! no network I/O; the backends do.

#![forbid(unsafe_code)]
#![allow(clippy::single_component_path_imports)]

// log for logging (optional).
#[cfg(feature = "logging")]
use log;

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    macro_rules! trace    ( ($($tt:tt)*) => {{}} );
    macro_rules! debug    ( ($($tt:tt)*) => {{}} );
    macro_rules! info     ( ($($tt:tt)*) => {{}} );
    macro_rules! warn     ( ($($tt:tt)*) => {{}} );
    macro_rules! error    ( ($($tt:tt)*) => {{}} );
}

pub mod backend;
mod client;
mod error;
mod orchestrator;
mod service_info;
mod service_type;
mod shared_log;

pub use client::{ClientEvent, NsdError};
pub use error::{Error, Result};
pub use orchestrator::{
    AdvertiserEventSender, Connector, DaemonEvent, DaemonEventSender, DaemonStatus, MdnsListener,
    NsdDependencies, NsdService, NsdState, OffloadEngineToken, SocketRequestMonitor,
    CLEANUP_DELAY_MS,
};
pub use service_info::{
    Network, NsdServiceInfo, TxtEntry, DUMMY_NET_ID, LOCAL_NET_ID, NETID_UNSET,
};
pub use service_type::{parse_type_and_subtype, truncate_service_name, unescape};

/// A handler to receive messages from [NsdService]. Re-export from `flume` crate.
pub use flume::Receiver;
