//! Interfaces the orchestrator consumes from its mDNS backends and from the
//! platform.
//!
//! The orchestrator never performs network I/O itself. Everything below is a
//! seam: the embedding process supplies implementations (real backends, or
//! fakes under test) and the orchestrator drives them from its single worker
//! thread. Implementations must not call back into the orchestrator
//! synchronously; asynchronous events are posted through the sender handles
//! exported from the crate root ([`DaemonEventSender`],
//! [`AdvertiserEventSender`], [`SocketRequestMonitor`]).
//!
//! [`DaemonEventSender`]: crate::DaemonEventSender
//! [`AdvertiserEventSender`]: crate::AdvertiserEventSender
//! [`SocketRequestMonitor`]: crate::SocketRequestMonitor

use crate::orchestrator::DaemonEventSender;
use crate::service_info::{Network, NsdServiceInfo, TxtEntry};
use std::collections::HashMap;
use std::sync::Arc;

/// Sentinel packet count for unregistrations served by the legacy daemon,
/// which reports no traffic counters.
pub const NO_PACKET: i32 = -1;

/// The operation verbs of the legacy out-of-process mDNS daemon.
///
/// The daemon identifies every operation by the caller-chosen transaction id
/// and reports progress through [`MDnsEvent`]s posted on the registered
/// event sender. Verbs return `false` when the daemon rejects the operation
/// outright.
pub trait LegacyDaemon: Send {
    fn start_daemon(&self);
    fn stop_daemon(&self);

    /// Registers the channel on which the daemon posts its events. Called
    /// before `start_daemon`.
    fn register_event_listener(&self, events: DaemonEventSender);
    fn unregister_event_listener(&self);

    fn register_service(
        &self,
        transaction_id: i32,
        service_name: &str,
        service_type: &str,
        port: u16,
        txt_record: &[u8],
        interface_idx: u32,
    ) -> bool;

    fn discover(&self, transaction_id: i32, service_type: &str, interface_idx: u32) -> bool;

    fn resolve(
        &self,
        transaction_id: i32,
        service_name: &str,
        service_type: &str,
        domain: &str,
        interface_idx: u32,
    ) -> bool;

    fn get_service_address(&self, transaction_id: i32, hostname: &str, interface_idx: u32)
        -> bool;

    /// Cancels the operation with `transaction_id`, whatever its verb was.
    fn stop_operation(&self, transaction_id: i32) -> bool;
}

/// Asynchronous events from the legacy daemon, keyed by transaction id.
#[derive(Clone, Debug)]
pub enum MDnsEvent {
    ServiceFound {
        transaction_id: i32,
        service_name: String,
        registration_type: String,
        net_id: i32,
        interface_idx: u32,
    },
    ServiceLost {
        transaction_id: i32,
        service_name: String,
        registration_type: String,
        net_id: i32,
        interface_idx: u32,
    },
    DiscoveryFailed {
        transaction_id: i32,
    },
    ServiceRegistered {
        transaction_id: i32,
        service_name: String,
    },
    RegistrationFailed {
        transaction_id: i32,
    },
    /// The first phase of a resolve: the instance's SRV and TXT data.
    ServiceResolved {
        transaction_id: i32,
        /// Fully escaped `<instance>.<type>.<domain>.` name.
        service_full_name: String,
        hostname: String,
        port: u16,
        txt_record: Vec<u8>,
        interface_idx: u32,
    },
    ResolutionFailed {
        transaction_id: i32,
    },
    /// The second phase of a resolve: the host's address lookup.
    GetAddressSuccess {
        transaction_id: i32,
        address: String,
        net_id: i32,
        interface_idx: u32,
    },
    GetAddressFailed {
        transaction_id: i32,
    },
}

impl MDnsEvent {
    pub fn transaction_id(&self) -> i32 {
        match self {
            Self::ServiceFound { transaction_id, .. }
            | Self::ServiceLost { transaction_id, .. }
            | Self::DiscoveryFailed { transaction_id }
            | Self::ServiceRegistered { transaction_id, .. }
            | Self::RegistrationFailed { transaction_id }
            | Self::ServiceResolved { transaction_id, .. }
            | Self::ResolutionFailed { transaction_id }
            | Self::GetAddressSuccess { transaction_id, .. }
            | Self::GetAddressFailed { transaction_id } => *transaction_id,
        }
    }
}

/// Options for one modern-engine listener registration.
#[derive(Clone, Debug, Default)]
pub struct MdnsSearchOptions {
    pub network: Option<Network>,
    /// Subtype to browse for, without the leading underscore.
    pub subtype: Option<String>,
    /// Set to resolve one instance instead of browsing the whole type.
    pub resolve_instance_name: Option<String>,
    pub passive_mode: bool,
    pub remove_expired_service: bool,
}

/// A discovered or resolved service as reported by the modern engine.
#[derive(Clone, Debug, Default)]
pub struct MdnsServiceInfo {
    pub instance_name: String,
    /// Service type as a label sequence; the last label must be `local`.
    pub service_type_labels: Vec<String>,
    pub port: u16,
    pub attributes: Vec<TxtEntry>,
    pub ipv4_addresses: Vec<String>,
    pub ipv6_addresses: Vec<String>,
    /// `None` means the service was seen on an interface without an
    /// app-usable network, such as a tethering downstream.
    pub network: Option<Network>,
    pub interface_index: u32,
}

/// The modern in-process discovery engine.
///
/// The engine serves one listener per orchestrator request and invokes the
/// listener's callbacks from its own threads; the listener posts the events
/// back onto the orchestrator loop.
pub trait DiscoveryEngine: Send {
    fn register_listener(
        &self,
        service_type: &str,
        listener: Arc<crate::orchestrator::MdnsListener>,
        options: MdnsSearchOptions,
    );

    fn unregister_listener(
        &self,
        service_type: &str,
        listener: &Arc<crate::orchestrator::MdnsListener>,
    );
}

/// Per-registration traffic counters reported by the modern advertiser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdvertiserMetrics {
    pub replied_requests_count: i32,
    pub sent_packet_count: i32,
    pub conflict_during_probing_count: i32,
    pub conflict_after_probing_count: i32,
}

impl AdvertiserMetrics {
    /// The metrics reported for legacy-daemon registrations, which carry no
    /// packet counters.
    pub fn no_packet() -> Self {
        Self {
            replied_requests_count: NO_PACKET,
            sent_packet_count: NO_PACKET,
            conflict_during_probing_count: 0,
            conflict_after_probing_count: 0,
        }
    }
}

/// A service advertised on one interface, as handed to offload engines.
///
/// The orchestrator treats this as opaque apart from `offload_type`, which
/// routes the update to interested engines.
#[derive(Clone, Debug)]
pub struct OffloadServiceInfo {
    pub service_name: String,
    pub service_type: String,
    pub hostname: String,
    pub offload_payload: Vec<u8>,
    pub priority: u32,
    pub offload_type: u64,
}

/// Fan-out events delivered to a registered offload engine.
#[derive(Clone, Debug)]
pub enum OffloadEvent {
    Updated(OffloadServiceInfo),
    Removed(OffloadServiceInfo),
}

/// The modern in-process advertiser.
pub trait ServiceAdvertiser: Send {
    fn add_service(&self, transaction_id: i32, service: NsdServiceInfo, subtype: Option<&str>);

    fn remove_service(&self, transaction_id: i32);

    fn get_advertiser_metrics(&self, transaction_id: i32) -> AdvertiserMetrics;

    /// Snapshot of the services currently advertised on `interface_name`,
    /// replayed to a newly registered offload engine.
    fn all_offload_services_for_interface(&self, interface_name: &str) -> Vec<OffloadServiceInfo>;
}

/// The multicast socket provider feeding the modern engine.
pub trait SocketProvider: Send {
    fn start_monitoring_sockets(&self);

    /// Asks the provider to wind down once its sockets go idle. The provider
    /// may keep running until then.
    fn request_stop_when_inactive(&self);
}

/// The platform-level multicast lock. Acquire keeps Wi-Fi multicast
/// filtering off while any active app needs discovery on such a network.
pub trait MulticastLock: Send {
    fn acquire(&self);
    fn release(&self);
}

/// Network transports, as reported with a fulfilled socket request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Cellular,
    Wifi,
    Bluetooth,
    Ethernet,
    Vpn,
}

/// Resolves platform networks to OS interfaces for the legacy daemon, which
/// addresses operations by interface index.
pub trait LinkResolver: Send {
    /// The interface carrying `network`, if its link is currently known.
    fn interface_name_for_network(&self, network: Network) -> Option<String>;

    /// The OS interface index for `interface_name`.
    fn interface_index_by_name(&self, interface_name: &str) -> Option<u32>;
}

/// [`LinkResolver`] backed by the host's interface table.
///
/// It cannot map networks to links (that attribution only exists inside the
/// platform's connectivity stack), so requests pinned to a network fail
/// unless the embedder provides a full resolver.
pub struct SystemLinkResolver;

impl LinkResolver for SystemLinkResolver {
    fn interface_name_for_network(&self, _network: Network) -> Option<String> {
        None
    }

    fn interface_index_by_name(&self, interface_name: &str) -> Option<u32> {
        let ifaddrs = if_addrs::get_if_addrs().ok()?;
        ifaddrs
            .into_iter()
            .find(|intf| intf.name == interface_name)
            .and_then(|intf| intf.index)
    }
}

/// Read access to runtime configuration flags and properties.
pub trait DeviceConfig: Send {
    fn get_property(&self, key: &str) -> Option<String>;

    fn is_feature_enabled(&self, feature: &str) -> bool;

    fn get_int(&self, key: &str, default: i32) -> i32 {
        self.get_property(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }
}

/// A fixed [`DeviceConfig`] backed by a map. Features are enabled when their
/// value is `true` or `1`.
#[derive(Default)]
pub struct StaticDeviceConfig {
    properties: HashMap<String, String>,
}

impl StaticDeviceConfig {
    pub fn new(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }
}

impl DeviceConfig for StaticDeviceConfig {
    fn get_property(&self, key: &str) -> Option<String> {
        self.properties.get(key).cloned()
    }

    fn is_feature_enabled(&self, feature: &str) -> bool {
        matches!(
            self.properties.get(feature).map(String::as_str),
            Some("true") | Some("1")
        )
    }
}

/// Sink for usage metrics, reported at request start and on every terminal
/// transition. All methods default to no-ops so a sink implements only what
/// it records.
#[allow(unused_variables)]
pub trait MetricsSink: Send + Sync {
    fn report_service_discovery_started(&self, transaction_id: i32) {}

    fn report_service_discovery_failed(&self, transaction_id: i32, duration_ms: u64) {}

    fn report_service_discovery_stop(
        &self,
        transaction_id: i32,
        duration_ms: u64,
        found_count: u32,
        lost_count: u32,
        services_count: usize,
        sent_query_count: u32,
    ) {
    }

    fn report_service_registration_succeeded(&self, transaction_id: i32, duration_ms: u64) {}

    fn report_service_registration_failed(&self, transaction_id: i32, duration_ms: u64) {}

    fn report_service_unregistration(
        &self,
        transaction_id: i32,
        duration_ms: u64,
        metrics: &AdvertiserMetrics,
    ) {
    }

    fn report_service_resolved(
        &self,
        transaction_id: i32,
        duration_ms: u64,
        is_service_from_cache: bool,
        sent_query_count: u32,
    ) {
    }

    fn report_service_resolution_failed(&self, transaction_id: i32, duration_ms: u64) {}

    fn report_service_resolution_stop(&self, transaction_id: i32, duration_ms: u64) {}

    fn report_service_info_callback_registered(&self, transaction_id: i32) {}

    fn report_service_info_callback_registration_failed(&self, transaction_id: i32) {}

    fn report_service_info_callback_unregistered(
        &self,
        transaction_id: i32,
        duration_ms: u64,
        found_count: u32,
        lost_count: u32,
        is_service_from_cache: bool,
        sent_query_count: u32,
    ) {
    }
}

/// A [`MetricsSink`] that records nothing.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
