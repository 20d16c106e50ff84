//! The NSD orchestrator: a single-writer state machine multiplexing client
//! apps onto the mDNS backends.
//!
//! One worker thread owns every registry. External inputs (client verbs,
//! backend events, process-importance changes, socket updates, the cleanup
//! timer) arrive as [`Command`]s on an unbounded channel and are handled
//! strictly serially. Dispatch is two-level: the `Enabled` state handles the
//! operational verbs and backend events, and falls through to the `Default`
//! state for client registration, daemon lifecycle and everything that must
//! keep working outside the enabled state.

#[cfg(feature = "logging")]
use crate::log::{debug, error, info};
use crate::backend::{
    AdvertiserMetrics, DeviceConfig, DiscoveryEngine, LegacyDaemon, LinkResolver, MDnsEvent,
    MdnsSearchOptions, MdnsServiceInfo, MetricsSink, MulticastLock, NoopMetrics, OffloadEvent,
    OffloadServiceInfo, ServiceAdvertiser, SocketProvider, StaticDeviceConfig,
    SystemLinkResolver, Transport,
};
use crate::client::{ClientEvent, ClientInfo, ClientRequest, LegacyVerb, NsdError, RequestHeader, MAX_LIMIT};
use crate::error::{e_fmt, Error, Result};
use crate::service_info::{Network, NsdServiceInfo, DUMMY_NET_ID, LOCAL_NET_ID, NETID_UNSET};
use crate::service_info::{encode_txt_record, parse_txt_record};
use crate::service_type::{
    parse_type_and_subtype, split_escaped_instance, truncate_service_name, unescape,
    MAX_LABEL_LENGTH,
};
use crate::shared_log::{current_time_millis, SharedLog};
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Delay before the legacy daemon is stopped once the last legacy request is
/// gone and no pre-S client remains.
pub const CLEANUP_DELAY_MS: u64 = 10_000;

/// Interface index wildcard for legacy daemon operations.
const IFACE_IDX_ANY: u32 = 0;

/// The transaction id value never handed out.
const INVALID_TRANSACTION_ID: i32 = 0;

/// How many handled messages the state machine remembers for `dump`.
const STATE_LOG_RECORD_SIZE: usize = 25;

const LOCAL_DOMAIN_NAME: &str = "local";

// Runtime configuration keys.
const MDNS_DISCOVERY_MANAGER_VERSION: &str = "mdns_discovery_manager_version";
const MDNS_ADVERTISER_VERSION: &str = "mdns_advertiser_version";
const MDNS_TYPE_ALLOWLIST_FLAGS: &str = "mdns_type_allowlist_flags";
const MDNS_DISCOVERY_MANAGER_ALLOWLIST_FLAG_PREFIX: &str = "mdns_discovery_manager_allowlist_";
const MDNS_ADVERTISER_ALLOWLIST_FLAG_PREFIX: &str = "mdns_advertiser_allowlist_";
const MDNS_ALLOWLIST_FLAG_SUFFIX: &str = "_version";
const MDNS_CONFIG_RUNNING_APP_ACTIVE_IMPORTANCE_CUTOFF: &str =
    "mdns_config_running_app_active_importance_cutoff";
const DEFAULT_RUNNING_APP_ACTIVE_IMPORTANCE_CUTOFF: i32 = 100;

/// Whether network service discovery is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NsdState {
    Enabled,
    Disabled,
}

/// Status code for the orchestrator thread.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DaemonStatus {
    /// The orchestrator is running as normal.
    Running,
    /// The orchestrator has been shut down.
    Shutdown,
}

/// Notable service-level events, received through [`NsdService::monitor`].
///
/// The state broadcast is sticky: a new monitor immediately receives the
/// current [`NsdState`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DaemonEvent {
    StateChanged(NsdState),
}

/// Identifies one registered offload engine for unregistration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffloadEngineToken(i64);

/// A handle and API to the orchestrator thread. It is cloneable.
#[derive(Clone)]
pub struct NsdService {
    sender: Sender<Command>,
    next_connector_id: Arc<AtomicI64>,
    next_offload_engine_id: Arc<AtomicI64>,
}

/// Everything the orchestrator consumes from the embedding process.
pub struct NsdDependencies {
    pub legacy_daemon: Box<dyn LegacyDaemon>,
    pub discovery_engine: Box<dyn DiscoveryEngine>,
    pub advertiser: Box<dyn ServiceAdvertiser>,
    pub socket_provider: Box<dyn SocketProvider>,
    pub multicast_lock: Box<dyn MulticastLock>,
    pub link_resolver: Box<dyn LinkResolver>,
    pub device_config: Box<dyn DeviceConfig>,
    pub metrics: Arc<dyn MetricsSink>,
    pub cleanup_delay_ms: u64,
}

impl NsdDependencies {
    /// Wires the five required backends and defaults the rest: the system
    /// link resolver, an empty device config, no metrics, and the standard
    /// cleanup delay.
    pub fn new(
        legacy_daemon: Box<dyn LegacyDaemon>,
        discovery_engine: Box<dyn DiscoveryEngine>,
        advertiser: Box<dyn ServiceAdvertiser>,
        socket_provider: Box<dyn SocketProvider>,
        multicast_lock: Box<dyn MulticastLock>,
    ) -> Self {
        Self {
            legacy_daemon,
            discovery_engine,
            advertiser,
            socket_provider,
            multicast_lock,
            link_resolver: Box::new(SystemLinkResolver),
            device_config: Box::new(StaticDeviceConfig::default()),
            metrics: Arc::new(NoopMetrics),
            cleanup_delay_ms: CLEANUP_DELAY_MS,
        }
    }
}

fn send_cmd(sender: &Sender<Command>, command: Command) -> Result<()> {
    sender.send(command).map_err(|_| Error::Shutdown)
}

impl NsdService {
    /// Creates the orchestrator and spawns its worker thread.
    pub fn new(deps: NsdDependencies) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let orchestrator = Orchestrator::new(deps, sender.clone());

        thread::Builder::new()
            .name("nsd_orchestrator".to_string())
            .spawn(move || Self::orchestrator_thread(orchestrator, receiver))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(Self {
            sender,
            next_connector_id: Arc::new(AtomicI64::new(1)),
            next_offload_engine_id: Arc::new(AtomicI64::new(1)),
        })
    }

    fn orchestrator_thread(orchestrator: Orchestrator, receiver: Receiver<Command>) {
        if let Some(command) = orchestrator.run(receiver) {
            match command {
                Command::Exit(resp_s) => {
                    if let Err(e) = resp_s.send(DaemonStatus::Shutdown) {
                        debug!("exit: failed to send response of shutdown: {}", e);
                    }
                }
                _ => debug!("unexpected final command: {}", command),
            }
        }
    }

    /// Connects one client application.
    ///
    /// Returns the connector carrying the client's identity and the channel
    /// its callbacks arrive on. `uid` is the caller identity the embedding
    /// transport authenticated; `use_modern_backend` is the client's hint to
    /// serve every request from the modern engine.
    pub fn connect(
        &self,
        uid: u32,
        use_modern_backend: bool,
    ) -> Result<(Connector, Receiver<ClientEvent>)> {
        let connector_id = self.next_connector_id.fetch_add(1, Ordering::Relaxed);
        let (callback, events) = flume::unbounded();
        send_cmd(
            &self.sender,
            Command::RegisterClient {
                connector_id,
                callback,
                uid,
                use_modern_backend,
            },
        )?;
        Ok((
            Connector {
                connector_id,
                sender: self.sender.clone(),
                next_offload_engine_id: self.next_offload_engine_id.clone(),
            },
            events,
        ))
    }

    /// Starts to monitor notable events from the orchestrator.
    pub fn monitor(&self) -> Result<Receiver<DaemonEvent>> {
        let (resp_s, resp_r) = flume::bounded(100);
        send_cmd(&self.sender, Command::Monitor(resp_s))?;
        Ok(resp_r)
    }

    /// Reports a process-importance change for `uid`. Lower importance
    /// values are more "important".
    pub fn notify_uid_importance(&self, uid: u32, importance: i32) -> Result<()> {
        send_cmd(&self.sender, Command::UidImportanceChanged { uid, importance })
    }

    /// The handle the socket provider reports socket lifecycle through.
    pub fn socket_monitor(&self) -> SocketRequestMonitor {
        SocketRequestMonitor {
            sender: self.sender.clone(),
        }
    }

    /// The handle the advertiser posts its asynchronous events through.
    pub fn advertiser_event_sender(&self) -> AdvertiserEventSender {
        AdvertiserEventSender {
            sender: self.sender.clone(),
        }
    }

    /// Returns a plain-text dump of recent state machine records and service
    /// logs, reverse-chronological.
    pub fn dump(&self) -> Result<Receiver<String>> {
        let (resp_s, resp_r) = flume::bounded(1);
        send_cmd(&self.sender, Command::Dump(resp_s))?;
        Ok(resp_r)
    }

    /// Shuts down the orchestrator thread and returns a channel to receive
    /// the final status.
    pub fn shutdown(&self) -> Result<Receiver<DaemonStatus>> {
        let (resp_s, resp_r) = flume::bounded(1);
        send_cmd(&self.sender, Command::Exit(resp_s))?;
        Ok(resp_r)
    }
}

/// One client's connection. Verbs are posted to the orchestrator with
/// non-blocking sends; results arrive on the client's event channel keyed by
/// the caller-chosen `listener_key`.
///
/// Dropping the connector is the death notification: the orchestrator then
/// cancels every outstanding request of this client.
pub struct Connector {
    connector_id: i64,
    sender: Sender<Command>,
    next_offload_engine_id: Arc<AtomicI64>,
}

impl Connector {
    fn send_cmd(&self, command: Command) -> Result<()> {
        send_cmd(&self.sender, command)
    }

    pub fn register_service(&self, listener_key: i32, info: NsdServiceInfo) -> Result<()> {
        self.send_cmd(Command::RegisterService {
            connector_id: self.connector_id,
            listener_key,
            info,
        })
    }

    pub fn unregister_service(&self, listener_key: i32) -> Result<()> {
        self.send_cmd(Command::UnregisterService {
            connector_id: self.connector_id,
            listener_key,
        })
    }

    pub fn discover_services(&self, listener_key: i32, info: NsdServiceInfo) -> Result<()> {
        self.send_cmd(Command::DiscoverServices {
            connector_id: self.connector_id,
            listener_key,
            info,
        })
    }

    pub fn stop_discovery(&self, listener_key: i32) -> Result<()> {
        self.send_cmd(Command::StopDiscovery {
            connector_id: self.connector_id,
            listener_key,
        })
    }

    pub fn resolve_service(&self, listener_key: i32, info: NsdServiceInfo) -> Result<()> {
        self.send_cmd(Command::ResolveService {
            connector_id: self.connector_id,
            listener_key,
            info,
        })
    }

    pub fn stop_resolution(&self, listener_key: i32) -> Result<()> {
        self.send_cmd(Command::StopResolution {
            connector_id: self.connector_id,
            listener_key,
        })
    }

    pub fn register_service_info_callback(
        &self,
        listener_key: i32,
        info: NsdServiceInfo,
    ) -> Result<()> {
        self.send_cmd(Command::RegisterServiceCallback {
            connector_id: self.connector_id,
            listener_key,
            info,
        })
    }

    pub fn unregister_service_info_callback(&self, listener_key: i32) -> Result<()> {
        self.send_cmd(Command::UnregisterServiceCallback {
            connector_id: self.connector_id,
            listener_key,
        })
    }

    /// Legacy clients drive the native daemon startup explicitly; issuing
    /// this also marks the client as pre-S, keeping the daemon alive while
    /// the client is connected.
    pub fn start_daemon(&self) -> Result<()> {
        self.send_cmd(Command::StartDaemon {
            connector_id: self.connector_id,
        })
    }

    /// Registers an offload engine for `interface_name`. The engine receives
    /// updates for advertised services whose offload type intersects
    /// `offload_types`, starting with a snapshot of what is currently
    /// advertised on that interface.
    pub fn register_offload_engine(
        &self,
        interface_name: &str,
        offload_capabilities: u64,
        offload_types: u64,
    ) -> Result<(OffloadEngineToken, Receiver<OffloadEvent>)> {
        let engine_id = self.next_offload_engine_id.fetch_add(1, Ordering::Relaxed);
        let (callback, events) = flume::unbounded();
        self.send_cmd(Command::RegisterOffloadEngine {
            engine_id,
            interface_name: interface_name.to_string(),
            offload_capabilities,
            offload_types,
            callback,
        })?;
        Ok((OffloadEngineToken(engine_id), events))
    }

    pub fn unregister_offload_engine(&self, token: OffloadEngineToken) -> Result<()> {
        self.send_cmd(Command::UnregisterOffloadEngine {
            engine_id: token.0,
        })
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Err(e) = self.sender.send(Command::UnregisterClient {
            connector_id: self.connector_id,
        }) {
            debug!("orchestrator is gone, dropping client unregistration: {}", e);
        }
    }
}

/// The channel the legacy daemon posts its events through. Handed to the
/// daemon via `register_event_listener` before startup.
#[derive(Clone)]
pub struct DaemonEventSender {
    sender: Sender<Command>,
}

impl DaemonEventSender {
    pub fn send(&self, event: MDnsEvent) {
        if self.sender.send(Command::DaemonEvent(event)).is_err() {
            debug!("orchestrator is gone, dropping daemon event");
        }
    }
}

/// The handle the advertiser posts registration results and offload changes
/// through.
#[derive(Clone)]
pub struct AdvertiserEventSender {
    sender: Sender<Command>,
}

impl AdvertiserEventSender {
    fn post(&self, command: Command) {
        if self.sender.send(command).is_err() {
            debug!("orchestrator is gone, dropping advertiser event");
        }
    }

    pub fn on_register_service_succeeded(&self, transaction_id: i32, service_name: &str) {
        self.post(Command::AdvertiserRegisterSucceeded {
            transaction_id,
            service_name: service_name.to_string(),
        });
    }

    pub fn on_register_service_failed(&self, transaction_id: i32, error: NsdError) {
        self.post(Command::AdvertiserRegisterFailed {
            transaction_id,
            error,
        });
    }

    pub fn on_offload_start_or_update(&self, interface_name: &str, info: OffloadServiceInfo) {
        self.post(Command::OffloadStartOrUpdate {
            interface_name: interface_name.to_string(),
            info,
        });
    }

    pub fn on_offload_stop(&self, interface_name: &str, info: OffloadServiceInfo) {
        self.post(Command::OffloadStop {
            interface_name: interface_name.to_string(),
            info,
        });
    }
}

/// The handle the socket provider reports socket lifecycle through. It
/// derives the multicast-lock network set.
#[derive(Clone)]
pub struct SocketRequestMonitor {
    sender: Sender<Command>,
}

impl SocketRequestMonitor {
    /// Called when the provider fulfills a socket request. Only sockets on a
    /// Wi-Fi network that is not also a VPN contribute to the lock: a
    /// nameless network is a tethering downstream, which has no APF
    /// filtering to work around.
    pub fn on_socket_request_fulfilled(
        &self,
        socket_network: Option<Network>,
        transports: &[Transport],
    ) {
        let Some(network) = socket_network else { return };
        if !transports.contains(&Transport::Wifi) || transports.contains(&Transport::Vpn) {
            return;
        }
        if self.sender.send(Command::LockNetworkAdded(network)).is_err() {
            debug!("orchestrator is gone, dropping socket event");
        }
    }

    pub fn on_socket_destroyed(&self, socket_network: Option<Network>) {
        let Some(network) = socket_network else { return };
        if self
            .sender
            .send(Command::LockNetworkRemoved(network))
            .is_err()
        {
            debug!("orchestrator is gone, dropping socket event");
        }
    }
}

/// What a modern-engine listener forwards for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListenerKind {
    Discovery,
    Resolution,
    ServiceInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EngineEventKind {
    ServiceFound,
    ServiceLost,
    ResolveServiceSucceeded,
    ServiceUpdated,
    ServiceUpdatedLost,
    QuerySent,
}

/// Listener object registered with the modern engine, one per request.
///
/// The engine invokes the callbacks from its own threads; each posts a
/// message onto the orchestrator loop rather than touching state directly.
#[derive(Debug)]
pub struct MdnsListener {
    kind: ListenerKind,
    client_request_id: i32,
    transaction_id: i32,
    listened_service_type: String,
    sender: Sender<Command>,
}

impl MdnsListener {
    pub fn listened_service_type(&self) -> &str {
        &self.listened_service_type
    }

    pub(crate) fn kind(&self) -> ListenerKind {
        self.kind
    }

    fn post(
        &self,
        kind: EngineEventKind,
        service: Option<MdnsServiceInfo>,
        is_service_from_cache: bool,
    ) {
        let command = Command::EngineEvent {
            transaction_id: self.transaction_id,
            client_request_id: self.client_request_id,
            kind,
            service,
            is_service_from_cache,
        };
        if self.sender.send(command).is_err() {
            debug!("orchestrator is gone, dropping engine event");
        }
    }

    /// A previously unknown instance became visible while browsing.
    pub fn on_service_name_discovered(&self, service: MdnsServiceInfo, is_service_from_cache: bool) {
        if self.kind == ListenerKind::Discovery {
            self.post(EngineEventKind::ServiceFound, Some(service), is_service_from_cache);
        }
    }

    pub fn on_service_name_removed(&self, service: MdnsServiceInfo) {
        if self.kind == ListenerKind::Discovery {
            self.post(EngineEventKind::ServiceLost, Some(service), false);
        }
    }

    /// An instance was fully resolved (SRV, TXT and addresses known).
    pub fn on_service_found(&self, service: MdnsServiceInfo, is_service_from_cache: bool) {
        match self.kind {
            ListenerKind::Resolution => self.post(
                EngineEventKind::ResolveServiceSucceeded,
                Some(service),
                is_service_from_cache,
            ),
            ListenerKind::ServiceInfo => {
                self.post(EngineEventKind::ServiceUpdated, Some(service), is_service_from_cache)
            }
            ListenerKind::Discovery => {}
        }
    }

    pub fn on_service_updated(&self, service: MdnsServiceInfo) {
        if self.kind == ListenerKind::ServiceInfo {
            self.post(EngineEventKind::ServiceUpdated, Some(service), false);
        }
    }

    pub fn on_service_removed(&self, service: MdnsServiceInfo) {
        if self.kind == ListenerKind::ServiceInfo {
            self.post(EngineEventKind::ServiceUpdatedLost, Some(service), false);
        }
    }

    pub fn on_discovery_query_sent(&self) {
        self.post(EngineEventKind::QuerySent, None, false);
    }

    pub fn on_search_failed_to_start(&self) {}

    pub fn on_search_stopped_with_error(&self, _error: i32) {}
}

struct OffloadEngineEntry {
    engine_id: i64,
    interface_name: String,
    offload_types: u64,
    callback: Sender<OffloadEvent>,
}

/// Messages consumed by the orchestrator loop.
enum Command {
    RegisterClient {
        connector_id: i64,
        callback: Sender<ClientEvent>,
        uid: u32,
        use_modern_backend: bool,
    },
    UnregisterClient {
        connector_id: i64,
    },
    DiscoverServices {
        connector_id: i64,
        listener_key: i32,
        info: NsdServiceInfo,
    },
    StopDiscovery {
        connector_id: i64,
        listener_key: i32,
    },
    RegisterService {
        connector_id: i64,
        listener_key: i32,
        info: NsdServiceInfo,
    },
    UnregisterService {
        connector_id: i64,
        listener_key: i32,
    },
    ResolveService {
        connector_id: i64,
        listener_key: i32,
        info: NsdServiceInfo,
    },
    StopResolution {
        connector_id: i64,
        listener_key: i32,
    },
    RegisterServiceCallback {
        connector_id: i64,
        listener_key: i32,
        info: NsdServiceInfo,
    },
    UnregisterServiceCallback {
        connector_id: i64,
        listener_key: i32,
    },
    StartDaemon {
        connector_id: i64,
    },
    RegisterOffloadEngine {
        engine_id: i64,
        interface_name: String,
        offload_capabilities: u64,
        offload_types: u64,
        callback: Sender<OffloadEvent>,
    },
    UnregisterOffloadEngine {
        engine_id: i64,
    },
    /// The daemon cleanup timer fired.
    DaemonCleanup,
    DaemonEvent(MDnsEvent),
    EngineEvent {
        transaction_id: i32,
        client_request_id: i32,
        kind: EngineEventKind,
        service: Option<MdnsServiceInfo>,
        is_service_from_cache: bool,
    },
    AdvertiserRegisterSucceeded {
        transaction_id: i32,
        service_name: String,
    },
    AdvertiserRegisterFailed {
        transaction_id: i32,
        error: NsdError,
    },
    OffloadStartOrUpdate {
        interface_name: String,
        info: OffloadServiceInfo,
    },
    OffloadStop {
        interface_name: String,
        info: OffloadServiceInfo,
    },
    LockNetworkAdded(Network),
    LockNetworkRemoved(Network),
    UidImportanceChanged {
        uid: u32,
        importance: i32,
    },
    Monitor(Sender<DaemonEvent>),
    Dump(Sender<String>),
    Exit(Sender<DaemonStatus>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegisterClient { .. } => write!(f, "Command RegisterClient"),
            Self::UnregisterClient { .. } => write!(f, "Command UnregisterClient"),
            Self::DiscoverServices { .. } => write!(f, "Command DiscoverServices"),
            Self::StopDiscovery { .. } => write!(f, "Command StopDiscovery"),
            Self::RegisterService { .. } => write!(f, "Command RegisterService"),
            Self::UnregisterService { .. } => write!(f, "Command UnregisterService"),
            Self::ResolveService { .. } => write!(f, "Command ResolveService"),
            Self::StopResolution { .. } => write!(f, "Command StopResolution"),
            Self::RegisterServiceCallback { .. } => write!(f, "Command RegisterServiceCallback"),
            Self::UnregisterServiceCallback { .. } => {
                write!(f, "Command UnregisterServiceCallback")
            }
            Self::StartDaemon { .. } => write!(f, "Command StartDaemon"),
            Self::RegisterOffloadEngine { .. } => write!(f, "Command RegisterOffloadEngine"),
            Self::UnregisterOffloadEngine { .. } => write!(f, "Command UnregisterOffloadEngine"),
            Self::DaemonCleanup => write!(f, "Command DaemonCleanup"),
            Self::DaemonEvent(_) => write!(f, "Command DaemonEvent"),
            Self::EngineEvent { kind, .. } => write!(f, "Command EngineEvent {:?}", kind),
            Self::AdvertiserRegisterSucceeded { .. } => {
                write!(f, "Command AdvertiserRegisterSucceeded")
            }
            Self::AdvertiserRegisterFailed { .. } => write!(f, "Command AdvertiserRegisterFailed"),
            Self::OffloadStartOrUpdate { .. } => write!(f, "Command OffloadStartOrUpdate"),
            Self::OffloadStop { .. } => write!(f, "Command OffloadStop"),
            Self::LockNetworkAdded(_) => write!(f, "Command LockNetworkAdded"),
            Self::LockNetworkRemoved(_) => write!(f, "Command LockNetworkRemoved"),
            Self::UidImportanceChanged { .. } => write!(f, "Command UidImportanceChanged"),
            Self::Monitor(_) => write!(f, "Command Monitor"),
            Self::Dump(_) => write!(f, "Command Dump"),
            Self::Exit(_) => write!(f, "Command Exit"),
        }
    }
}

/// Hierarchical dispatch result: a state either consumes the message or
/// passes it to its parent.
enum HandleResult {
    Handled,
    NotHandled(Command),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Default,
    Enabled,
}

/// Network attribution for outbound callbacks.
///
/// An unset netId clears both the network and the interface index. The
/// local-network netId clears the network but keeps the interface index, so
/// a caller re-submitting the info still targets the same link.
fn set_service_network_for_callback(info: &mut NsdServiceInfo, net_id: i32, interface_idx: u32) {
    match net_id {
        NETID_UNSET => {
            info.network = None;
            info.interface_index = 0;
        }
        LOCAL_NET_ID => {
            info.network = None;
            info.interface_index = interface_idx;
        }
        _ => info.network = Some(Network(net_id)),
    }
}

/// Lowers an engine service report into the user-visible info, with the
/// historical service-type affordances per event kind.
fn build_info_from_engine_event(
    service: &MdnsServiceInfo,
    kind: EngineEventKind,
) -> Option<NsdServiceInfo> {
    let labels = &service.service_type_labels;
    if labels.last().map(String::as_str) != Some(LOCAL_DOMAIN_NAME) {
        error!("engine service type does not end in .local: {:?}", labels);
        return None;
    }
    let joined = labels[..labels.len() - 1].join(".");
    let service_type = match kind {
        // Discovered service types historically carry a dot at the end.
        EngineEventKind::ServiceFound | EngineEventKind::ServiceLost => format!("{}.", joined),
        // Resolved service types historically carry a dot at the beginning.
        EngineEventKind::ResolveServiceSucceeded => format!(".{}", joined),
        _ => joined,
    };
    let mut info = NsdServiceInfo::new(&service.instance_name, &service_type);
    let net_id = match service.network {
        Some(network) => network.0,
        // A nameless network means a tethering interface, i.e. the local
        // network.
        None => LOCAL_NET_ID,
    };
    set_service_network_for_callback(&mut info, net_id, service.interface_index);
    Some(info)
}

fn engine_service_addresses(service: &MdnsServiceInfo) -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    for address in &service.ipv4_addresses {
        match address.parse::<std::net::Ipv4Addr>() {
            Ok(addr) => addresses.push(IpAddr::V4(addr)),
            Err(_) => error!("invalid ipv4 address: {}", address),
        }
    }
    for address in &service.ipv6_addresses {
        match address.parse::<std::net::Ipv6Addr>() {
            Ok(addr) => addresses.push(IpAddr::V6(addr)),
            Err(_) => error!("invalid ipv6 address: {}", address),
        }
    }
    addresses
}

/// All orchestrator state, owned by the worker thread.
struct Orchestrator {
    legacy: Box<dyn LegacyDaemon>,
    engine: Box<dyn DiscoveryEngine>,
    advertiser: Box<dyn ServiceAdvertiser>,
    sockets: Box<dyn SocketProvider>,
    lock: Box<dyn MulticastLock>,
    links: Box<dyn LinkResolver>,
    config: Box<dyn DeviceConfig>,
    metrics: Arc<dyn MetricsSink>,
    /// Loop-back sender for listeners and the daemon event channel.
    sender: Sender<Command>,

    /// Connected clients, keyed by connector identity.
    clients: HashMap<i64, ClientInfo>,
    /// Transaction id to the owning connector. Must agree with the
    /// per-client request maps for every live request.
    transaction_id_to_connector: HashMap<i32, i64>,
    offload_engines: Vec<OffloadEngineEntry>,

    /// Networks whose sockets need the multicast lock while an active app
    /// has a modern request on them.
    wifi_lock_required_networks: HashSet<Network>,
    running_app_active_uids: HashSet<u32>,
    running_app_active_importance_cutoff: i32,
    lock_held: bool,

    is_daemon_started: bool,
    is_monitoring_sockets_started: bool,
    /// Count of connected pre-S clients; they keep the daemon alive.
    legacy_client_count: u32,
    unique_id: i32,
    client_number_id: u32,
    cleanup_delay_ms: u64,
    /// Pending daemon-cleanup deadline, if scheduled.
    cleanup_at: Option<u64>,

    state: State,
    nsd_state: NsdState,
    monitors: Vec<Sender<DaemonEvent>>,
    state_log: VecDeque<String>,
    service_logs: SharedLog,
}

impl Orchestrator {
    fn new(deps: NsdDependencies, sender: Sender<Command>) -> Self {
        let service_logs = SharedLog::new("serviceDiscovery");
        let running_app_active_importance_cutoff = deps.device_config.get_int(
            MDNS_CONFIG_RUNNING_APP_ACTIVE_IMPORTANCE_CUTOFF,
            DEFAULT_RUNNING_APP_ACTIVE_IMPORTANCE_CUTOFF,
        );
        Self {
            legacy: deps.legacy_daemon,
            engine: deps.discovery_engine,
            advertiser: deps.advertiser,
            sockets: deps.socket_provider,
            lock: deps.multicast_lock,
            links: deps.link_resolver,
            config: deps.device_config,
            metrics: deps.metrics,
            sender,
            clients: HashMap::new(),
            transaction_id_to_connector: HashMap::new(),
            offload_engines: Vec::new(),
            wifi_lock_required_networks: HashSet::new(),
            running_app_active_uids: HashSet::new(),
            running_app_active_importance_cutoff,
            lock_held: false,
            is_daemon_started: false,
            is_monitoring_sockets_started: false,
            legacy_client_count: 0,
            unique_id: 0,
            client_number_id: 1,
            cleanup_delay_ms: deps.cleanup_delay_ms,
            cleanup_at: None,
            state: State::Default,
            nsd_state: NsdState::Disabled,
            monitors: Vec::new(),
            state_log: VecDeque::new(),
            service_logs,
        }
    }

    /// The main event loop of the orchestrator thread.
    fn run(mut self, receiver: Receiver<Command>) -> Option<Command> {
        self.enter_enabled();
        loop {
            let command = match self.cleanup_at {
                Some(deadline) => {
                    let now = current_time_millis();
                    let timeout =
                        Duration::from_millis(if deadline > now { deadline - now } else { 1 });
                    match receiver.recv_timeout(timeout) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return None,
                    }
                }
                None => match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => return None,
                },
            };

            // Fire the daemon cleanup timer once its deadline passes.
            if let Some(deadline) = self.cleanup_at {
                if current_time_millis() >= deadline {
                    self.cleanup_at = None;
                    self.dispatch(Command::DaemonCleanup);
                }
            }

            let Some(command) = command else { continue };
            if matches!(command, Command::Exit(_)) {
                self.exit_enabled();
                return Some(command);
            }
            self.dispatch(command);
        }
    }

    fn enter_enabled(&mut self) {
        self.state = State::Enabled;
        self.nsd_state = NsdState::Enabled;
        self.notify_monitors(DaemonEvent::StateChanged(NsdState::Enabled));
        self.service_logs.log("Network service discovery enabled");
    }

    fn exit_enabled(&mut self) {
        // TODO: expunge outstanding requests and notify their clients before
        // stopping the daemon.
        self.maybe_stop_daemon();
        self.state = State::Default;
    }

    fn record_log(&mut self, command: &Command) {
        if self.state_log.len() >= STATE_LOG_RECORD_SIZE {
            self.state_log.pop_front();
        }
        self.state_log
            .push_back(format!("{} {}", current_time_millis(), command));
    }

    fn dispatch(&mut self, command: Command) {
        self.record_log(&command);
        let result = match self.state {
            State::Enabled => self.handle_enabled(command),
            State::Default => HandleResult::NotHandled(command),
        };
        match result {
            HandleResult::Handled => {}
            HandleResult::NotHandled(command) => match self.handle_default(command) {
                HandleResult::Handled => {}
                HandleResult::NotHandled(command) => error!("Unhandled {}", command),
            },
        }
    }

    fn notify_monitors(&mut self, event: DaemonEvent) {
        // Only retain the monitors that are still connected.
        self.monitors.retain(|sender| {
            if let Err(e) = sender.try_send(event.clone()) {
                debug!("notify_monitors: try_send: {}", &e);
                if matches!(e, TrySendError::Disconnected(_)) {
                    return false;
                }
            }
            true
        });
    }

    // ---- daemon, socket monitor and timer lifecycle ----

    fn maybe_start_daemon(&mut self) {
        if self.is_daemon_started {
            debug!("Daemon is already started.");
            return;
        }
        self.legacy.register_event_listener(DaemonEventSender {
            sender: self.sender.clone(),
        });
        self.legacy.start_daemon();
        self.is_daemon_started = true;
        self.maybe_schedule_stop();
        self.service_logs.log("Start mdns daemon");
    }

    fn maybe_stop_daemon(&mut self) {
        if !self.is_daemon_started {
            debug!("Daemon has not been started.");
            return;
        }
        self.legacy.unregister_event_listener();
        self.legacy.stop_daemon();
        self.is_daemon_started = false;
        self.service_logs.log("Stop mdns daemon");
    }

    fn is_any_request_active(&self) -> bool {
        !self.transaction_id_to_connector.is_empty()
    }

    fn schedule_stop(&mut self) {
        self.cleanup_at = Some(current_time_millis() + self.cleanup_delay_ms);
    }

    fn maybe_schedule_stop(&mut self) {
        // The native daemon must stay alive while any pre-S client is
        // connected.
        if !self.is_any_request_active() && self.legacy_client_count == 0 {
            self.schedule_stop();
        }
    }

    fn cancel_stop(&mut self) {
        self.cleanup_at = None;
    }

    fn maybe_start_monitoring_sockets(&mut self) {
        if self.is_monitoring_sockets_started {
            debug!("Socket monitoring is already started.");
            return;
        }
        self.sockets.start_monitoring_sockets();
        self.is_monitoring_sockets_started = true;
    }

    fn maybe_stop_monitoring_sockets_if_no_active_request(&mut self) {
        if !self.is_monitoring_sockets_started {
            return;
        }
        if self.is_any_request_active() {
            return;
        }
        self.sockets.request_stop_when_inactive();
        self.is_monitoring_sockets_started = false;
    }

    // ---- id allocation and request registry ----

    fn get_unique_id(&mut self) -> i32 {
        self.unique_id = self.unique_id.wrapping_add(1);
        if self.unique_id == INVALID_TRANSACTION_ID {
            self.unique_id = self.unique_id.wrapping_add(1);
        }
        self.unique_id
    }

    fn store_legacy_request(
        &mut self,
        connector_id: i64,
        client_request_id: i32,
        transaction_id: i32,
        verb: LegacyVerb,
        start_time_ms: u64,
    ) {
        if let Some(client) = self.clients.get_mut(&connector_id) {
            client.client_requests.insert(
                client_request_id,
                ClientRequest::Legacy {
                    header: RequestHeader::new(transaction_id, start_time_ms),
                    verb,
                },
            );
        }
        self.transaction_id_to_connector
            .insert(transaction_id, connector_id);
        // A new legacy request cancels any pending daemon cleanup.
        self.cancel_stop();
    }

    fn store_advertiser_request(
        &mut self,
        connector_id: i64,
        client_request_id: i32,
        transaction_id: i32,
        requested_network: Option<Network>,
    ) {
        if let Some(client) = self.clients.get_mut(&connector_id) {
            client.client_requests.insert(
                client_request_id,
                ClientRequest::Advertiser {
                    header: RequestHeader::new(transaction_id, current_time_millis()),
                    requested_network,
                },
            );
        }
        self.transaction_id_to_connector
            .insert(transaction_id, connector_id);
        self.update_multicast_lock();
    }

    fn store_discovery_manager_request(
        &mut self,
        connector_id: i64,
        client_request_id: i32,
        transaction_id: i32,
        listener: Arc<MdnsListener>,
        requested_network: Option<Network>,
    ) {
        if let Some(client) = self.clients.get_mut(&connector_id) {
            client.client_requests.insert(
                client_request_id,
                ClientRequest::DiscoveryManager {
                    header: RequestHeader::new(transaction_id, current_time_millis()),
                    listener,
                    requested_network,
                },
            );
        }
        self.transaction_id_to_connector
            .insert(transaction_id, connector_id);
        self.update_multicast_lock();
    }

    /// Erases a request from both maps and runs the per-backend lifecycle
    /// follow-ups.
    fn remove_request(&mut self, connector_id: i64, client_request_id: i32) -> Option<ClientRequest> {
        let removed = self
            .clients
            .get_mut(&connector_id)?
            .client_requests
            .remove(&client_request_id)?;
        self.transaction_id_to_connector
            .remove(&removed.transaction_id());
        match &removed {
            ClientRequest::Legacy { .. } => self.maybe_schedule_stop(),
            _ => {
                self.maybe_stop_monitoring_sockets_if_no_active_request();
                self.update_multicast_lock();
            }
        }
        Some(removed)
    }

    // ---- multicast lock ----

    /// Takes or releases the lock from the three inputs: the lock-required
    /// networks, the active uids, and the outstanding modern requests. Must
    /// run after any of them changed.
    fn update_multicast_lock(&mut self) {
        match self.multicast_lock_needed_uid() {
            Some(uid) => {
                if !self.lock_held {
                    self.lock.acquire();
                    self.lock_held = true;
                    self.service_logs
                        .log(format!("Taking multicast lock for uid {}", uid));
                }
            }
            None => {
                if self.lock_held {
                    self.lock.release();
                    self.lock_held = false;
                    self.service_logs.log("Released multicast lock");
                }
            }
        }
    }

    /// The uid of an app requiring the multicast lock, if any.
    fn multicast_lock_needed_uid(&self) -> Option<u32> {
        if self.wifi_lock_required_networks.is_empty() {
            return None;
        }
        for connector_id in self.transaction_id_to_connector.values() {
            let Some(client) = self.clients.get(connector_id) else {
                continue;
            };
            if !self.running_app_active_uids.contains(&client.uid) {
                continue;
            }
            if client.has_any_modern_request_for_networks(&self.wifi_lock_required_networks) {
                return Some(client.uid);
            }
        }
        None
    }

    // ---- backend routing ----

    fn is_discovery_manager_enabled(&self) -> bool {
        self.config.is_feature_enabled(MDNS_DISCOVERY_MANAGER_VERSION)
    }

    fn is_advertiser_enabled(&self) -> bool {
        self.config.is_feature_enabled(MDNS_ADVERTISER_VERSION)
    }

    /// Whether `service_type` is allowlisted to use the modern backend. The
    /// allowlist maps types to tags; each tag has its own feature flag per
    /// direction (discovery or advertising).
    fn is_type_allowlisted_for_modern_backend(
        &self,
        service_type: &str,
        flag_prefix: &str,
    ) -> bool {
        let Some(types_config) = self.config.get_property(MDNS_TYPE_ALLOWLIST_FLAGS) else {
            return false;
        };
        if types_config.is_empty() {
            return false;
        }
        let mapping_prefix = format!("{}:", service_type);
        let Some(mapped_flag) = types_config
            .split(',')
            .find_map(|mapping| mapping.strip_prefix(mapping_prefix.as_str()))
        else {
            return false;
        };
        self.config.is_feature_enabled(&format!(
            "{}{}{}",
            flag_prefix, mapped_flag, MDNS_ALLOWLIST_FLAG_SUFFIX
        ))
    }

    fn use_discovery_manager_for_type(&self, service_type: Option<&str>) -> bool {
        let Some(service_type) = service_type else {
            return false;
        };
        self.is_type_allowlisted_for_modern_backend(
            service_type,
            MDNS_DISCOVERY_MANAGER_ALLOWLIST_FLAG_PREFIX,
        )
    }

    fn use_advertiser_for_type(&self, service_type: Option<&str>) -> bool {
        let Some(service_type) = service_type else {
            return false;
        };
        self.is_type_allowlisted_for_modern_backend(
            service_type,
            MDNS_ADVERTISER_ALLOWLIST_FLAG_PREFIX,
        )
    }

    // ---- legacy verb helpers ----

    /// Guesses the interface for a request pinned to a network. Failing is
    /// correct when the network is gone; the legacy daemon historically
    /// resolved on an unspecified interface when no network is given.
    fn network_interface_index(&self, info: &NsdServiceInfo) -> u32 {
        let Some(network) = info.network else {
            // Fall back to the interface index if present, typically when the
            // info was round-tripped from a discovery callback on an
            // interface without an app-usable network.
            if info.interface_index != 0 {
                return info.interface_index;
            }
            return IFACE_IDX_ANY;
        };
        let Some(interface_name) = self.links.interface_name_for_network(network) else {
            return IFACE_IDX_ANY;
        };
        self.links
            .interface_index_by_name(&interface_name)
            .unwrap_or(IFACE_IDX_ANY)
    }

    fn legacy_discover(&self, transaction_id: i32, info: &NsdServiceInfo) -> bool {
        let interface_idx = self.network_interface_index(info);
        if info.network.is_some() && interface_idx == IFACE_IDX_ANY {
            error!("Interface to discover service on not found");
            return false;
        }
        self.legacy
            .discover(transaction_id, &info.service_type, interface_idx)
    }

    fn legacy_register(&self, transaction_id: i32, info: &NsdServiceInfo) -> bool {
        let interface_idx = self.network_interface_index(info);
        if info.network.is_some() && interface_idx == IFACE_IDX_ANY {
            error!("Interface to register service on not found");
            return false;
        }
        let txt_record = encode_txt_record(&info.txt);
        self.legacy.register_service(
            transaction_id,
            &info.service_name,
            &info.service_type,
            info.port,
            &txt_record,
            interface_idx,
        )
    }

    fn legacy_resolve(&self, transaction_id: i32, info: &NsdServiceInfo) -> bool {
        let interface_idx = self.network_interface_index(info);
        if info.network.is_some() && interface_idx == IFACE_IDX_ANY {
            error!("Interface to resolve service on not found");
            return false;
        }
        self.legacy.resolve(
            transaction_id,
            &info.service_name,
            &info.service_type,
            "local.",
            interface_idx,
        )
    }

    // ---- state handlers ----

    /// Parent state: client lifecycle, daemon lifecycle, lock inputs, and
    /// immediate failure replies for operational verbs received outside the
    /// enabled state.
    fn handle_default(&mut self, command: Command) -> HandleResult {
        match command {
            Command::RegisterClient {
                connector_id,
                callback,
                uid,
                use_modern_backend,
            } => {
                let tag = format!("Client{}-{}", uid, self.client_number_id);
                self.client_number_id += 1;
                let client = ClientInfo::new(
                    callback,
                    uid,
                    use_modern_backend,
                    self.service_logs.for_sub_component(&tag),
                    self.metrics.clone(),
                );
                self.clients.insert(connector_id, client);
            }
            Command::UnregisterClient { connector_id } => {
                if let Some(mut client) = self.clients.remove(&connector_id) {
                    self.expunge_all_requests(&mut client);
                    if client.is_pre_s_client {
                        self.legacy_client_count = self.legacy_client_count.saturating_sub(1);
                    }
                }
                self.maybe_stop_monitoring_sockets_if_no_active_request();
                self.maybe_schedule_stop();
            }
            Command::DiscoverServices {
                connector_id,
                listener_key,
                ..
            } => {
                if let Some(client) = self.clients.get(&connector_id) {
                    client
                        .on_discover_services_failed_immediately(listener_key, NsdError::InternalError);
                }
            }
            Command::StopDiscovery {
                connector_id,
                listener_key,
            } => {
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_stop_discovery_failed(listener_key, NsdError::InternalError);
                }
            }
            Command::RegisterService {
                connector_id,
                listener_key,
                ..
            } => {
                if let Some(client) = self.clients.get(&connector_id) {
                    client
                        .on_register_service_failed_immediately(listener_key, NsdError::InternalError);
                }
            }
            Command::UnregisterService {
                connector_id,
                listener_key,
            } => {
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_unregister_service_failed(listener_key, NsdError::InternalError);
                }
            }
            Command::ResolveService {
                connector_id,
                listener_key,
                ..
            } => {
                if let Some(client) = self.clients.get(&connector_id) {
                    client
                        .on_resolve_service_failed_immediately(listener_key, NsdError::InternalError);
                }
            }
            Command::StopResolution {
                connector_id,
                listener_key,
            } => {
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_stop_resolution_failed(listener_key, NsdError::OperationNotRunning);
                }
            }
            Command::RegisterServiceCallback {
                connector_id,
                listener_key,
                ..
            } => {
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_service_info_callback_registration_failed(
                        listener_key,
                        NsdError::BadParameters,
                    );
                }
            }
            Command::DaemonCleanup => {
                if !self.is_any_request_active() && self.legacy_client_count == 0 {
                    self.maybe_stop_daemon();
                }
            }
            // Sent only by legacy (pre-S) clients that drive the daemon
            // startup explicitly.
            Command::StartDaemon { connector_id } => {
                if self.clients.contains_key(&connector_id) {
                    self.cancel_stop();
                    if let Some(client) = self.clients.get_mut(&connector_id) {
                        if !client.is_pre_s_client {
                            client.is_pre_s_client = true;
                            self.legacy_client_count += 1;
                        }
                    }
                    self.maybe_start_daemon();
                }
            }
            Command::LockNetworkAdded(network) => {
                if self.wifi_lock_required_networks.insert(network) {
                    self.update_multicast_lock();
                }
            }
            Command::LockNetworkRemoved(network) => {
                if self.wifi_lock_required_networks.remove(&network) {
                    self.update_multicast_lock();
                }
            }
            Command::UidImportanceChanged { uid, importance } => {
                // Lower importance values are more "important".
                let modified = if importance <= self.running_app_active_importance_cutoff {
                    self.running_app_active_uids.insert(uid)
                } else {
                    self.running_app_active_uids.remove(&uid)
                };
                if modified {
                    self.update_multicast_lock();
                }
            }
            Command::Monitor(resp_s) => {
                // The state broadcast is sticky: replay the current state.
                if let Err(e) = resp_s.try_send(DaemonEvent::StateChanged(self.nsd_state)) {
                    debug!("Failed to send sticky state to a new monitor: {}", e);
                }
                self.monitors.push(resp_s);
            }
            Command::Dump(resp_s) => {
                let mut out = String::new();
                out.push_str("State machine records (most recent first):\n");
                for record in self.state_log.iter().rev() {
                    out.push_str(record);
                    out.push('\n');
                }
                out.push_str("\nLogs:\n");
                out.push_str(&self.service_logs.dump());
                if let Err(e) = resp_s.send(out) {
                    debug!("Failed to send dump: {}", e);
                }
            }
            other => return HandleResult::NotHandled(other),
        }
        HandleResult::Handled
    }

    /// Child state: the operational verbs and all backend events.
    fn handle_enabled(&mut self, command: Command) -> HandleResult {
        match command {
            Command::DiscoverServices {
                connector_id,
                listener_key,
                info,
            } => self.handle_discover_services(connector_id, listener_key, info),
            Command::StopDiscovery {
                connector_id,
                listener_key,
            } => self.handle_stop_discovery(connector_id, listener_key),
            Command::RegisterService {
                connector_id,
                listener_key,
                info,
            } => self.handle_register_service(connector_id, listener_key, info),
            Command::UnregisterService {
                connector_id,
                listener_key,
            } => self.handle_unregister_service(connector_id, listener_key),
            Command::ResolveService {
                connector_id,
                listener_key,
                info,
            } => self.handle_resolve_service(connector_id, listener_key, info),
            Command::StopResolution {
                connector_id,
                listener_key,
            } => self.handle_stop_resolution(connector_id, listener_key),
            Command::RegisterServiceCallback {
                connector_id,
                listener_key,
                info,
            } => self.handle_register_service_callback(connector_id, listener_key, info),
            Command::UnregisterServiceCallback {
                connector_id,
                listener_key,
            } => self.handle_unregister_service_callback(connector_id, listener_key),
            Command::RegisterOffloadEngine {
                engine_id,
                interface_name,
                offload_capabilities,
                offload_types,
                callback,
            } => {
                let engine = OffloadEngineEntry {
                    engine_id,
                    interface_name,
                    offload_types,
                    callback,
                };
                self.service_logs.log(format!(
                    "Registered offload engine for {} capabilities={} types={}",
                    engine.interface_name, offload_capabilities, offload_types
                ));
                self.send_all_offload_service_infos(&engine);
                self.offload_engines.push(engine);
            }
            Command::UnregisterOffloadEngine { engine_id } => {
                self.offload_engines
                    .retain(|engine| engine.engine_id != engine_id);
            }
            Command::DaemonEvent(event) => self.handle_daemon_event(event),
            Command::EngineEvent {
                transaction_id,
                client_request_id,
                kind,
                service,
                is_service_from_cache,
            } => self.handle_engine_event(
                transaction_id,
                client_request_id,
                kind,
                service,
                is_service_from_cache,
            ),
            Command::AdvertiserRegisterSucceeded {
                transaction_id,
                service_name,
            } => {
                self.service_logs.log(format!(
                    "onRegisterServiceSucceeded: transactionId {}",
                    transaction_id
                ));
                let Some((connector_id, client_request_id)) =
                    self.client_request_for_transaction(transaction_id)
                else {
                    return HandleResult::Handled;
                };
                let now = current_time_millis();
                if let Some(client) = self.clients.get(&connector_id) {
                    if let Some(request) = client.client_requests.get(&client_request_id) {
                        // Historical behavior: the callback carries the
                        // (possibly renamed) service name only.
                        let info = NsdServiceInfo::new(&service_name, "");
                        client.on_register_service_succeeded(
                            client_request_id,
                            info,
                            transaction_id,
                            request.header().request_duration_ms(now),
                        );
                    }
                }
            }
            Command::AdvertiserRegisterFailed {
                transaction_id,
                error,
            } => {
                let Some((connector_id, client_request_id)) =
                    self.client_request_for_transaction(transaction_id)
                else {
                    return HandleResult::Handled;
                };
                let now = current_time_millis();
                if let Some(client) = self.clients.get(&connector_id) {
                    if let Some(request) = client.client_requests.get(&client_request_id) {
                        client.on_register_service_failed(
                            client_request_id,
                            error,
                            transaction_id,
                            request.header().request_duration_ms(now),
                        );
                    }
                }
            }
            Command::OffloadStartOrUpdate {
                interface_name,
                info,
            } => self.send_offload_service_infos_update(&interface_name, info, false),
            Command::OffloadStop {
                interface_name,
                info,
            } => self.send_offload_service_infos_update(&interface_name, info, true),
            other => return HandleResult::NotHandled(other),
        }
        HandleResult::Handled
    }

    fn handle_discover_services(
        &mut self,
        connector_id: i64,
        listener_key: i32,
        info: NsdServiceInfo,
    ) {
        debug!("Discover services");
        // The client may already be gone if its channel died before this
        // command was processed.
        let Some(client) = self.clients.get(&connector_id) else {
            error!("Unknown connector in discovery");
            return;
        };
        if client.client_requests.len() >= MAX_LIMIT {
            debug!("Exceeded max outstanding requests for uid {}", client.uid);
            client.on_discover_services_failed_immediately(listener_key, NsdError::MaxLimit);
            return;
        }
        let client_uses_modern = client.use_modern_backend;

        let transaction_id = self.get_unique_id();
        let type_and_subtype = parse_type_and_subtype(&info.service_type);
        let service_type = type_and_subtype.as_ref().map(|(ty, _)| ty.clone());
        if client_uses_modern
            || self.is_discovery_manager_enabled()
            || self.use_discovery_manager_for_type(service_type.as_deref())
        {
            let Some(service_type) = service_type else {
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_discover_services_failed_immediately(
                        listener_key,
                        NsdError::InternalError,
                    );
                }
                return;
            };
            let subtype = type_and_subtype.and_then(|(_, subtype)| subtype);
            let listen_service_type = format!("{}.{}", service_type, LOCAL_DOMAIN_NAME);
            self.maybe_start_monitoring_sockets();
            let listener = Arc::new(MdnsListener {
                kind: ListenerKind::Discovery,
                client_request_id: listener_key,
                transaction_id,
                listened_service_type: listen_service_type.clone(),
                sender: self.sender.clone(),
            });
            let options = MdnsSearchOptions {
                network: info.network,
                // The parser keeps the leading underscore; the engine
                // expects the subtype without it.
                subtype: subtype.map(|s| s[1..].to_string()),
                resolve_instance_name: None,
                passive_mode: true,
                remove_expired_service: true,
            };
            self.engine
                .register_listener(&listen_service_type, listener.clone(), options);
            self.store_discovery_manager_request(
                connector_id,
                listener_key,
                transaction_id,
                listener,
                info.network,
            );
            if let Some(client) = self.clients.get(&connector_id) {
                client.on_discover_services_started(listener_key, info, transaction_id);
                client.logs.log(format!(
                    "Registered a discovery listener {} for service type: {}",
                    transaction_id, listen_service_type
                ));
            }
        } else {
            self.maybe_start_daemon();
            if self.legacy_discover(transaction_id, &info) {
                self.store_legacy_request(
                    connector_id,
                    listener_key,
                    transaction_id,
                    LegacyVerb::Discover,
                    current_time_millis(),
                );
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_discover_services_started(listener_key, info, transaction_id);
                }
            } else {
                self.legacy.stop_operation(transaction_id);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_discover_services_failed_immediately(
                        listener_key,
                        NsdError::InternalError,
                    );
                }
            }
        }
    }

    fn handle_stop_discovery(&mut self, connector_id: i64, listener_key: i32) {
        debug!("Stop service discovery");
        if !self.clients.contains_key(&connector_id) {
            error!("Unknown connector in stop discovery");
            return;
        }
        let Some(request) = self.remove_request(connector_id, listener_key) else {
            error!("Unknown client request in StopDiscovery");
            return;
        };
        let transaction_id = request.transaction_id();
        let now = current_time_millis();
        match &request {
            // The modern flags may have flipped since the request started,
            // so dispatch on the request's own backend, not the flag values.
            ClientRequest::DiscoveryManager { listener, .. } => {
                self.engine
                    .unregister_listener(listener.listened_service_type(), listener);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_stop_discovery_succeeded(listener_key, &request, now);
                    client
                        .logs
                        .log(format!("Unregistered the discovery listener {}", transaction_id));
                }
            }
            _ => {
                if self.legacy.stop_operation(transaction_id) {
                    if let Some(client) = self.clients.get(&connector_id) {
                        client.on_stop_discovery_succeeded(listener_key, &request, now);
                    }
                } else if let Some(client) = self.clients.get(&connector_id) {
                    client.on_stop_discovery_failed(listener_key, NsdError::InternalError);
                }
            }
        }
    }

    fn handle_register_service(
        &mut self,
        connector_id: i64,
        listener_key: i32,
        mut info: NsdServiceInfo,
    ) {
        debug!("Register service");
        let Some(client) = self.clients.get(&connector_id) else {
            error!("Unknown connector in registration");
            return;
        };
        if client.client_requests.len() >= MAX_LIMIT {
            debug!("Exceeded max outstanding requests for uid {}", client.uid);
            client.on_register_service_failed_immediately(listener_key, NsdError::MaxLimit);
            return;
        }
        let client_uses_modern = client.use_modern_backend;

        let transaction_id = self.get_unique_id();
        let type_and_subtype = parse_type_and_subtype(&info.service_type);
        let register_service_type = type_and_subtype.as_ref().map(|(ty, _)| ty.clone());
        // RFC 6763 4.1.1 limits instance names to 63 UTF-8 bytes.
        info.service_name = truncate_service_name(&info.service_name, MAX_LABEL_LENGTH).to_string();

        if client_uses_modern
            || self.is_advertiser_enabled()
            || self.use_advertiser_for_type(register_service_type.as_deref())
        {
            let Some(register_service_type) = register_service_type else {
                error!("Invalid service type: {}", info.service_type);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_register_service_failed_immediately(
                        listener_key,
                        NsdError::InternalError,
                    );
                }
                return;
            };
            info.service_type = register_service_type;
            self.maybe_start_monitoring_sockets();
            let requested_network = info.network;
            let subtype = type_and_subtype.and_then(|(_, subtype)| subtype);
            self.advertiser
                .add_service(transaction_id, info, subtype.as_deref());
            self.store_advertiser_request(
                connector_id,
                listener_key,
                transaction_id,
                requested_network,
            );
            // Success is reported once the advertiser finishes probing.
        } else {
            self.maybe_start_daemon();
            if self.legacy_register(transaction_id, &info) {
                self.store_legacy_request(
                    connector_id,
                    listener_key,
                    transaction_id,
                    LegacyVerb::Register,
                    current_time_millis(),
                );
                // Success is reported when the daemon confirms.
            } else {
                self.legacy.stop_operation(transaction_id);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_register_service_failed_immediately(
                        listener_key,
                        NsdError::InternalError,
                    );
                }
            }
        }
    }

    fn handle_unregister_service(&mut self, connector_id: i64, listener_key: i32) {
        debug!("Unregister service");
        if !self.clients.contains_key(&connector_id) {
            error!("Unknown connector in unregistration");
            return;
        }
        let Some(request) = self.remove_request(connector_id, listener_key) else {
            error!("Unknown client request in UnregisterService");
            return;
        };
        let transaction_id = request.transaction_id();
        let duration_ms = request.header().request_duration_ms(current_time_millis());
        match &request {
            ClientRequest::Advertiser { .. } => {
                let advertiser_metrics = self.advertiser.get_advertiser_metrics(transaction_id);
                self.advertiser.remove_service(transaction_id);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_unregister_service_succeeded(
                        listener_key,
                        transaction_id,
                        duration_ms,
                        &advertiser_metrics,
                    );
                }
            }
            _ => {
                if self.legacy.stop_operation(transaction_id) {
                    if let Some(client) = self.clients.get(&connector_id) {
                        client.on_unregister_service_succeeded(
                            listener_key,
                            transaction_id,
                            duration_ms,
                            &AdvertiserMetrics::no_packet(),
                        );
                    }
                } else if let Some(client) = self.clients.get(&connector_id) {
                    client.on_unregister_service_failed(listener_key, NsdError::InternalError);
                }
            }
        }
    }

    fn handle_resolve_service(
        &mut self,
        connector_id: i64,
        listener_key: i32,
        info: NsdServiceInfo,
    ) {
        debug!("Resolve service");
        let Some(client) = self.clients.get(&connector_id) else {
            error!("Unknown connector in resolution");
            return;
        };
        let client_uses_modern = client.use_modern_backend;
        let has_resolve_in_flight = client.resolved_service.is_some();

        let transaction_id = self.get_unique_id();
        let type_and_subtype = parse_type_and_subtype(&info.service_type);
        let service_type = type_and_subtype.map(|(ty, _)| ty);
        if client_uses_modern
            || self.is_discovery_manager_enabled()
            || self.use_discovery_manager_for_type(service_type.as_deref())
        {
            let Some(service_type) = service_type else {
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_resolve_service_failed_immediately(
                        listener_key,
                        NsdError::InternalError,
                    );
                }
                return;
            };
            let resolve_service_type = format!("{}.{}", service_type, LOCAL_DOMAIN_NAME);
            self.maybe_start_monitoring_sockets();
            let listener = Arc::new(MdnsListener {
                kind: ListenerKind::Resolution,
                client_request_id: listener_key,
                transaction_id,
                listened_service_type: resolve_service_type.clone(),
                sender: self.sender.clone(),
            });
            let options = MdnsSearchOptions {
                network: info.network,
                subtype: None,
                resolve_instance_name: Some(info.service_name.clone()),
                passive_mode: true,
                remove_expired_service: true,
            };
            self.engine
                .register_listener(&resolve_service_type, listener.clone(), options);
            self.store_discovery_manager_request(
                connector_id,
                listener_key,
                transaction_id,
                listener,
                info.network,
            );
            if let Some(client) = self.clients.get(&connector_id) {
                client.logs.log(format!(
                    "Registered a resolution listener {} for service type: {}",
                    transaction_id, resolve_service_type
                ));
            }
        } else {
            // One legacy resolve at a time per client: the scratchpad holds
            // the partially resolved service between the two phases.
            if has_resolve_in_flight {
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_resolve_service_failed_immediately(
                        listener_key,
                        NsdError::AlreadyActive,
                    );
                }
                return;
            }
            self.maybe_start_daemon();
            if self.legacy_resolve(transaction_id, &info) {
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.resolved_service = Some(NsdServiceInfo::default());
                }
                self.store_legacy_request(
                    connector_id,
                    listener_key,
                    transaction_id,
                    LegacyVerb::Resolve,
                    current_time_millis(),
                );
            } else if let Some(client) = self.clients.get(&connector_id) {
                client.on_resolve_service_failed_immediately(listener_key, NsdError::InternalError);
            }
        }
    }

    fn handle_stop_resolution(&mut self, connector_id: i64, listener_key: i32) {
        debug!("Stop service resolution");
        if !self.clients.contains_key(&connector_id) {
            error!("Unknown connector in stop resolution");
            return;
        }
        let Some(request) = self.remove_request(connector_id, listener_key) else {
            error!("Unknown client request in StopResolution");
            return;
        };
        let transaction_id = request.transaction_id();
        let now = current_time_millis();
        match &request {
            ClientRequest::DiscoveryManager { listener, .. } => {
                self.engine
                    .unregister_listener(listener.listened_service_type(), listener);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_stop_resolution_succeeded(listener_key, &request, now);
                    client.logs.log(format!(
                        "Unregistered the resolution listener {}",
                        transaction_id
                    ));
                }
            }
            _ => {
                let stopped = self.legacy.stop_operation(transaction_id);
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    if stopped {
                        client.on_stop_resolution_succeeded(listener_key, &request, now);
                    } else {
                        client
                            .on_stop_resolution_failed(listener_key, NsdError::OperationNotRunning);
                    }
                    client.resolved_service = None;
                }
            }
        }
    }

    fn handle_register_service_callback(
        &mut self,
        connector_id: i64,
        listener_key: i32,
        info: NsdServiceInfo,
    ) {
        debug!("Register a service callback");
        if !self.clients.contains_key(&connector_id) {
            error!("Unknown connector in callback registration");
            return;
        }
        let transaction_id = self.get_unique_id();
        let Some((service_type, _)) = parse_type_and_subtype(&info.service_type) else {
            if let Some(client) = self.clients.get(&connector_id) {
                client.on_service_info_callback_registration_failed(
                    listener_key,
                    NsdError::BadParameters,
                );
            }
            return;
        };
        let resolve_service_type = format!("{}.{}", service_type, LOCAL_DOMAIN_NAME);
        self.maybe_start_monitoring_sockets();
        let listener = Arc::new(MdnsListener {
            kind: ListenerKind::ServiceInfo,
            client_request_id: listener_key,
            transaction_id,
            listened_service_type: resolve_service_type.clone(),
            sender: self.sender.clone(),
        });
        let options = MdnsSearchOptions {
            network: info.network,
            subtype: None,
            resolve_instance_name: Some(info.service_name.clone()),
            passive_mode: true,
            remove_expired_service: true,
        };
        self.engine
            .register_listener(&resolve_service_type, listener.clone(), options);
        self.store_discovery_manager_request(
            connector_id,
            listener_key,
            transaction_id,
            listener,
            info.network,
        );
        if let Some(client) = self.clients.get(&connector_id) {
            client.on_service_info_callback_registered(listener_key, transaction_id);
            client.logs.log(format!(
                "Registered a service info listener {} for service type: {}",
                transaction_id, resolve_service_type
            ));
        }
    }

    fn handle_unregister_service_callback(&mut self, connector_id: i64, listener_key: i32) {
        debug!("Unregister a service callback");
        let Some(client) = self.clients.get(&connector_id) else {
            error!("Unknown connector in callback unregistration");
            return;
        };
        match client.client_requests.get(&listener_key) {
            None => {
                error!("Unknown client request in UnregisterServiceCallback");
                return;
            }
            Some(ClientRequest::DiscoveryManager { .. }) => {}
            Some(_) => {
                error!("Unregister failed with a request not served by the engine");
                return;
            }
        }
        let Some(request) = self.remove_request(connector_id, listener_key) else {
            return;
        };
        let transaction_id = request.transaction_id();
        if let ClientRequest::DiscoveryManager { listener, .. } = &request {
            self.engine
                .unregister_listener(listener.listened_service_type(), listener);
        }
        if let Some(client) = self.clients.get(&connector_id) {
            client.on_service_info_callback_unregistered(listener_key, &request, current_time_millis());
            client.logs.log(format!(
                "Unregistered the service info listener {}",
                transaction_id
            ));
        }
    }

    // ---- backend event demux ----

    /// Duration of the request currently stored under `client_request_id`.
    fn stored_request_duration(&self, connector_id: i64, client_request_id: i32, now: u64) -> u64 {
        self.clients
            .get(&connector_id)
            .and_then(|client| client.client_requests.get(&client_request_id))
            .map(|request| request.header().request_duration_ms(now))
            .unwrap_or(0)
    }

    fn handle_daemon_event(&mut self, event: MDnsEvent) {
        let transaction_id = event.transaction_id();
        let Some(&connector_id) = self.transaction_id_to_connector.get(&transaction_id) else {
            error!("transaction id {} has no client mapping", transaction_id);
            return;
        };
        // The request may be gone while an event was in flight, e.g. a
        // ServiceFound racing a StopDiscovery.
        let Some(client_request_id) = self
            .clients
            .get(&connector_id)
            .and_then(|client| client.client_request_id_for_transaction(transaction_id))
        else {
            debug!(
                "event for transaction id {} that is no longer active",
                transaction_id
            );
            return;
        };
        let now = current_time_millis();
        match event {
            MDnsEvent::ServiceFound {
                service_name,
                registration_type,
                net_id,
                interface_idx,
                ..
            } => {
                if net_id == NETID_UNSET {
                    // Services without a network are not usable by apps;
                    // they would need privileged permissions for such
                    // interfaces.
                    return;
                }
                if net_id == DUMMY_NET_ID {
                    // Only seen when discovering locally advertised
                    // services; not reachable through that interface.
                    return;
                }
                let mut info = NsdServiceInfo::new(&service_name, &registration_type);
                set_service_network_for_callback(&mut info, net_id, interface_idx);
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.on_service_found(client_request_id, info);
                }
            }
            MDnsEvent::ServiceLost {
                service_name,
                registration_type,
                net_id,
                interface_idx,
                ..
            } => {
                // The network may already be torn down when a service is
                // lost; it is then reported without one.
                let mut info = NsdServiceInfo::new(&service_name, &registration_type);
                set_service_network_for_callback(&mut info, net_id, interface_idx);
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.on_service_lost(client_request_id, info);
                }
            }
            MDnsEvent::DiscoveryFailed { .. } => {
                let duration_ms = self.stored_request_duration(connector_id, client_request_id, now);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_discover_services_failed(
                        client_request_id,
                        NsdError::InternalError,
                        transaction_id,
                        duration_ms,
                    );
                }
            }
            MDnsEvent::ServiceRegistered { service_name, .. } => {
                let duration_ms = self.stored_request_duration(connector_id, client_request_id, now);
                if let Some(client) = self.clients.get(&connector_id) {
                    let info = NsdServiceInfo::new(&service_name, "");
                    client.on_register_service_succeeded(
                        client_request_id,
                        info,
                        transaction_id,
                        duration_ms,
                    );
                }
            }
            MDnsEvent::RegistrationFailed { .. } => {
                let duration_ms = self.stored_request_duration(connector_id, client_request_id, now);
                if let Some(client) = self.clients.get(&connector_id) {
                    client.on_register_service_failed(
                        client_request_id,
                        NsdError::InternalError,
                        transaction_id,
                        duration_ms,
                    );
                }
            }
            MDnsEvent::ServiceResolved {
                service_full_name,
                hostname,
                port,
                txt_record,
                interface_idx,
                ..
            } => self.handle_service_resolved(
                connector_id,
                client_request_id,
                transaction_id,
                &service_full_name,
                &hostname,
                port,
                &txt_record,
                interface_idx,
            ),
            MDnsEvent::ResolutionFailed { .. } | MDnsEvent::GetAddressFailed { .. } => {
                let duration_ms = self.stored_request_duration(connector_id, client_request_id, now);
                self.legacy.stop_operation(transaction_id);
                self.remove_request(connector_id, client_request_id);
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.on_resolve_service_failed(
                        client_request_id,
                        NsdError::InternalError,
                        transaction_id,
                        duration_ms,
                    );
                    client.resolved_service = None;
                }
            }
            MDnsEvent::GetAddressSuccess {
                address,
                net_id,
                interface_idx,
                ..
            } => {
                let service_host: Option<IpAddr> = match address.parse() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        error!("Invalid host in GetAddressSuccess {}: {}", address, e);
                        None
                    }
                };
                // A resolved service on an interface without a network is a
                // failure: apps could not use it.
                if net_id != NETID_UNSET && service_host.is_some() {
                    if let Some(client) = self.clients.get_mut(&connector_id) {
                        if let Some(resolved) = client.resolved_service.as_mut() {
                            if let Some(host) = service_host {
                                resolved.host_addresses = vec![host];
                            }
                            set_service_network_for_callback(resolved, net_id, interface_idx);
                        }
                        let info = client.resolved_service.clone();
                        if let (Some(info), Some(request)) =
                            (info, client.client_requests.get(&client_request_id))
                        {
                            client.on_resolve_service_succeeded(
                                client_request_id,
                                info,
                                request,
                                now,
                            );
                        }
                    }
                } else {
                    let duration_ms =
                        self.stored_request_duration(connector_id, client_request_id, now);
                    if let Some(client) = self.clients.get(&connector_id) {
                        client.on_resolve_service_failed(
                            client_request_id,
                            NsdError::InternalError,
                            transaction_id,
                            duration_ms,
                        );
                    }
                }
                self.legacy.stop_operation(transaction_id);
                self.remove_request(connector_id, client_request_id);
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.resolved_service = None;
                }
            }
        }
    }

    /// First phase of the legacy resolve is done: keep the SRV/TXT data in
    /// the client scratchpad, then chain into the address lookup under a new
    /// transaction id, preserving the client request id and start time.
    #[allow(clippy::too_many_arguments)]
    fn handle_service_resolved(
        &mut self,
        connector_id: i64,
        client_request_id: i32,
        transaction_id: i32,
        service_full_name: &str,
        hostname: &str,
        port: u16,
        txt_record: &[u8],
        interface_idx: u32,
    ) {
        let Some((instance, rest)) = split_escaped_instance(service_full_name) else {
            error!("Invalid service found {}", service_full_name);
            return;
        };
        let service_name = unescape(instance);
        let service_type = rest.replace(".local.", "");
        let now = current_time_millis();
        let duration_ms = self.stored_request_duration(connector_id, client_request_id, now);
        let start_time_ms = self
            .clients
            .get(&connector_id)
            .and_then(|client| client.client_requests.get(&client_request_id))
            .map(|request| request.header().start_time_ms)
            .unwrap_or(now);

        if let Some(client) = self.clients.get_mut(&connector_id) {
            let Some(resolved) = client.resolved_service.as_mut() else {
                error!("resolved-service event without a pending resolve");
                return;
            };
            resolved.service_name = service_name;
            resolved.service_type = service_type;
            resolved.port = port;
            resolved.txt = parse_txt_record(txt_record);
            // The network is attached once the address lookup succeeds.
        }

        self.legacy.stop_operation(transaction_id);
        self.remove_request(connector_id, client_request_id);

        let address_transaction_id = self.get_unique_id();
        if self
            .legacy
            .get_service_address(address_transaction_id, hostname, interface_idx)
        {
            self.store_legacy_request(
                connector_id,
                client_request_id,
                address_transaction_id,
                LegacyVerb::Resolve,
                start_time_ms,
            );
        } else if let Some(client) = self.clients.get_mut(&connector_id) {
            client.on_resolve_service_failed(
                client_request_id,
                NsdError::InternalError,
                transaction_id,
                duration_ms,
            );
            client.resolved_service = None;
        }
    }

    fn handle_engine_event(
        &mut self,
        transaction_id: i32,
        client_request_id: i32,
        kind: EngineEventKind,
        service: Option<MdnsServiceInfo>,
        is_service_from_cache: bool,
    ) {
        let Some(&connector_id) = self.transaction_id_to_connector.get(&transaction_id) else {
            error!("transaction id {} has no client mapping", transaction_id);
            return;
        };
        if self
            .clients
            .get(&connector_id)
            .and_then(|client| client.client_requests.get(&client_request_id))
            .is_none()
        {
            error!("Unknown client request. clientRequestId={}", client_request_id);
            return;
        }

        if kind == EngineEventKind::QuerySent {
            if let Some(request) = self
                .clients
                .get_mut(&connector_id)
                .and_then(|client| client.client_requests.get_mut(&client_request_id))
            {
                request.header_mut().on_query_sent();
            }
            return;
        }

        let Some(service) = service else {
            debug!("engine event {:?} without service info", kind);
            return;
        };
        let Some(mut info) = build_info_from_engine_event(&service, kind) else {
            return;
        };
        self.service_logs.log(format!(
            "MdnsDiscoveryManager event code={:?} transactionId={}",
            kind, transaction_id
        ));
        let now = current_time_millis();
        match kind {
            EngineEventKind::ServiceFound => {
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.on_service_found(client_request_id, info);
                }
            }
            EngineEventKind::ServiceLost => {
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.on_service_lost(client_request_id, info);
                }
            }
            EngineEventKind::ResolveServiceSucceeded => {
                info.port = service.port;
                info.txt = service.attributes.clone();
                let addresses = engine_service_addresses(&service);
                let duration_ms = self.stored_request_duration(connector_id, client_request_id, now);
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    if !addresses.is_empty() {
                        info.host_addresses = addresses;
                        if let Some(request) = client.client_requests.get_mut(&client_request_id) {
                            request
                                .header_mut()
                                .set_service_from_cache(is_service_from_cache);
                        }
                        if let Some(request) = client.client_requests.get(&client_request_id) {
                            client.on_resolve_service_succeeded(
                                client_request_id,
                                info,
                                request,
                                now,
                            );
                        }
                    } else {
                        // No address means the resolution failed.
                        client.on_resolve_service_failed(
                            client_request_id,
                            NsdError::InternalError,
                            transaction_id,
                            duration_ms,
                        );
                    }
                }
                // The resolution is one-shot: drop the listener right away,
                // like the legacy design does.
                match self.remove_request(connector_id, client_request_id) {
                    Some(ClientRequest::DiscoveryManager { listener, .. }) => {
                        self.engine
                            .unregister_listener(listener.listened_service_type(), &listener);
                    }
                    Some(_) => error!("request served by the engine has the wrong variant"),
                    None => {}
                }
            }
            EngineEventKind::ServiceUpdated => {
                info.port = service.port;
                info.txt = service.attributes.clone();
                info.host_addresses = engine_service_addresses(&service);
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.on_service_updated(client_request_id, info);
                    // Mark from-cache only when the update actually came out
                    // of the cache; later wire updates must not clear it.
                    if is_service_from_cache {
                        if let Some(request) = client.client_requests.get_mut(&client_request_id) {
                            request.header_mut().set_service_from_cache(true);
                        }
                    }
                }
            }
            EngineEventKind::ServiceUpdatedLost => {
                if let Some(client) = self.clients.get_mut(&connector_id) {
                    client.on_service_updated_lost(client_request_id);
                }
            }
            EngineEventKind::QuerySent => {}
        }
    }

    // ---- advertiser and offload fan-out ----

    fn client_request_for_transaction(&self, transaction_id: i32) -> Option<(i64, i32)> {
        let Some(&connector_id) = self.transaction_id_to_connector.get(&transaction_id) else {
            error!("Callback for transaction {} has no client", transaction_id);
            return None;
        };
        let Some(client_request_id) = self
            .clients
            .get(&connector_id)
            .and_then(|client| client.client_request_id_for_transaction(transaction_id))
        else {
            error!("Client request id not found for transaction {}", transaction_id);
            return None;
        };
        Some((connector_id, client_request_id))
    }

    /// Replays the currently advertised services on the engine's interface.
    fn send_all_offload_service_infos(&self, engine: &OffloadEngineEntry) {
        for offload_info in self
            .advertiser
            .all_offload_services_for_interface(&engine.interface_name)
        {
            if let Err(e) = engine.callback.try_send(OffloadEvent::Updated(offload_info)) {
                // Can happen in regular cases; a dead peer is cleaned up
                // when it unregisters.
                info!("Failed to send offload callback, remote died: {}", e);
            }
        }
    }

    fn send_offload_service_infos_update(
        &mut self,
        target_interface_name: &str,
        offload_info: OffloadServiceInfo,
        is_remove: bool,
    ) {
        for engine in &self.offload_engines {
            if engine.interface_name != target_interface_name
                || (engine.offload_types & offload_info.offload_type) == 0
            {
                continue;
            }
            let event = if is_remove {
                OffloadEvent::Removed(offload_info.clone())
            } else {
                OffloadEvent::Updated(offload_info.clone())
            };
            if let Err(e) = engine.callback.try_send(event) {
                info!("Failed to send offload callback, remote died: {}", e);
            }
        }
    }

    // ---- client teardown ----

    /// Removes every request of a departing client from the global map and
    /// cancels them in their backends, reporting final metrics.
    fn expunge_all_requests(&mut self, client: &mut ClientInfo) {
        client.logs.log("Client unregistered. Expunging all requests");
        let now = current_time_millis();
        let metrics = client.metrics().clone();
        for (client_request_id, request) in client.client_requests.drain() {
            let transaction_id = request.transaction_id();
            self.transaction_id_to_connector.remove(&transaction_id);
            debug!(
                "Terminating clientRequestId {} transactionId {}",
                client_request_id, transaction_id
            );
            let header = request.header();
            let duration_ms = header.request_duration_ms(now);
            match &request {
                ClientRequest::DiscoveryManager { listener, .. } => {
                    self.engine
                        .unregister_listener(listener.listened_service_type(), listener);
                    match listener.kind() {
                        ListenerKind::Discovery => metrics.report_service_discovery_stop(
                            transaction_id,
                            duration_ms,
                            header.found_service_count(),
                            header.lost_service_count(),
                            header.services_count(),
                            header.sent_query_count(),
                        ),
                        ListenerKind::Resolution => {
                            metrics.report_service_resolution_stop(transaction_id, duration_ms)
                        }
                        ListenerKind::ServiceInfo => metrics
                            .report_service_info_callback_unregistered(
                                transaction_id,
                                duration_ms,
                                header.found_service_count(),
                                header.lost_service_count(),
                                header.is_service_from_cache(),
                                header.sent_query_count(),
                            ),
                    }
                }
                ClientRequest::Advertiser { .. } => {
                    let advertiser_metrics = self.advertiser.get_advertiser_metrics(transaction_id);
                    self.advertiser.remove_service(transaction_id);
                    metrics.report_service_unregistration(
                        transaction_id,
                        duration_ms,
                        &advertiser_metrics,
                    );
                }
                ClientRequest::Legacy { verb, .. } => {
                    self.legacy.stop_operation(transaction_id);
                    match verb {
                        LegacyVerb::Discover => metrics.report_service_discovery_stop(
                            transaction_id,
                            duration_ms,
                            header.found_service_count(),
                            header.lost_service_count(),
                            header.services_count(),
                            0,
                        ),
                        LegacyVerb::Resolve => {
                            metrics.report_service_resolution_stop(transaction_id, duration_ms)
                        }
                        LegacyVerb::Register => metrics.report_service_unregistration(
                            transaction_id,
                            duration_ms,
                            &AdvertiserMetrics::no_packet(),
                        ),
                    }
                }
            }
        }
        self.update_multicast_lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use test_log::test;

    #[derive(Clone, Default)]
    struct FakeLegacy {
        inner: Arc<FakeLegacyState>,
    }

    #[derive(Default)]
    struct FakeLegacyState {
        calls: Mutex<Vec<String>>,
        daemon_running: Mutex<bool>,
        events: Mutex<Option<DaemonEventSender>>,
    }

    impl FakeLegacy {
        fn calls(&self) -> Vec<String> {
            self.inner.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.inner.calls.lock().unwrap().push(call);
        }

        fn daemon_running(&self) -> bool {
            *self.inner.daemon_running.lock().unwrap()
        }

        fn events(&self) -> DaemonEventSender {
            self.inner
                .events
                .lock()
                .unwrap()
                .clone()
                .expect("daemon event listener not registered")
        }
    }

    impl LegacyDaemon for FakeLegacy {
        fn start_daemon(&self) {
            *self.inner.daemon_running.lock().unwrap() = true;
            self.record("start_daemon".to_string());
        }

        fn stop_daemon(&self) {
            *self.inner.daemon_running.lock().unwrap() = false;
            self.record("stop_daemon".to_string());
        }

        fn register_event_listener(&self, events: DaemonEventSender) {
            *self.inner.events.lock().unwrap() = Some(events);
        }

        fn unregister_event_listener(&self) {
            *self.inner.events.lock().unwrap() = None;
        }

        fn register_service(
            &self,
            transaction_id: i32,
            service_name: &str,
            service_type: &str,
            _port: u16,
            _txt_record: &[u8],
            _interface_idx: u32,
        ) -> bool {
            self.record(format!(
                "register {} {} {}",
                transaction_id, service_name, service_type
            ));
            true
        }

        fn discover(&self, transaction_id: i32, service_type: &str, _interface_idx: u32) -> bool {
            self.record(format!("discover {} {}", transaction_id, service_type));
            true
        }

        fn resolve(
            &self,
            transaction_id: i32,
            service_name: &str,
            service_type: &str,
            _domain: &str,
            _interface_idx: u32,
        ) -> bool {
            self.record(format!(
                "resolve {} {}.{}",
                transaction_id, service_name, service_type
            ));
            true
        }

        fn get_service_address(
            &self,
            transaction_id: i32,
            hostname: &str,
            _interface_idx: u32,
        ) -> bool {
            self.record(format!("get_addr {} {}", transaction_id, hostname));
            true
        }

        fn stop_operation(&self, transaction_id: i32) -> bool {
            self.record(format!("stop {}", transaction_id));
            true
        }
    }

    #[derive(Clone, Default)]
    struct FakeEngine {
        inner: Arc<FakeEngineState>,
    }

    #[derive(Default)]
    struct FakeEngineState {
        listeners: Mutex<Vec<(String, Arc<MdnsListener>)>>,
    }

    impl FakeEngine {
        fn listener_count(&self) -> usize {
            self.inner.listeners.lock().unwrap().len()
        }

        fn last_listener(&self) -> (String, Arc<MdnsListener>) {
            self.inner
                .listeners
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("no listener registered")
        }
    }

    impl DiscoveryEngine for FakeEngine {
        fn register_listener(
            &self,
            service_type: &str,
            listener: Arc<MdnsListener>,
            _options: MdnsSearchOptions,
        ) {
            self.inner
                .listeners
                .lock()
                .unwrap()
                .push((service_type.to_string(), listener));
        }

        fn unregister_listener(&self, service_type: &str, listener: &Arc<MdnsListener>) {
            self.inner
                .listeners
                .lock()
                .unwrap()
                .retain(|(ty, l)| !(ty == service_type && Arc::ptr_eq(l, listener)));
        }
    }

    #[derive(Clone, Default)]
    struct FakeAdvertiser {
        inner: Arc<FakeAdvertiserState>,
    }

    #[derive(Default)]
    struct FakeAdvertiserState {
        calls: Mutex<Vec<String>>,
        offload_snapshot: Mutex<Vec<OffloadServiceInfo>>,
    }

    impl FakeAdvertiser {
        fn calls(&self) -> Vec<String> {
            self.inner.calls.lock().unwrap().clone()
        }

        fn set_offload_snapshot(&self, snapshot: Vec<OffloadServiceInfo>) {
            *self.inner.offload_snapshot.lock().unwrap() = snapshot;
        }
    }

    impl ServiceAdvertiser for FakeAdvertiser {
        fn add_service(
            &self,
            transaction_id: i32,
            service: NsdServiceInfo,
            subtype: Option<&str>,
        ) {
            self.inner.calls.lock().unwrap().push(format!(
                "add {} {} {} {:?}",
                transaction_id, service.service_name, service.service_type, subtype
            ));
        }

        fn remove_service(&self, transaction_id: i32) {
            self.inner
                .calls
                .lock()
                .unwrap()
                .push(format!("remove {}", transaction_id));
        }

        fn get_advertiser_metrics(&self, _transaction_id: i32) -> AdvertiserMetrics {
            AdvertiserMetrics::default()
        }

        fn all_offload_services_for_interface(
            &self,
            _interface_name: &str,
        ) -> Vec<OffloadServiceInfo> {
            self.inner.offload_snapshot.lock().unwrap().clone()
        }
    }

    #[derive(Clone, Default)]
    struct FakeSockets {
        inner: Arc<FakeSocketsState>,
    }

    #[derive(Default)]
    struct FakeSocketsState {
        calls: Mutex<Vec<String>>,
    }

    impl SocketProvider for FakeSockets {
        fn start_monitoring_sockets(&self) {
            self.inner
                .calls
                .lock()
                .unwrap()
                .push("start_monitoring".to_string());
        }

        fn request_stop_when_inactive(&self) {
            self.inner
                .calls
                .lock()
                .unwrap()
                .push("stop_when_inactive".to_string());
        }
    }

    #[derive(Clone, Default)]
    struct FakeLock {
        inner: Arc<FakeLockState>,
    }

    #[derive(Default)]
    struct FakeLockState {
        acquired: AtomicU32,
        released: AtomicU32,
    }

    impl FakeLock {
        fn acquired(&self) -> u32 {
            self.inner.acquired.load(Ordering::SeqCst)
        }

        fn released(&self) -> u32 {
            self.inner.released.load(Ordering::SeqCst)
        }
    }

    impl MulticastLock for FakeLock {
        fn acquire(&self) {
            self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.inner.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullLinks;

    impl LinkResolver for NullLinks {
        fn interface_name_for_network(&self, _network: Network) -> Option<String> {
            None
        }

        fn interface_index_by_name(&self, _interface_name: &str) -> Option<u32> {
            None
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        receiver: Receiver<Command>,
        legacy: FakeLegacy,
        engine: FakeEngine,
        advertiser: FakeAdvertiser,
        sockets: FakeSockets,
        lock: FakeLock,
    }

    fn new_harness(properties: &[(&str, &str)]) -> Harness {
        let legacy = FakeLegacy::default();
        let engine = FakeEngine::default();
        let advertiser = FakeAdvertiser::default();
        let sockets = FakeSockets::default();
        let lock = FakeLock::default();
        let config = StaticDeviceConfig::new(
            properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let (sender, receiver) = flume::unbounded();
        let deps = NsdDependencies {
            legacy_daemon: Box::new(legacy.clone()),
            discovery_engine: Box::new(engine.clone()),
            advertiser: Box::new(advertiser.clone()),
            socket_provider: Box::new(sockets.clone()),
            multicast_lock: Box::new(lock.clone()),
            link_resolver: Box::new(NullLinks),
            device_config: Box::new(config),
            metrics: Arc::new(NoopMetrics),
            cleanup_delay_ms: CLEANUP_DELAY_MS,
        };
        let mut orchestrator = Orchestrator::new(deps, sender);
        orchestrator.enter_enabled();
        Harness {
            orchestrator,
            receiver,
            legacy,
            engine,
            advertiser,
            sockets,
            lock,
        }
    }

    impl Harness {
        fn connect(
            &mut self,
            connector_id: i64,
            uid: u32,
            use_modern_backend: bool,
        ) -> Receiver<ClientEvent> {
            let (callback, events) = flume::unbounded();
            self.orchestrator.dispatch(Command::RegisterClient {
                connector_id,
                callback,
                uid,
                use_modern_backend,
            });
            events
        }

        /// Feeds everything backends posted on the loop-back channel into
        /// the state machine.
        fn drain_posted(&mut self) {
            while let Ok(command) = self.receiver.try_recv() {
                self.orchestrator.dispatch(command);
            }
        }

        fn assert_registry_consistent(&self) {
            for (transaction_id, connector_id) in &self.orchestrator.transaction_id_to_connector {
                let client = self
                    .orchestrator
                    .clients
                    .get(connector_id)
                    .expect("dangling transaction index entry");
                assert!(
                    client
                        .client_request_id_for_transaction(*transaction_id)
                        .is_some(),
                    "transaction {} indexed but not held by its client",
                    transaction_id
                );
            }
            for (connector_id, client) in &self.orchestrator.clients {
                for request in client.client_requests.values() {
                    assert_eq!(
                        self.orchestrator
                            .transaction_id_to_connector
                            .get(&request.transaction_id()),
                        Some(connector_id)
                    );
                }
            }
        }
    }

    fn info_for_type(service_type: &str) -> NsdServiceInfo {
        NsdServiceInfo::new("", service_type)
    }

    #[test]
    fn test_legacy_discover_stop() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 7,
            info: info_for_type("_ipp._tcp"),
        });
        assert!(h.legacy.daemon_running());
        assert!(h
            .legacy
            .calls()
            .contains(&"discover 1 _ipp._tcp".to_string()));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::DiscoverServicesStarted { listener_key: 7, .. }
        ));
        h.assert_registry_consistent();

        let daemon = h.legacy.events();
        daemon.send(MDnsEvent::ServiceFound {
            transaction_id: 1,
            service_name: "printer1".to_string(),
            registration_type: "_ipp._tcp.".to_string(),
            net_id: 42,
            interface_idx: 3,
        });
        daemon.send(MDnsEvent::ServiceFound {
            transaction_id: 1,
            service_name: "printer2".to_string(),
            registration_type: "_ipp._tcp.".to_string(),
            net_id: 42,
            interface_idx: 3,
        });
        // No backing network: dropped.
        daemon.send(MDnsEvent::ServiceFound {
            transaction_id: 1,
            service_name: "ghost".to_string(),
            registration_type: "_ipp._tcp.".to_string(),
            net_id: NETID_UNSET,
            interface_idx: 3,
        });
        // Local advertisement loopback: dropped.
        daemon.send(MDnsEvent::ServiceFound {
            transaction_id: 1,
            service_name: "loopback".to_string(),
            registration_type: "_ipp._tcp.".to_string(),
            net_id: DUMMY_NET_ID,
            interface_idx: 3,
        });
        daemon.send(MDnsEvent::ServiceLost {
            transaction_id: 1,
            service_name: "printer1".to_string(),
            registration_type: "_ipp._tcp.".to_string(),
            net_id: 42,
            interface_idx: 3,
        });
        h.drain_posted();

        match events.try_recv().unwrap() {
            ClientEvent::ServiceFound { listener_key, info } => {
                assert_eq!(listener_key, 7);
                assert_eq!(info.service_name, "printer1");
                assert_eq!(info.network, Some(Network(42)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServiceFound { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServiceLost { .. }
        ));
        assert!(events.try_recv().is_err());

        h.orchestrator.dispatch(Command::StopDiscovery {
            connector_id: 1,
            listener_key: 7,
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::StopDiscoverySucceeded { listener_key: 7 }
        ));
        assert!(h.legacy.calls().contains(&"stop 1".to_string()));
        assert!(h.orchestrator.transaction_id_to_connector.is_empty());
        assert!(h.orchestrator.cleanup_at.is_some());
        h.assert_registry_consistent();
    }

    #[test]
    fn test_modern_discover_event_lowering() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, true);

        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 2,
            info: info_for_type("_ipp._tcp"),
        });
        assert_eq!(h.engine.listener_count(), 1);
        let (service_type, listener) = h.engine.last_listener();
        assert_eq!(service_type, "_ipp._tcp.local");
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::DiscoverServicesStarted { .. }
        ));
        // The socket monitor starts on the first modern request.
        assert_eq!(
            h.sockets.inner.calls.lock().unwrap().as_slice(),
            &["start_monitoring".to_string()]
        );

        listener.on_service_name_discovered(
            MdnsServiceInfo {
                instance_name: "printer1".to_string(),
                service_type_labels: vec![
                    "_ipp".to_string(),
                    "_tcp".to_string(),
                    "local".to_string(),
                ],
                network: Some(Network(42)),
                interface_index: 3,
                ..MdnsServiceInfo::default()
            },
            false,
        );
        // A type sequence not ending in `local` is rejected.
        listener.on_service_name_discovered(
            MdnsServiceInfo {
                instance_name: "bogus".to_string(),
                service_type_labels: vec!["_ipp".to_string(), "_tcp".to_string()],
                ..MdnsServiceInfo::default()
            },
            false,
        );
        h.drain_posted();

        match events.try_recv().unwrap() {
            ClientEvent::ServiceFound { info, .. } => {
                assert_eq!(info.service_name, "printer1");
                // Discovered types keep a trailing dot.
                assert_eq!(info.service_type, "_ipp._tcp.");
                assert_eq!(info.network, Some(Network(42)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());

        h.orchestrator.dispatch(Command::StopDiscovery {
            connector_id: 1,
            listener_key: 2,
        });
        assert_eq!(h.engine.listener_count(), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::StopDiscoverySucceeded { .. }
        ));
        assert!(h.orchestrator.transaction_id_to_connector.is_empty());
    }

    #[test]
    fn test_modern_resolve_is_one_shot() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, true);

        let mut info = NsdServiceInfo::new("printer1", "_ipp._tcp");
        info.network = None;
        h.orchestrator.dispatch(Command::ResolveService {
            connector_id: 1,
            listener_key: 4,
            info,
        });
        assert_eq!(h.engine.listener_count(), 1);
        let (_, listener) = h.engine.last_listener();

        listener.on_service_found(
            MdnsServiceInfo {
                instance_name: "printer1".to_string(),
                service_type_labels: vec![
                    "_ipp".to_string(),
                    "_tcp".to_string(),
                    "local".to_string(),
                ],
                port: 631,
                ipv4_addresses: vec!["192.0.2.5".to_string()],
                network: Some(Network(42)),
                ..MdnsServiceInfo::default()
            },
            true,
        );
        h.drain_posted();

        match events.try_recv().unwrap() {
            ClientEvent::ResolveServiceSucceeded { listener_key, info } => {
                assert_eq!(listener_key, 4);
                // Resolved types keep a leading dot.
                assert_eq!(info.service_type, "._ipp._tcp");
                assert_eq!(info.port, 631);
                assert_eq!(info.host_addresses, vec!["192.0.2.5".parse::<IpAddr>().unwrap()]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        // The listener is dropped without an explicit stop verb.
        assert_eq!(h.engine.listener_count(), 0);
        assert!(h.orchestrator.transaction_id_to_connector.is_empty());
        h.assert_registry_consistent();
    }

    #[test]
    fn test_legacy_resolve_chaining() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::ResolveService {
            connector_id: 1,
            listener_key: 3,
            info: NsdServiceInfo::new("My", "_foo._tcp"),
        });
        assert!(h.legacy.calls().contains(&"resolve 1 My._foo._tcp".to_string()));
        let daemon = h.legacy.events();

        daemon.send(MDnsEvent::ServiceResolved {
            transaction_id: 1,
            service_full_name: "My._foo._tcp.local.".to_string(),
            hostname: "myhost.local.".to_string(),
            port: 515,
            txt_record: Vec::new(),
            interface_idx: 2,
        });
        h.drain_posted();

        // Phase one stops, phase two starts under a fresh transaction id.
        let calls = h.legacy.calls();
        assert!(calls.contains(&"stop 1".to_string()));
        assert!(calls.contains(&"get_addr 2 myhost.local.".to_string()));
        assert!(h.orchestrator.transaction_id_to_connector.contains_key(&2));
        assert!(!h.orchestrator.transaction_id_to_connector.contains_key(&1));
        h.assert_registry_consistent();

        daemon.send(MDnsEvent::GetAddressSuccess {
            transaction_id: 2,
            address: "192.0.2.7".to_string(),
            net_id: 42,
            interface_idx: 2,
        });
        h.drain_posted();

        match events.try_recv().unwrap() {
            ClientEvent::ResolveServiceSucceeded { listener_key, info } => {
                assert_eq!(listener_key, 3);
                assert_eq!(info.service_name, "My");
                assert_eq!(info.service_type, "._foo._tcp");
                assert_eq!(info.port, 515);
                assert_eq!(info.host_addresses, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
                assert_eq!(info.network, Some(Network(42)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(h.orchestrator.transaction_id_to_connector.is_empty());
        assert!(h.orchestrator.clients.get(&1).unwrap().resolved_service.is_none());
        assert!(h.legacy.calls().contains(&"stop 2".to_string()));
    }

    #[test]
    fn test_legacy_resolve_without_network_fails() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::ResolveService {
            connector_id: 1,
            listener_key: 3,
            info: NsdServiceInfo::new("My", "_foo._tcp"),
        });
        let daemon = h.legacy.events();
        daemon.send(MDnsEvent::ServiceResolved {
            transaction_id: 1,
            service_full_name: "My._foo._tcp.local.".to_string(),
            hostname: "myhost.local.".to_string(),
            port: 515,
            txt_record: Vec::new(),
            interface_idx: 2,
        });
        daemon.send(MDnsEvent::GetAddressSuccess {
            transaction_id: 2,
            address: "192.0.2.7".to_string(),
            net_id: NETID_UNSET,
            interface_idx: 2,
        });
        h.drain_posted();

        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ResolveServiceFailed {
                error: NsdError::InternalError,
                ..
            }
        ));
        assert!(h.orchestrator.transaction_id_to_connector.is_empty());
    }

    #[test]
    fn test_legacy_second_resolve_already_active() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::ResolveService {
            connector_id: 1,
            listener_key: 3,
            info: NsdServiceInfo::new("My", "_foo._tcp"),
        });
        h.orchestrator.dispatch(Command::ResolveService {
            connector_id: 1,
            listener_key: 4,
            info: NsdServiceInfo::new("Other", "_foo._tcp"),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ResolveServiceFailed {
                listener_key: 4,
                error: NsdError::AlreadyActive,
            }
        ));
    }

    #[test]
    fn test_quota_enforcement() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        for listener_key in 0..11 {
            h.orchestrator.dispatch(Command::DiscoverServices {
                connector_id: 1,
                listener_key,
                info: info_for_type("_ipp._tcp"),
            });
        }
        let mut started = 0;
        let mut max_limit = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ClientEvent::DiscoverServicesStarted { .. } => started += 1,
                ClientEvent::DiscoverServicesFailed {
                    listener_key,
                    error: NsdError::MaxLimit,
                } => {
                    assert_eq!(listener_key, 10);
                    max_limit += 1;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(started, 10);
        assert_eq!(max_limit, 1);
        assert_eq!(
            h.orchestrator.clients.get(&1).unwrap().client_requests.len(),
            10
        );
        h.assert_registry_consistent();
    }

    #[test]
    fn test_unique_id_monotone_and_skips_zero() {
        let mut h = new_harness(&[]);
        assert_eq!(h.orchestrator.get_unique_id(), 1);
        assert_eq!(h.orchestrator.get_unique_id(), 2);
        assert_eq!(h.orchestrator.get_unique_id(), 3);

        // Around the wrap the sentinel 0 is skipped.
        h.orchestrator.unique_id = -2;
        assert_eq!(h.orchestrator.get_unique_id(), -1);
        assert_eq!(h.orchestrator.get_unique_id(), 1);
    }

    #[test]
    fn test_type_allowlist_routing() {
        let mut h = new_harness(&[
            ("mdns_type_allowlist_flags", "_foo._tcp:foo"),
            ("mdns_discovery_manager_allowlist_foo_version", "true"),
        ]);
        h.connect(1, 1000, false);

        // Allowlisted type goes to the modern engine even though the global
        // flag is off.
        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_foo._tcp"),
        });
        assert_eq!(h.engine.listener_count(), 1);
        assert!(h.legacy.calls().is_empty());

        // Anything else stays on the legacy daemon.
        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 2,
            info: info_for_type("_bar._tcp"),
        });
        assert_eq!(h.engine.listener_count(), 1);
        assert!(h.legacy.calls().iter().any(|c| c.contains("_bar._tcp")));
    }

    #[test]
    fn test_modern_register_truncates_and_reports() {
        let mut h = new_harness(&[("mdns_advertiser_version", "true")]);
        let events = h.connect(1, 1000, false);

        let long_name = "n".repeat(70);
        h.orchestrator.dispatch(Command::RegisterService {
            connector_id: 1,
            listener_key: 5,
            info: NsdServiceInfo::new(&long_name, "_ipp._tcp"),
        });
        // No immediate callback; the name is truncated to 63 bytes.
        assert!(events.try_recv().is_err());
        let calls = h.advertiser.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&"n".repeat(63)));
        assert!(!calls[0].contains(&"n".repeat(64)));

        h.orchestrator.dispatch(Command::AdvertiserRegisterSucceeded {
            transaction_id: 1,
            service_name: "n".repeat(63),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::RegisterServiceSucceeded { listener_key: 5, .. }
        ));

        h.orchestrator.dispatch(Command::UnregisterService {
            connector_id: 1,
            listener_key: 5,
        });
        assert!(h.advertiser.calls().contains(&"remove 1".to_string()));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::UnregisterServiceSucceeded { listener_key: 5 }
        ));
        assert!(h.orchestrator.transaction_id_to_connector.is_empty());
    }

    #[test]
    fn test_legacy_register_reports_on_daemon_event() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        let mut info = NsdServiceInfo::new("My Printer", "_ipp._tcp.");
        info.port = 631;
        h.orchestrator.dispatch(Command::RegisterService {
            connector_id: 1,
            listener_key: 6,
            info,
        });
        assert!(events.try_recv().is_err());

        h.legacy.events().send(MDnsEvent::ServiceRegistered {
            transaction_id: 1,
            service_name: "My Printer".to_string(),
        });
        h.drain_posted();
        match events.try_recv().unwrap() {
            ClientEvent::RegisterServiceSucceeded { listener_key, info } => {
                assert_eq!(listener_key, 6);
                assert_eq!(info.service_name, "My Printer");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_multicast_lock_gating() {
        let mut h = new_harness(&[]);
        h.connect(1, 1000, true);

        h.orchestrator.dispatch(Command::LockNetworkAdded(Network(101)));
        h.orchestrator.dispatch(Command::UidImportanceChanged {
            uid: 1000,
            importance: 50,
        });
        assert_eq!(h.lock.acquired(), 0);

        // A modern request with no requested network matches any network.
        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });
        assert_eq!(h.lock.acquired(), 1);

        // Re-evaluation while held is a no-op.
        h.orchestrator.dispatch(Command::UidImportanceChanged {
            uid: 2000,
            importance: 50,
        });
        assert_eq!(h.lock.acquired(), 1);
        assert_eq!(h.lock.released(), 0);

        h.orchestrator.dispatch(Command::StopDiscovery {
            connector_id: 1,
            listener_key: 1,
        });
        assert_eq!(h.lock.released(), 1);

        // A background uid does not hold the lock.
        h.orchestrator.dispatch(Command::UidImportanceChanged {
            uid: 1000,
            importance: 400,
        });
        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 2,
            info: info_for_type("_ipp._tcp"),
        });
        assert_eq!(h.lock.acquired(), 1);
    }

    #[test]
    fn test_client_death_cleans_up_both_backends() {
        let mut h = new_harness(&[("mdns_advertiser_version", "true")]);
        h.connect(1, 1000, false);

        // One legacy discovery and one modern advertisement.
        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });
        h.orchestrator.dispatch(Command::RegisterService {
            connector_id: 1,
            listener_key: 2,
            info: NsdServiceInfo::new("My Printer", "_ipp._tcp"),
        });
        // Make the lock held through the advertiser request.
        h.orchestrator.dispatch(Command::LockNetworkAdded(Network(101)));
        h.orchestrator.dispatch(Command::UidImportanceChanged {
            uid: 1000,
            importance: 50,
        });
        assert_eq!(h.lock.acquired(), 1);
        assert_eq!(h.orchestrator.transaction_id_to_connector.len(), 2);

        h.orchestrator.dispatch(Command::UnregisterClient { connector_id: 1 });

        assert!(h.legacy.calls().contains(&"stop 1".to_string()));
        assert!(h.advertiser.calls().contains(&"remove 2".to_string()));
        assert!(h.orchestrator.clients.is_empty());
        assert!(h.orchestrator.transaction_id_to_connector.is_empty());
        assert_eq!(h.lock.released(), 1);
        h.assert_registry_consistent();
    }

    #[test]
    fn test_daemon_lifecycle() {
        let mut h = new_harness(&[]);
        let _events = h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });
        // The daemon starts before the verb is issued.
        let calls = h.legacy.calls();
        assert_eq!(calls[0], "start_daemon");
        assert!(calls[1].starts_with("discover"));
        assert!(h.orchestrator.cleanup_at.is_none());

        h.orchestrator.dispatch(Command::StopDiscovery {
            connector_id: 1,
            listener_key: 1,
        });
        assert!(h.orchestrator.cleanup_at.is_some());
        h.orchestrator.dispatch(Command::DaemonCleanup);
        assert!(!h.legacy.daemon_running());

        // A new request restarts the daemon.
        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 2,
            info: info_for_type("_ipp._tcp"),
        });
        assert!(h.legacy.daemon_running());
    }

    #[test]
    fn test_pre_s_client_keeps_daemon_alive() {
        let mut h = new_harness(&[]);
        h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::StartDaemon { connector_id: 1 });
        assert!(h.legacy.daemon_running());
        assert!(h.orchestrator.clients.get(&1).unwrap().is_pre_s_client);

        // Cleanup is ignored while a pre-S client is connected.
        h.orchestrator.dispatch(Command::DaemonCleanup);
        assert!(h.legacy.daemon_running());

        // Its departure schedules the stop again.
        h.orchestrator.dispatch(Command::UnregisterClient { connector_id: 1 });
        assert_eq!(h.orchestrator.legacy_client_count, 0);
        assert!(h.orchestrator.cleanup_at.is_some());
        h.orchestrator.dispatch(Command::DaemonCleanup);
        assert!(!h.legacy.daemon_running());
    }

    #[test]
    fn test_default_state_failure_mapping() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);
        h.orchestrator.state = State::Default;

        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::DiscoverServicesFailed {
                error: NsdError::InternalError,
                ..
            }
        ));

        h.orchestrator.dispatch(Command::StopResolution {
            connector_id: 1,
            listener_key: 1,
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::StopResolutionFailed {
                error: NsdError::OperationNotRunning,
                ..
            }
        ));

        h.orchestrator.dispatch(Command::RegisterServiceCallback {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServiceInfoCallbackRegistrationFailed {
                error: NsdError::BadParameters,
                ..
            }
        ));
    }

    #[test]
    fn test_service_info_callback_flow() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::RegisterServiceCallback {
            connector_id: 1,
            listener_key: 9,
            info: NsdServiceInfo::new("printer1", "_ipp._tcp"),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServiceInfoCallbackRegistered { listener_key: 9 }
        ));
        let (_, listener) = h.engine.last_listener();

        listener.on_service_found(
            MdnsServiceInfo {
                instance_name: "printer1".to_string(),
                service_type_labels: vec![
                    "_ipp".to_string(),
                    "_tcp".to_string(),
                    "local".to_string(),
                ],
                port: 631,
                ipv4_addresses: vec!["192.0.2.5".to_string()],
                network: Some(Network(42)),
                ..MdnsServiceInfo::default()
            },
            false,
        );
        listener.on_service_removed(MdnsServiceInfo {
            instance_name: "printer1".to_string(),
            service_type_labels: vec![
                "_ipp".to_string(),
                "_tcp".to_string(),
                "local".to_string(),
            ],
            ..MdnsServiceInfo::default()
        });
        h.drain_posted();

        match events.try_recv().unwrap() {
            ClientEvent::ServiceUpdated { listener_key, info } => {
                assert_eq!(listener_key, 9);
                assert_eq!(info.service_type, "_ipp._tcp");
                assert_eq!(info.port, 631);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServiceUpdatedLost { listener_key: 9 }
        ));

        // A bad type never reaches the engine.
        h.orchestrator.dispatch(Command::RegisterServiceCallback {
            connector_id: 1,
            listener_key: 10,
            info: NsdServiceInfo::new("x", "not-a-type"),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServiceInfoCallbackRegistrationFailed {
                error: NsdError::BadParameters,
                ..
            }
        ));

        h.orchestrator.dispatch(Command::UnregisterServiceCallback {
            connector_id: 1,
            listener_key: 9,
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServiceInfoCallbackUnregistered { listener_key: 9 }
        ));
        assert_eq!(h.engine.listener_count(), 0);
    }

    #[test]
    fn test_unregister_service_callback_wrong_variant() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, false);

        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::DiscoverServicesStarted { .. }
        ));

        // A legacy request cannot be torn down through the callback verb.
        h.orchestrator.dispatch(Command::UnregisterServiceCallback {
            connector_id: 1,
            listener_key: 1,
        });
        assert!(events.try_recv().is_err());
        assert_eq!(
            h.orchestrator.clients.get(&1).unwrap().client_requests.len(),
            1
        );
    }

    #[test]
    fn test_offload_broadcast() {
        let mut h = new_harness(&[]);
        h.connect(1, 1000, false);

        let snapshot = OffloadServiceInfo {
            service_name: "printer1".to_string(),
            service_type: "_ipp._tcp".to_string(),
            hostname: "myhost.local".to_string(),
            offload_payload: Vec::new(),
            priority: 0,
            offload_type: 0b01,
        };
        h.advertiser.set_offload_snapshot(vec![snapshot.clone()]);

        let (wlan_s, wlan_r) = flume::unbounded();
        h.orchestrator.dispatch(Command::RegisterOffloadEngine {
            engine_id: 1,
            interface_name: "wlan0".to_string(),
            offload_capabilities: 0,
            offload_types: 0b01,
            callback: wlan_s,
        });
        // The current snapshot is replayed on registration.
        assert!(matches!(wlan_r.try_recv().unwrap(), OffloadEvent::Updated(_)));

        let (eth_s, eth_r) = flume::unbounded();
        h.orchestrator.dispatch(Command::RegisterOffloadEngine {
            engine_id: 2,
            interface_name: "eth0".to_string(),
            offload_capabilities: 0,
            offload_types: 0b10,
            callback: eth_s,
        });
        let _ = eth_r.try_recv(); // snapshot replay, interface not filtered

        // Updates route on interface name and offload type intersection.
        h.orchestrator.dispatch(Command::OffloadStartOrUpdate {
            interface_name: "wlan0".to_string(),
            info: snapshot.clone(),
        });
        assert!(matches!(wlan_r.try_recv().unwrap(), OffloadEvent::Updated(_)));
        assert!(eth_r.try_recv().is_err());

        h.orchestrator.dispatch(Command::OffloadStop {
            interface_name: "wlan0".to_string(),
            info: snapshot.clone(),
        });
        assert!(matches!(wlan_r.try_recv().unwrap(), OffloadEvent::Removed(_)));

        h.orchestrator
            .dispatch(Command::UnregisterOffloadEngine { engine_id: 1 });
        h.orchestrator.dispatch(Command::OffloadStartOrUpdate {
            interface_name: "wlan0".to_string(),
            info: snapshot,
        });
        assert!(wlan_r.try_recv().is_err());
    }

    #[test]
    fn test_monitor_receives_sticky_state() {
        let mut h = new_harness(&[]);
        let (monitor_s, monitor_r) = flume::bounded(100);
        h.orchestrator.dispatch(Command::Monitor(monitor_s));
        assert!(matches!(
            monitor_r.try_recv().unwrap(),
            DaemonEvent::StateChanged(NsdState::Enabled)
        ));
    }

    #[test]
    fn test_dump_contains_records_and_logs() {
        let mut h = new_harness(&[]);
        h.connect(1, 1000, false);
        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });

        let (dump_s, dump_r) = flume::bounded(1);
        h.orchestrator.dispatch(Command::Dump(dump_s));
        let dump = dump_r.try_recv().unwrap();
        assert!(dump.contains("Command DiscoverServices"));
        assert!(dump.contains("Start mdns daemon"));
    }

    #[test]
    fn test_discovery_query_sent_counts_only() {
        let mut h = new_harness(&[]);
        let events = h.connect(1, 1000, true);

        h.orchestrator.dispatch(Command::DiscoverServices {
            connector_id: 1,
            listener_key: 1,
            info: info_for_type("_ipp._tcp"),
        });
        let _ = events.try_recv();
        let (_, listener) = h.engine.last_listener();
        listener.on_discovery_query_sent();
        listener.on_discovery_query_sent();
        h.drain_posted();

        // No client event; only the per-request counter moves.
        assert!(events.try_recv().is_err());
        let client = h.orchestrator.clients.get(&1).unwrap();
        let request = client.client_requests.get(&1).unwrap();
        assert_eq!(request.header().sent_query_count(), 2);
    }
}
