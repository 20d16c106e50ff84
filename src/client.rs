//! Per-client state: the callback channel, outstanding requests and the
//! counters reported to the metrics sink.

use crate::backend::{AdvertiserMetrics, MetricsSink};
use crate::orchestrator::MdnsListener;
use crate::service_info::{Network, NsdServiceInfo};
use crate::shared_log::SharedLog;
#[cfg(feature = "logging")]
use crate::log::debug;
use flume::Sender;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Max outstanding requests per client.
pub(crate) const MAX_LIMIT: usize = 10;

/// Cap on the unique service names tracked per request for metrics.
const MAX_SERVICES_COUNT_METRIC_PER_CLIENT: usize = 100;

/// Sentinel transaction id for failures that never reached a backend.
pub(crate) const NO_TRANSACTION: i32 = -1;

/// Error codes surfaced to clients in `*Failed` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NsdError {
    /// A backend failure, an unparsable service type, or an interface lookup
    /// failure.
    InternalError,
    /// A second in-flight legacy resolve on the same client.
    AlreadyActive,
    /// The per-client outstanding request quota was reached.
    MaxLimit,
    /// Bad service type on a callback registration.
    BadParameters,
    /// A stop verb named a request that is not running.
    OperationNotRunning,
}

/// Events delivered to a client on the channel returned from `connect`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ClientEvent {
    DiscoverServicesStarted {
        listener_key: i32,
        info: NsdServiceInfo,
    },
    DiscoverServicesFailed {
        listener_key: i32,
        error: NsdError,
    },
    ServiceFound {
        listener_key: i32,
        info: NsdServiceInfo,
    },
    ServiceLost {
        listener_key: i32,
        info: NsdServiceInfo,
    },
    StopDiscoverySucceeded {
        listener_key: i32,
    },
    StopDiscoveryFailed {
        listener_key: i32,
        error: NsdError,
    },
    RegisterServiceSucceeded {
        listener_key: i32,
        info: NsdServiceInfo,
    },
    RegisterServiceFailed {
        listener_key: i32,
        error: NsdError,
    },
    UnregisterServiceSucceeded {
        listener_key: i32,
    },
    UnregisterServiceFailed {
        listener_key: i32,
        error: NsdError,
    },
    ResolveServiceSucceeded {
        listener_key: i32,
        info: NsdServiceInfo,
    },
    ResolveServiceFailed {
        listener_key: i32,
        error: NsdError,
    },
    StopResolutionSucceeded {
        listener_key: i32,
    },
    StopResolutionFailed {
        listener_key: i32,
        error: NsdError,
    },
    ServiceInfoCallbackRegistered {
        listener_key: i32,
    },
    ServiceInfoCallbackRegistrationFailed {
        listener_key: i32,
        error: NsdError,
    },
    ServiceUpdated {
        listener_key: i32,
        info: NsdServiceInfo,
    },
    ServiceUpdatedLost {
        listener_key: i32,
    },
    ServiceInfoCallbackUnregistered {
        listener_key: i32,
    },
}

/// Counters and timing shared by every request variant.
#[derive(Debug)]
pub(crate) struct RequestHeader {
    pub(crate) transaction_id: i32,
    pub(crate) start_time_ms: u64,
    found_service_count: u32,
    lost_service_count: u32,
    service_names: HashSet<String>,
    is_service_from_cache: bool,
    sent_query_count: u32,
}

impl RequestHeader {
    pub(crate) fn new(transaction_id: i32, start_time_ms: u64) -> Self {
        Self {
            transaction_id,
            start_time_ms,
            found_service_count: 0,
            lost_service_count: 0,
            service_names: HashSet::new(),
            is_service_from_cache: false,
            sent_query_count: 0,
        }
    }

    pub(crate) fn request_duration_ms(&self, stop_time_ms: u64) -> u64 {
        stop_time_ms.saturating_sub(self.start_time_ms)
    }

    pub(crate) fn on_service_found(&mut self, service_name: &str) {
        self.found_service_count += 1;
        if self.service_names.len() < MAX_SERVICES_COUNT_METRIC_PER_CLIENT {
            self.service_names.insert(service_name.to_string());
        }
    }

    pub(crate) fn on_service_lost(&mut self) {
        self.lost_service_count += 1;
    }

    /// The from-cache flag is sticky: once a request saw a cached answer it
    /// stays marked even if later answers come off the wire.
    pub(crate) fn set_service_from_cache(&mut self, is_service_from_cache: bool) {
        if is_service_from_cache {
            self.is_service_from_cache = true;
        }
    }

    pub(crate) fn is_service_from_cache(&self) -> bool {
        self.is_service_from_cache
    }

    pub(crate) fn on_query_sent(&mut self) {
        self.sent_query_count += 1;
    }

    pub(crate) fn found_service_count(&self) -> u32 {
        self.found_service_count
    }

    pub(crate) fn lost_service_count(&self) -> u32 {
        self.lost_service_count
    }

    pub(crate) fn services_count(&self) -> usize {
        self.service_names.len()
    }

    pub(crate) fn sent_query_count(&self) -> u32 {
        self.sent_query_count
    }
}

/// The legacy verb that created a request, so cleanup can issue the matching
/// stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LegacyVerb {
    Discover,
    Register,
    Resolve,
}

/// One outstanding operation.
#[derive(Debug)]
pub(crate) enum ClientRequest {
    /// Served by the legacy daemon.
    Legacy {
        header: RequestHeader,
        verb: LegacyVerb,
    },
    /// Served by the modern advertiser.
    Advertiser {
        header: RequestHeader,
        requested_network: Option<Network>,
    },
    /// Served by the modern discovery engine through a listener.
    DiscoveryManager {
        header: RequestHeader,
        listener: Arc<MdnsListener>,
        requested_network: Option<Network>,
    },
}

impl ClientRequest {
    pub(crate) fn header(&self) -> &RequestHeader {
        match self {
            Self::Legacy { header, .. }
            | Self::Advertiser { header, .. }
            | Self::DiscoveryManager { header, .. } => header,
        }
    }

    pub(crate) fn header_mut(&mut self) -> &mut RequestHeader {
        match self {
            Self::Legacy { header, .. }
            | Self::Advertiser { header, .. }
            | Self::DiscoveryManager { header, .. } => header,
        }
    }

    pub(crate) fn transaction_id(&self) -> i32 {
        self.header().transaction_id
    }

    /// For modern-backend requests, the network the request asked for
    /// (`None` meaning any network). Legacy requests return `None` outright.
    fn modern_requested_network(&self) -> Option<Option<Network>> {
        match self {
            Self::Legacy { .. } => None,
            Self::Advertiser {
                requested_network, ..
            }
            | Self::DiscoveryManager {
                requested_network, ..
            } => Some(*requested_network),
        }
    }
}

/// Whether a requested network (None = any) matches any of `networks`.
fn is_any_network_matched(requested: Option<Network>, networks: &HashSet<Network>) -> bool {
    match requested {
        None => !networks.is_empty(),
        Some(network) => networks.contains(&network),
    }
}

/// State tracked per connected client.
pub(crate) struct ClientInfo {
    callback: Sender<ClientEvent>,
    pub(crate) uid: u32,
    /// Client hint to prefer the modern backend for every request.
    pub(crate) use_modern_backend: bool,
    /// Set when the client issues the legacy daemon-startup message.
    pub(crate) is_pre_s_client: bool,
    /// Outstanding requests, keyed by the caller-chosen client request id.
    pub(crate) client_requests: HashMap<i32, ClientRequest>,
    /// Remembers a resolved service until the address lookup completes.
    pub(crate) resolved_service: Option<NsdServiceInfo>,
    pub(crate) logs: SharedLog,
    metrics: Arc<dyn MetricsSink>,
}

impl ClientInfo {
    pub(crate) fn new(
        callback: Sender<ClientEvent>,
        uid: u32,
        use_modern_backend: bool,
        logs: SharedLog,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        logs.log(format!("New client. useModernBackend={}", use_modern_backend));
        Self {
            callback,
            uid,
            use_modern_backend,
            is_pre_s_client: false,
            client_requests: HashMap::new(),
            resolved_service: None,
            logs,
            metrics,
        }
    }

    /// Reverse lookup: the client request id holding `transaction_id`.
    pub(crate) fn client_request_id_for_transaction(&self, transaction_id: i32) -> Option<i32> {
        self.client_requests
            .iter()
            .find(|(_, request)| request.transaction_id() == transaction_id)
            .map(|(client_request_id, _)| *client_request_id)
    }

    /// True if this client has any modern-backend request matching one of
    /// the given networks.
    pub(crate) fn has_any_modern_request_for_networks(
        &self,
        networks: &HashSet<Network>,
    ) -> bool {
        self.client_requests.values().any(|request| {
            request
                .modern_requested_network()
                .is_some_and(|requested| is_any_network_matched(requested, networks))
        })
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    fn send(&self, event: ClientEvent) {
        if let Err(e) = self.callback.send(event) {
            debug!("client callback channel closed: {}", e);
        }
    }

    pub(crate) fn on_discover_services_started(
        &self,
        listener_key: i32,
        info: NsdServiceInfo,
        transaction_id: i32,
    ) {
        self.metrics.report_service_discovery_started(transaction_id);
        self.send(ClientEvent::DiscoverServicesStarted { listener_key, info });
    }

    pub(crate) fn on_discover_services_failed_immediately(
        &self,
        listener_key: i32,
        error: NsdError,
    ) {
        self.on_discover_services_failed(listener_key, error, NO_TRANSACTION, 0);
    }

    pub(crate) fn on_discover_services_failed(
        &self,
        listener_key: i32,
        error: NsdError,
        transaction_id: i32,
        duration_ms: u64,
    ) {
        self.metrics
            .report_service_discovery_failed(transaction_id, duration_ms);
        self.send(ClientEvent::DiscoverServicesFailed {
            listener_key,
            error,
        });
    }

    pub(crate) fn on_service_found(&mut self, listener_key: i32, info: NsdServiceInfo) {
        if let Some(request) = self.client_requests.get_mut(&listener_key) {
            request.header_mut().on_service_found(&info.service_name);
        }
        self.send(ClientEvent::ServiceFound { listener_key, info });
    }

    pub(crate) fn on_service_lost(&mut self, listener_key: i32, info: NsdServiceInfo) {
        if let Some(request) = self.client_requests.get_mut(&listener_key) {
            request.header_mut().on_service_lost();
        }
        self.send(ClientEvent::ServiceLost { listener_key, info });
    }

    pub(crate) fn on_stop_discovery_succeeded(
        &self,
        listener_key: i32,
        request: &ClientRequest,
        now_ms: u64,
    ) {
        let header = request.header();
        self.metrics.report_service_discovery_stop(
            header.transaction_id,
            header.request_duration_ms(now_ms),
            header.found_service_count(),
            header.lost_service_count(),
            header.services_count(),
            header.sent_query_count(),
        );
        self.send(ClientEvent::StopDiscoverySucceeded { listener_key });
    }

    pub(crate) fn on_stop_discovery_failed(&self, listener_key: i32, error: NsdError) {
        self.send(ClientEvent::StopDiscoveryFailed {
            listener_key,
            error,
        });
    }

    pub(crate) fn on_register_service_succeeded(
        &self,
        listener_key: i32,
        info: NsdServiceInfo,
        transaction_id: i32,
        duration_ms: u64,
    ) {
        self.metrics
            .report_service_registration_succeeded(transaction_id, duration_ms);
        self.send(ClientEvent::RegisterServiceSucceeded { listener_key, info });
    }

    pub(crate) fn on_register_service_failed_immediately(
        &self,
        listener_key: i32,
        error: NsdError,
    ) {
        self.on_register_service_failed(listener_key, error, NO_TRANSACTION, 0);
    }

    pub(crate) fn on_register_service_failed(
        &self,
        listener_key: i32,
        error: NsdError,
        transaction_id: i32,
        duration_ms: u64,
    ) {
        self.metrics
            .report_service_registration_failed(transaction_id, duration_ms);
        self.send(ClientEvent::RegisterServiceFailed {
            listener_key,
            error,
        });
    }

    pub(crate) fn on_unregister_service_succeeded(
        &self,
        listener_key: i32,
        transaction_id: i32,
        duration_ms: u64,
        metrics: &AdvertiserMetrics,
    ) {
        self.metrics
            .report_service_unregistration(transaction_id, duration_ms, metrics);
        self.send(ClientEvent::UnregisterServiceSucceeded { listener_key });
    }

    pub(crate) fn on_unregister_service_failed(&self, listener_key: i32, error: NsdError) {
        self.send(ClientEvent::UnregisterServiceFailed {
            listener_key,
            error,
        });
    }

    pub(crate) fn on_resolve_service_succeeded(
        &self,
        listener_key: i32,
        info: NsdServiceInfo,
        request: &ClientRequest,
        now_ms: u64,
    ) {
        let header = request.header();
        self.metrics.report_service_resolved(
            header.transaction_id,
            header.request_duration_ms(now_ms),
            header.is_service_from_cache(),
            header.sent_query_count(),
        );
        self.send(ClientEvent::ResolveServiceSucceeded { listener_key, info });
    }

    pub(crate) fn on_resolve_service_failed_immediately(
        &self,
        listener_key: i32,
        error: NsdError,
    ) {
        self.on_resolve_service_failed(listener_key, error, NO_TRANSACTION, 0);
    }

    pub(crate) fn on_resolve_service_failed(
        &self,
        listener_key: i32,
        error: NsdError,
        transaction_id: i32,
        duration_ms: u64,
    ) {
        self.metrics
            .report_service_resolution_failed(transaction_id, duration_ms);
        self.send(ClientEvent::ResolveServiceFailed {
            listener_key,
            error,
        });
    }

    pub(crate) fn on_stop_resolution_succeeded(
        &self,
        listener_key: i32,
        request: &ClientRequest,
        now_ms: u64,
    ) {
        let header = request.header();
        self.metrics.report_service_resolution_stop(
            header.transaction_id,
            header.request_duration_ms(now_ms),
        );
        self.send(ClientEvent::StopResolutionSucceeded { listener_key });
    }

    pub(crate) fn on_stop_resolution_failed(&self, listener_key: i32, error: NsdError) {
        self.send(ClientEvent::StopResolutionFailed {
            listener_key,
            error,
        });
    }

    pub(crate) fn on_service_info_callback_registered(&self, listener_key: i32, transaction_id: i32) {
        self.metrics
            .report_service_info_callback_registered(transaction_id);
        self.send(ClientEvent::ServiceInfoCallbackRegistered { listener_key });
    }

    pub(crate) fn on_service_info_callback_registration_failed(
        &self,
        listener_key: i32,
        error: NsdError,
    ) {
        self.metrics
            .report_service_info_callback_registration_failed(NO_TRANSACTION);
        self.send(ClientEvent::ServiceInfoCallbackRegistrationFailed {
            listener_key,
            error,
        });
    }

    pub(crate) fn on_service_updated(&mut self, listener_key: i32, info: NsdServiceInfo) {
        if let Some(request) = self.client_requests.get_mut(&listener_key) {
            request.header_mut().on_service_found(&info.service_name);
        }
        self.send(ClientEvent::ServiceUpdated { listener_key, info });
    }

    pub(crate) fn on_service_updated_lost(&mut self, listener_key: i32) {
        if let Some(request) = self.client_requests.get_mut(&listener_key) {
            request.header_mut().on_service_lost();
        }
        self.send(ClientEvent::ServiceUpdatedLost { listener_key });
    }

    pub(crate) fn on_service_info_callback_unregistered(
        &self,
        listener_key: i32,
        request: &ClientRequest,
        now_ms: u64,
    ) {
        let header = request.header();
        self.metrics.report_service_info_callback_unregistered(
            header.transaction_id,
            header.request_duration_ms(now_ms),
            header.found_service_count(),
            header.lost_service_count(),
            header.is_service_from_cache(),
            header.sent_query_count(),
        );
        self.send(ClientEvent::ServiceInfoCallbackUnregistered { listener_key });
    }
}
