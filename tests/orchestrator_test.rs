//! Black-box tests driving the orchestrator through its public handle, with
//! fake backends standing in for the daemon and the engine.

use nsd_orchestrator::backend::{
    AdvertiserMetrics, DiscoveryEngine, LegacyDaemon, MDnsEvent, MdnsSearchOptions,
    MdnsServiceInfo, MulticastLock, OffloadServiceInfo, ServiceAdvertiser, SocketProvider,
};
use nsd_orchestrator::{
    ClientEvent, DaemonEventSender, DaemonStatus, MdnsListener, Network, NsdDependencies,
    NsdService, NsdServiceInfo,
};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
struct FakeLegacy {
    inner: Arc<FakeLegacyState>,
}

#[derive(Default)]
struct FakeLegacyState {
    calls: Mutex<Vec<String>>,
    events: Mutex<Option<DaemonEventSender>>,
}

impl FakeLegacy {
    fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.inner.calls.lock().unwrap().push(call);
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
        self.record("start_daemon".to_string());
    }

    fn stop_daemon(&self) {
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
        _service_type: &str,
        _port: u16,
        _txt_record: &[u8],
        _interface_idx: u32,
    ) -> bool {
        self.record(format!("register {} {}", transaction_id, service_name));
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
        _service_type: &str,
        _domain: &str,
        _interface_idx: u32,
    ) -> bool {
        self.record(format!("resolve {} {}", transaction_id, service_name));
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

    fn last_listener(&self) -> Arc<MdnsListener> {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .last()
            .map(|(_, listener)| listener.clone())
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
struct FakeAdvertiser;

impl ServiceAdvertiser for FakeAdvertiser {
    fn add_service(&self, _transaction_id: i32, _service: NsdServiceInfo, _subtype: Option<&str>) {}

    fn remove_service(&self, _transaction_id: i32) {}

    fn get_advertiser_metrics(&self, _transaction_id: i32) -> AdvertiserMetrics {
        AdvertiserMetrics::default()
    }

    fn all_offload_services_for_interface(&self, _interface_name: &str) -> Vec<OffloadServiceInfo> {
        Vec::new()
    }
}

struct FakeSockets;

impl SocketProvider for FakeSockets {
    fn start_monitoring_sockets(&self) {}
    fn request_stop_when_inactive(&self) {}
}

struct FakeMulticastLock;

impl MulticastLock for FakeMulticastLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

fn new_service(legacy: &FakeLegacy, engine: &FakeEngine) -> NsdService {
    let deps = NsdDependencies::new(
        Box::new(legacy.clone()),
        Box::new(engine.clone()),
        Box::new(FakeAdvertiser),
        Box::new(FakeSockets),
        Box::new(FakeMulticastLock),
    );
    NsdService::new(deps).expect("failed to create service")
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5));
    }
    panic!("condition not met within timeout");
}

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn test_discover_and_stop_end_to_end() {
    let legacy = FakeLegacy::default();
    let engine = FakeEngine::default();
    let service = new_service(&legacy, &engine);

    let (connector, events) = service.connect(1000, false).unwrap();
    connector
        .discover_services(7, NsdServiceInfo::new("", "_ipp._tcp"))
        .unwrap();
    assert!(matches!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        ClientEvent::DiscoverServicesStarted { listener_key: 7, .. }
    ));

    // The daemon reports two instances, one of which goes away.
    let daemon = legacy.events();
    for (event_name, net_id) in [("printer1", 42), ("printer2", 42)] {
        daemon.send(MDnsEvent::ServiceFound {
            transaction_id: 1,
            service_name: event_name.to_string(),
            registration_type: "_ipp._tcp.".to_string(),
            net_id,
            interface_idx: 3,
        });
    }
    daemon.send(MDnsEvent::ServiceLost {
        transaction_id: 1,
        service_name: "printer1".to_string(),
        registration_type: "_ipp._tcp.".to_string(),
        net_id: 42,
        interface_idx: 3,
    });

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ClientEvent::ServiceFound { info, .. } => {
            assert_eq!(info.service_name, "printer1");
            assert_eq!(info.network, Some(Network(42)));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        ClientEvent::ServiceFound { .. }
    ));
    assert!(matches!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        ClientEvent::ServiceLost { .. }
    ));

    connector.stop_discovery(7).unwrap();
    assert!(matches!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        ClientEvent::StopDiscoverySucceeded { listener_key: 7 }
    ));
    assert!(legacy.calls().contains(&"stop 1".to_string()));

    drop(connector);
    service.shutdown().unwrap();
}

#[test]
fn test_modern_resolve_end_to_end() {
    let legacy = FakeLegacy::default();
    let engine = FakeEngine::default();
    let service = new_service(&legacy, &engine);

    let (connector, events) = service.connect(1000, true).unwrap();
    connector
        .resolve_service(4, NsdServiceInfo::new("printer1", "_ipp._tcp"))
        .unwrap();
    wait_until(|| engine.listener_count() == 1);

    engine.last_listener().on_service_found(
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

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ClientEvent::ResolveServiceSucceeded { listener_key, info } => {
            assert_eq!(listener_key, 4);
            assert_eq!(info.port, 631);
            assert_eq!(info.service_type, "._ipp._tcp");
        }
        other => panic!("unexpected event {:?}", other),
    }
    // The resolution listener is one-shot.
    wait_until(|| engine.listener_count() == 0);

    drop(connector);
    service.shutdown().unwrap();
}

#[test]
fn test_connector_drop_cancels_requests() {
    let legacy = FakeLegacy::default();
    let engine = FakeEngine::default();
    let service = new_service(&legacy, &engine);

    let (connector, events) = service.connect(1000, false).unwrap();
    connector
        .discover_services(1, NsdServiceInfo::new("", "_ipp._tcp"))
        .unwrap();
    assert!(matches!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        ClientEvent::DiscoverServicesStarted { .. }
    ));

    drop(connector);
    wait_until(|| legacy.calls().contains(&"stop 1".to_string()));

    service.shutdown().unwrap();
}

#[test]
fn test_shutdown_reports_status() {
    let legacy = FakeLegacy::default();
    let engine = FakeEngine::default();
    let service = new_service(&legacy, &engine);

    let status = service
        .shutdown()
        .unwrap()
        .recv_timeout(RECV_TIMEOUT)
        .unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);
}
