//! Delay-tolerant store-and-forward bundle agent (spec §4.7).
//!
//! Grounded on the teacher's `transport/core.rs` `Transport`: a bounded
//! work queue guarded by a mutex+condvar, a single worker thread that wakes
//! on enqueue or the nearest timer, and capability collaborators
//! (routing/naming here, in place of the teacher's identity store) injected
//! at construction rather than reached for globally.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bundle::{self, Bundle, BundleRecord};
use crate::bus::{BusContext, PortListener};
use crate::connection::ConnectionId;
use crate::dmp::Datagram;
use crate::error::BusError;
use crate::routing::{NamingProvider, RoutingProvider};
use crate::time::Clock;

pub const BUNDLE_AGENT_PORT: u16 = 4556;
pub const MAX_BUNDLES: usize = 32;
pub const DEFER_TIME_MS: i64 = 1000;
const DEFAULT_HIGH_WATER_FRACTION: f64 = 0.8;

/// A locally registered destination (spec §3 "EndpointRegistration").
pub trait EndpointListener: Send + Sync {
    fn deliver_bundle(&self, bundle: Bundle);
}

/// Network-time source for bundle creation timestamps and expiry checks,
/// independent of the local monotonic [`Clock`] used for defer timers
/// (spec §4.7: "Pluggable ... network-time provider (default: system
/// clock)").
pub trait NetworkTimeProvider: Send + Sync {
    fn now_network_secs(&self) -> u64;
}

/// Default network-time provider: wraps a [`Clock`]'s wall-clock seconds.
pub struct SystemNetworkTime(pub Arc<dyn Clock>);

impl NetworkTimeProvider for SystemNetworkTime {
    fn now_network_secs(&self) -> u64 {
        self.0.wall_seconds().max(0) as u64
    }
}

enum Outcome {
    Complete,
    KeepDeferred,
}

struct SequenceState {
    prev_timestamp: u64,
    prev_sequence: u64,
}

/// The bundle agent: one instance per bus context, bound to port 4556.
pub struct BundleAgent {
    bus: Arc<BusContext>,
    clock: Arc<dyn Clock>,
    network_time: Arc<dyn NetworkTimeProvider>,
    routing: Arc<dyn RoutingProvider>,
    naming: Arc<dyn NamingProvider>,
    queue: Mutex<VecDeque<BundleRecord>>,
    condvar: Condvar,
    endpoints: Mutex<HashMap<String, Arc<dyn EndpointListener>>>,
    seq_state: Mutex<Option<SequenceState>>,
    high_water_fraction: f64,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BundleAgent {
    pub fn new(
        bus: Arc<BusContext>,
        clock: Arc<dyn Clock>,
        routing: Arc<dyn RoutingProvider>,
        naming: Arc<dyn NamingProvider>,
    ) -> Arc<Self> {
        let network_time: Arc<dyn NetworkTimeProvider> = Arc::new(SystemNetworkTime(clock.clone()));
        Self::with_network_time(bus, clock, network_time, routing, naming)
    }

    pub fn with_network_time(
        bus: Arc<BusContext>,
        clock: Arc<dyn Clock>,
        network_time: Arc<dyn NetworkTimeProvider>,
        routing: Arc<dyn RoutingProvider>,
        naming: Arc<dyn NamingProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            network_time,
            routing,
            naming,
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            endpoints: Mutex::new(HashMap::new()),
            seq_state: Mutex::new(None),
            high_water_fraction: DEFAULT_HIGH_WATER_FRACTION,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Override the local-submission high-water fraction (spec §9: "expose
    /// it as a tunable"). Must be called before [`BundleAgent::start`].
    pub fn with_high_water_fraction(self: Arc<Self>, fraction: f64) -> Arc<Self> {
        // `self` is the sole owner at this point in normal construction
        // sequences (immediately after `new`), so this is a plain field
        // tweak rather than shared mutable state.
        let mut this = match Arc::try_unwrap(self) {
            Ok(this) => this,
            Err(shared) => return shared,
        };
        this.high_water_fraction = fraction;
        Arc::new(this)
    }

    pub fn start(self: &Arc<Self>) -> Result<(), BusError> {
        let listener: Arc<dyn PortListener> = self.clone();
        self.bus.bind(listener, BUNDLE_AGENT_PORT)?;
        self.running.store(true, Ordering::SeqCst);
        let agent = self.clone();
        let handle = std::thread::spawn(move || agent.worker_loop());
        *self.worker.lock().expect("bundle agent worker mutex poisoned") = Some(handle);
        Ok(())
    }

    pub fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        let listener: Arc<dyn PortListener> = self.clone();
        self.bus.unbind(&listener, Some(BUNDLE_AGENT_PORT));
        self.condvar.notify_all();
    }

    pub fn register_endpoint(&self, endpoint: String, listener: Arc<dyn EndpointListener>) -> Result<(), BusError> {
        if endpoint == "dtn:none" {
            return Err(BusError::ReservedEndpoint);
        }
        let mut endpoints = self.endpoints.lock().expect("endpoints mutex poisoned");
        if endpoints.contains_key(&endpoint) {
            return Err(BusError::DuplicateEndpoint);
        }
        endpoints.insert(endpoint, listener);
        Ok(())
    }

    pub fn unregister_endpoint(&self, endpoint: &str) {
        self.endpoints.lock().expect("endpoints mutex poisoned").remove(endpoint);
    }

    /// Number of records currently queued (delivered, forwarded, and
    /// expired records are removed by the worker, so this is "still
    /// pending"). Exposed for observability, the way a caller might poll a
    /// queue depth metric.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue mutex poisoned").len()
    }

    /// Submit a bundle from a local application: assigns creation timestamp
    /// and sequence (spec §4.7 "Local submission additionally assigns...").
    pub fn submit_local(&self, mut bundle: Bundle) -> Result<(), BusError> {
        let now_secs = self.network_time.now_network_secs();
        let mut seq_state = self.seq_state.lock().expect("seq_state mutex poisoned");
        let sequence = match seq_state.as_ref() {
            Some(state) if state.prev_timestamp == now_secs => state.prev_sequence + 1,
            _ => 0,
        };
        *seq_state = Some(SequenceState { prev_timestamp: now_secs, prev_sequence: sequence });
        drop(seq_state);

        bundle.creation_timestamp = now_secs;
        bundle.sequence = sequence;
        self.submit(bundle, true)
    }

    fn submit(&self, bundle: Bundle, from_local: bool) -> Result<(), BusError> {
        let mut queue = self.queue.lock().expect("queue mutex poisoned");
        let len = queue.len();
        if from_local {
            if len as f64 >= self.high_water_fraction * MAX_BUNDLES as f64 {
                return Ok(()); // silently dropped (spec §4.7, §9)
            }
        } else if len >= MAX_BUNDLES {
            return Ok(()); // silently dropped: queue is full
        }
        queue.push_back(BundleRecord::new(bundle));
        drop(queue);
        self.condvar.notify_all();
        Ok(())
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let now_local = self.clock.monotonic_millis();
            let ready_index = {
                let queue = self.queue.lock().expect("queue mutex poisoned");
                queue.iter().position(|r| !r.deferred || r.defer_until_ms <= now_local)
            };

            if let Some(index) = ready_index {
                let mut record = {
                    let mut queue = self.queue.lock().expect("queue mutex poisoned");
                    queue.remove(index).expect("index came from this queue")
                };
                match self.process_record(&mut record, now_local) {
                    Outcome::Complete => {}
                    Outcome::KeepDeferred => {
                        self.queue.lock().expect("queue mutex poisoned").push_back(record);
                    }
                }
                continue;
            }

            let queue = self.queue.lock().expect("queue mutex poisoned");
            if queue.is_empty() {
                let _guard = self.condvar.wait(queue).expect("condvar wait poisoned");
            } else {
                let nearest = queue.iter().map(|r| r.defer_until_ms).min().expect("queue is non-empty");
                let wait_ms = (nearest - now_local).max(0) as u64;
                let _guard =
                    self.condvar.wait_timeout(queue, Duration::from_millis(wait_ms)).expect("condvar wait poisoned");
            }
        }
    }

    fn process_record(&self, record: &mut BundleRecord, now_local: i64) -> Outcome {
        if record.deferred {
            record.clear_defer();
        }

        let now_network_secs = self.network_time.now_network_secs();
        if record.bundle.is_expired(now_network_secs) {
            return Outcome::Complete;
        }

        {
            let endpoints = self.endpoints.lock().expect("endpoints mutex poisoned");
            if let Some(listener) = endpoints.get(&record.bundle.destination) {
                listener.deliver_bundle(record.bundle.clone());
                return Outcome::Complete;
            }
        }

        let Some(destination_address) = self.naming.resolve(&record.bundle.destination) else {
            return Outcome::Complete; // unresolvable, no retry (spec §4.7 step 5)
        };

        let Some(connection_id) = self.routing.next_hop(destination_address) else {
            record.defer(now_local + DEFER_TIME_MS);
            return Outcome::KeepDeferred;
        };

        let Some(connection) = self.bus.connection(connection_id) else {
            record.defer(now_local + DEFER_TIME_MS);
            return Outcome::KeepDeferred;
        };

        let wire = bundle::serialize(&record.bundle);
        match Datagram::new(BUNDLE_AGENT_PORT, wire) {
            Ok(datagram) => match self.bus.send(Some(&connection), datagram) {
                Ok(()) => Outcome::Complete,
                Err(err) => {
                    log::info!("bundle_agent: send failed, deferring: {err}");
                    record.defer(now_local + DEFER_TIME_MS);
                    Outcome::KeepDeferred
                }
            },
            Err(_) => {
                // Serialized bundle exceeds a single DMP frame's payload;
                // not recoverable by retrying.
                Outcome::Complete
            }
        }
    }
}

impl PortListener for BundleAgent {
    fn receive(&self, _from: Option<ConnectionId>, datagram: Datagram) {
        match bundle::deserialize(datagram.payload()) {
            Ok(bundle) => {
                if let Err(err) = self.submit(bundle, false) {
                    log::warn!("bundle_agent: inbound submission rejected: {err}");
                }
            }
            Err(err) => log::warn!("bundle_agent: dropping malformed bundle: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::InterfaceAddress;
    use crate::connection::test_support::PipeStream;
    use crate::connection::Connection;
    use crate::routing::NoRouting;
    use crate::time::SystemClock;
    use std::sync::Mutex as StdMutex;

    struct RecordingListener {
        delivered: StdMutex<Vec<Bundle>>,
    }

    impl EndpointListener for RecordingListener {
        fn deliver_bundle(&self, bundle: Bundle) {
            self.delivered.lock().unwrap().push(bundle);
        }
    }

    struct FixedRoute(ConnectionId);

    impl RoutingProvider for FixedRoute {
        fn next_hop(&self, _destination: InterfaceAddress) -> Option<ConnectionId> {
            Some(self.0)
        }
    }

    struct AlwaysLiteral;
    impl NamingProvider for AlwaysLiteral {
        fn resolve(&self, endpoint: &str) -> Option<InterfaceAddress> {
            crate::routing::resolve_literal_host(endpoint)
        }
    }

    fn sample_bundle(destination: &str) -> Bundle {
        Bundle {
            flags: 0,
            creation_timestamp: 0,
            sequence: 0,
            lifetime: 3600,
            source: "dtn://[fd00:0:0:0:0:0:0:1]/app".to_string(),
            destination: destination.to_string(),
            report_to: "dtn:none".to_string(),
            custodian: "dtn:none".to_string(),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn rejects_dtn_none_registration() {
        let bus = BusContext::new();
        let agent =
            BundleAgent::new(bus, Arc::new(SystemClock::new()), Arc::new(NoRouting), Arc::new(AlwaysLiteral));
        let listener = Arc::new(RecordingListener { delivered: StdMutex::new(Vec::new()) });
        let err = agent.register_endpoint("dtn:none".to_string(), listener).unwrap_err();
        assert!(matches!(err, BusError::ReservedEndpoint));
    }

    #[test]
    fn rejects_duplicate_registration() {
        let bus = BusContext::new();
        let agent =
            BundleAgent::new(bus, Arc::new(SystemClock::new()), Arc::new(NoRouting), Arc::new(AlwaysLiteral));
        let listener = Arc::new(RecordingListener { delivered: StdMutex::new(Vec::new()) });
        agent.register_endpoint("dtn://local/echo".to_string(), listener.clone()).unwrap();
        let err = agent.register_endpoint("dtn://local/echo".to_string(), listener).unwrap_err();
        assert!(matches!(err, BusError::DuplicateEndpoint));
    }

    #[test]
    fn local_submission_assigns_monotonic_sequence_within_a_timestamp() {
        let bus = BusContext::new();
        let agent =
            BundleAgent::new(bus, Arc::new(SystemClock::new()), Arc::new(NoRouting), Arc::new(AlwaysLiteral));
        agent.submit_local(sample_bundle("dtn:none")).unwrap();
        agent.submit_local(sample_bundle("dtn:none")).unwrap();
        let queue = agent.queue.lock().unwrap();
        assert_eq!(queue[0].bundle.sequence, 0);
        assert_eq!(queue[1].bundle.sequence, 1);
        assert_eq!(queue[0].bundle.creation_timestamp, queue[1].bundle.creation_timestamp);
    }

    #[test]
    fn local_submission_drops_silently_past_high_water_mark() {
        let bus = BusContext::new();
        let agent =
            BundleAgent::new(bus, Arc::new(SystemClock::new()), Arc::new(NoRouting), Arc::new(AlwaysLiteral));
        let threshold = (DEFAULT_HIGH_WATER_FRACTION * MAX_BUNDLES as f64).ceil() as usize;
        for _ in 0..threshold {
            agent.submit_local(sample_bundle("dtn:none")).unwrap();
        }
        let len_before = agent.queue.lock().unwrap().len();
        agent.submit_local(sample_bundle("dtn:none")).unwrap();
        let len_after = agent.queue.lock().unwrap().len();
        assert_eq!(len_before, len_after);
    }

    #[test]
    fn delivers_locally_registered_destination_without_forwarding() {
        let bus = BusContext::new();
        let agent =
            BundleAgent::new(bus, Arc::new(SystemClock::new()), Arc::new(NoRouting), Arc::new(AlwaysLiteral));
        let listener = Arc::new(RecordingListener { delivered: StdMutex::new(Vec::new()) });
        agent.register_endpoint("dtn://local/echo".to_string(), listener.clone()).unwrap();

        let mut record = BundleRecord::new(sample_bundle("dtn://local/echo"));
        let outcome = agent.process_record(&mut record, 0);
        assert!(matches!(outcome, Outcome::Complete));
        assert_eq!(listener.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn defers_when_no_route_then_forwards_once_one_appears() {
        let bus = BusContext::new();
        let ((reader_a, writer_a), (reader_b, writer_b)) = PipeStream::pair();
        let conn_a = Arc::new(Connection::new(InterfaceAddress::new_zero(), reader_a, writer_a));
        let conn_b = Arc::new(Connection::new(InterfaceAddress::new_zero(), reader_b, writer_b));
        bus.add_connection(conn_a.clone());
        bus.add_connection(conn_b);

        let agent =
            BundleAgent::new(bus, Arc::new(SystemClock::new()), Arc::new(NoRouting), Arc::new(AlwaysLiteral));
        let mut record = BundleRecord::new(sample_bundle("dtn://[fd00:0:0:0:0:0:0:9]/echo"));
        let outcome = agent.process_record(&mut record, 0);
        assert!(matches!(outcome, Outcome::KeepDeferred));
        assert!(record.deferred);

        let agent_with_route = BundleAgent::new(
            agent.bus.clone(),
            Arc::new(SystemClock::new()),
            Arc::new(FixedRoute(conn_a.id())),
            Arc::new(AlwaysLiteral),
        );
        let outcome = agent_with_route.process_record(&mut record, 2000);
        assert!(matches!(outcome, Outcome::Complete));
    }

    #[test]
    fn expired_bundle_is_dropped() {
        struct FixedNetworkTime(u64);
        impl NetworkTimeProvider for FixedNetworkTime {
            fn now_network_secs(&self) -> u64 {
                self.0
            }
        }

        let bus = BusContext::new();
        let agent = BundleAgent::with_network_time(
            bus,
            Arc::new(SystemClock::new()),
            Arc::new(FixedNetworkTime(10_000)),
            Arc::new(NoRouting),
            Arc::new(AlwaysLiteral),
        );
        let mut bundle = sample_bundle("dtn://[fd00:0:0:0:0:0:0:9]/echo");
        bundle.creation_timestamp = 0;
        bundle.lifetime = 100;
        let mut record = BundleRecord::new(bundle);
        let outcome = agent.process_record(&mut record, 0);
        assert!(matches!(outcome, Outcome::Complete));
    }

    #[test]
    fn unresolvable_destination_without_brackets_is_dropped_not_deferred() {
        let bus = BusContext::new();
        let agent =
            BundleAgent::new(bus, Arc::new(SystemClock::new()), Arc::new(NoRouting), Arc::new(AlwaysLiteral));
        let mut record = BundleRecord::new(sample_bundle("dtn://somehost/echo"));
        let outcome = agent.process_record(&mut record, 0);
        assert!(matches!(outcome, Outcome::Complete));
    }
}
