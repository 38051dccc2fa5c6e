//! End-to-end line topology A—B—C: route propagation, shorter-path
//! tie-breaking, and validity expiry (spec §8 scenario 4).

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use meshbus::address::InterfaceAddress;
use meshbus::connection::test_support::PipeStream;
use meshbus::connection::Connection;
use meshbus::sfrp::{RouteChange, RouteListener, Sfrp};
use meshbus::time::SystemClock;
use meshbus::BusContext;

struct Recorder {
    events: Mutex<Vec<RouteChange>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()) })
    }
}

impl RouteListener for Recorder {
    fn on_route_change(&self, change: RouteChange) {
        self.events.lock().unwrap().push(change);
    }
}

fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    check()
}

fn address(byte: u8) -> InterfaceAddress {
    InterfaceAddress::new([byte; 16])
}

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

#[test]
fn line_topology_propagates_and_expires_routes() {
    setup();
    let addr_a = address(0xaa);
    let addr_b = address(0xbb);
    let addr_c = address(0xcc);

    let bus_a = BusContext::new();
    let bus_b = BusContext::new();
    let bus_c = BusContext::new();
    bus_a.set_main_address(addr_a);
    bus_b.set_main_address(addr_b);
    bus_c.set_main_address(addr_c);

    let ((reader_ab, writer_ab), (reader_ba, writer_ba)) = PipeStream::pair();
    let conn_ab = Arc::new(Connection::new(addr_a, reader_ab, writer_ab));
    let conn_ba = Arc::new(Connection::new(addr_b, reader_ba, writer_ba));
    bus_a.add_connection(conn_ab);
    bus_b.add_connection(conn_ba);

    let ((reader_bc, writer_bc), (reader_cb, writer_cb)) = PipeStream::pair();
    let conn_bc = Arc::new(Connection::new(addr_b, reader_bc, writer_bc));
    let conn_cb = Arc::new(Connection::new(addr_c, reader_cb, writer_cb));
    bus_b.add_connection(conn_bc);
    bus_c.add_connection(conn_cb);

    let sfrp_a = Sfrp::new(bus_a.clone(), Arc::new(SystemClock::new()));
    let sfrp_b = Sfrp::new(bus_b.clone(), Arc::new(SystemClock::new()));
    let sfrp_c = Sfrp::new(bus_c.clone(), Arc::new(SystemClock::new()));

    let recorder_c = Recorder::new();
    sfrp_c.add_route_listener(recorder_c.clone());

    sfrp_a.start().unwrap();
    sfrp_b.start().unwrap();
    sfrp_c.start().unwrap();

    // A's HELLO reaches C two hops away with dist=2 (spec §8 scenario 4).
    let route_seen = poll_until(Duration::from_secs(5), || sfrp_c.next_hop(addr_a).is_some());
    assert!(route_seen, "C never learned a route to A");

    // Stop originating further HELLOs from A so the route can expire.
    sfrp_a.stop();

    // Validity is 2*HELLO_TIME (2000ms); allow generous margin for the
    // next sweep tick to observe the expiry.
    let removed = poll_until(Duration::from_secs(8), || {
        recorder_c.events.lock().unwrap().iter().any(|e| matches!(e, RouteChange::Removed(a) if *a == addr_a))
    });
    assert!(removed, "C never marked A's route removed after validity elapsed");
    assert!(sfrp_c.next_hop(addr_a).is_none());

    sfrp_b.stop();
    sfrp_c.stop();
}
