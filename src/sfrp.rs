//! Simplified Flood Routing Protocol: a periodic-HELLO-flood next-hop
//! routing daemon (spec §4.5).
//!
//! Grounded on the teacher's `transport/discovery.rs` `DiscoveryCache` for
//! the device-table/validity-sweep shape, and its `iface/tcp_client.rs` for
//! the periodic-retry worker-thread loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::address::InterfaceAddress;
use crate::bus::{BusContext, PortListener};
use crate::connection::ConnectionId;
use crate::dmp::Datagram;
use crate::time::Clock;

pub const SFRP_PORT: u16 = 50054;
const HELLO_TIME_MS: i64 = 1000;
const HELLO_PAYLOAD_LEN: usize = 24;

/// Route-table change notifications (spec §4.5: "Notify `ROUTE_ADDED` when
/// `newRoute`" / "`ROUTE_REMOVED`"). `changedRoute` (shorter-path-replaced-
/// incumbent) is tracked internally but intentionally never reported here —
/// see spec §9 open questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChange {
    Added(InterfaceAddress),
    Removed(InterfaceAddress),
}

pub trait RouteListener: Send + Sync {
    fn on_route_change(&self, change: RouteChange);
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    seq: u16,
    hops: u16,
    validity_ms: u16,
    last_update_ms: i64,
    next_hop: ConnectionId,
    valid: bool,
}

/// True if `seq` is strictly newer than `recorded` under 16-bit wrap-around
/// (spec §4.5, §9: `seq < record.seq − 32768` is the wrap case). Equivalent
/// serial-number-arithmetic form of the same two clauses.
fn seq_is_newer(seq: u16, recorded: u16) -> bool {
    let diff = seq as i32 - recorded as i32;
    let wrapped = if diff > 32768 {
        diff - 65536
    } else if diff < -32768 {
        diff + 65536
    } else {
        diff
    };
    wrapped > 0
}

fn encode_hello(seq: u16, hops: u16, validity_ms: u16, originator: InterfaceAddress) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HELLO_PAYLOAD_LEN);
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&hops.to_be_bytes());
    payload.extend_from_slice(&validity_ms.to_be_bytes());
    payload.extend_from_slice(&[0u8, 0u8]); // reserved
    payload.extend_from_slice(originator.as_slice());
    payload
}

struct DecodedHello {
    seq: u16,
    hops: u16,
    validity_ms: u16,
    originator: InterfaceAddress,
}

fn decode_hello(payload: &[u8]) -> Option<DecodedHello> {
    if payload.len() != HELLO_PAYLOAD_LEN {
        return None;
    }
    let seq = u16::from_be_bytes([payload[0], payload[1]]);
    let hops = u16::from_be_bytes([payload[2], payload[3]]);
    let validity_ms = u16::from_be_bytes([payload[4], payload[5]]);
    let mut originator_bytes = [0u8; 16];
    originator_bytes.copy_from_slice(&payload[8..24]);
    Some(DecodedHello { seq, hops, validity_ms, originator: InterfaceAddress::new(originator_bytes) })
}

struct Shared {
    devices: HashMap<InterfaceAddress, DeviceRecord>,
    route_listeners: Vec<Arc<dyn RouteListener>>,
}

/// The SFRP daemon: one instance per bus context, bound to port 50054.
pub struct Sfrp {
    bus: Arc<BusContext>,
    clock: Arc<dyn Clock>,
    shared: Mutex<Shared>,
    seq: AtomicU16,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sfrp {
    pub fn new(bus: Arc<BusContext>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            shared: Mutex::new(Shared { devices: HashMap::new(), route_listeners: Vec::new() }),
            seq: AtomicU16::new(0),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Bind to the bus and start the periodic HELLO loop.
    pub fn start(self: &Arc<Self>) -> Result<(), crate::error::BusError> {
        let listener: Arc<dyn PortListener> = self.clone();
        self.bus.bind(listener, SFRP_PORT)?;
        self.running.store(true, Ordering::SeqCst);
        let daemon = self.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                daemon.tick();
                std::thread::sleep(Duration::from_millis(HELLO_TIME_MS as u64));
            }
        });
        *self.worker.lock().expect("sfrp worker mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the HELLO loop and unbind from the bus. The worker thread is
    /// joined on drop of the returned handle only if the caller retains it;
    /// `stop` itself just signals and unbinds (spec §5 "Cancellation").
    pub fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        let listener: Arc<dyn PortListener> = self.clone();
        self.bus.unbind(&listener, Some(SFRP_PORT));
    }

    pub fn add_route_listener(&self, listener: Arc<dyn RouteListener>) {
        self.shared.lock().expect("sfrp mutex poisoned").route_listeners.push(listener);
    }

    /// The next-hop connection for `destination`, or `None` if no valid
    /// route is known (spec §4.5 "Next-hop query").
    pub fn next_hop(&self, destination: InterfaceAddress) -> Option<ConnectionId> {
        let shared = self.shared.lock().expect("sfrp mutex poisoned");
        shared.devices.get(&destination).filter(|r| r.valid).map(|r| r.next_hop)
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn tick(&self) {
        if let Some(main_address) = self.bus.main_address() {
            let seq = self.next_seq();
            let payload = encode_hello(seq, 1, (2 * HELLO_TIME_MS) as u16, main_address);
            if let Ok(datagram) = Datagram::new(SFRP_PORT, payload) {
                for connection in self.bus.connections() {
                    if let Err(err) = self.bus.send(Some(&connection), datagram.clone()) {
                        log::warn!("sfrp: hello send to {:?} failed: {err}", connection.id());
                    }
                }
            }
        }
        self.sweep_expired();
    }

    fn sweep_expired(&self) {
        let now = self.clock.monotonic_millis();
        let mut expired = Vec::new();
        {
            let mut shared = self.shared.lock().expect("sfrp mutex poisoned");
            for (address, record) in shared.devices.iter_mut() {
                if record.valid && now - record.last_update_ms > record.validity_ms as i64 {
                    record.valid = false;
                    expired.push(*address);
                }
            }
        }
        let listeners = self.shared.lock().expect("sfrp mutex poisoned").route_listeners.clone();
        for address in expired {
            for listener in &listeners {
                listener.on_route_change(RouteChange::Removed(address));
            }
        }
    }
}

impl PortListener for Sfrp {
    fn receive(&self, from: Option<ConnectionId>, datagram: Datagram) {
        let Some(from) = from else {
            return;
        };
        let Some(hello) = decode_hello(datagram.payload()) else {
            log::warn!("sfrp: dropping wrong-length hello ({} octets)", datagram.payload().len());
            return;
        };

        if Some(hello.originator) == self.bus.main_address() {
            return;
        }

        let now = self.clock.monotonic_millis();
        let mut new_route = false;
        let mut should_relay = false;
        let mut forward_hops = hello.hops;

        {
            let mut shared = self.shared.lock().expect("sfrp mutex poisoned");
            match shared.devices.get(&hello.originator) {
                None => {
                    new_route = true;
                    should_relay = true;
                }
                Some(record) => {
                    if seq_is_newer(hello.seq, record.seq) {
                        should_relay = true;
                        if !record.valid {
                            new_route = true;
                        }
                    } else if hello.seq == record.seq && hello.hops < record.hops {
                        should_relay = true;
                        if !record.valid {
                            new_route = true;
                        }
                    }
                }
            }

            if should_relay {
                shared.devices.insert(
                    hello.originator,
                    DeviceRecord {
                        seq: hello.seq,
                        hops: hello.hops,
                        validity_ms: hello.validity_ms,
                        last_update_ms: now,
                        next_hop: from,
                        valid: true,
                    },
                );
                forward_hops = hello.hops.wrapping_add(1);
            }
        }

        if !should_relay {
            return;
        }

        let forward_payload = encode_hello(hello.seq, forward_hops, hello.validity_ms, hello.originator);
        if let Ok(forward) = Datagram::new(SFRP_PORT, forward_payload) {
            for connection in self.bus.connections() {
                if connection.id() == from {
                    continue;
                }
                if let Err(err) = self.bus.send(Some(&connection), forward.clone()) {
                    log::warn!("sfrp: forward to {:?} failed: {err}", connection.id());
                }
            }
        }

        if new_route {
            let listeners = self.shared.lock().expect("sfrp mutex poisoned").route_listeners.clone();
            for listener in listeners {
                listener.on_route_change(RouteChange::Added(hello.originator));
            }
        }
    }
}
