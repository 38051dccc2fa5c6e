//! Peer-averaging clock synchronization daemon (spec §4.6).
//!
//! Grounded on the teacher's `transport/discovery.rs` worker-loop shape
//! (periodic send, shared mutable state behind a lock, jittered sleep) —
//! the same pattern as [`crate::sfrp::Sfrp`], applied to round-trip
//! estimation instead of route discovery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand_core::{OsRng, RngCore};

use crate::bus::{BusContext, PortListener};
use crate::connection::ConnectionId;
use crate::dmp::Datagram;
use crate::time::Clock;

pub const CLOCKSYNC_PORT: u16 = 50123;
const PAYLOAD_LEN: usize = 24;
const RING_CAPACITY: usize = 10;
/// Base period between sync rounds; the source does not pin a literal
/// value, only the `·(1 + U[0,0.5])` jitter factor (spec §4.6).
const UPDATE_PERIOD_MS: u64 = 2000;

fn encode_payload(seq: u32, remote_time_ms: i64, reply_seq: u32, hold_ms: i64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAYLOAD_LEN);
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&remote_time_ms.to_be_bytes());
    payload.extend_from_slice(&reply_seq.to_be_bytes());
    payload.extend_from_slice(&hold_ms.to_be_bytes());
    payload
}

struct DecodedPayload {
    seq: u32,
    remote_time_ms: i64,
    reply_seq: u32,
    hold_ms: i64,
}

fn decode_payload(payload: &[u8]) -> Option<DecodedPayload> {
    if payload.len() != PAYLOAD_LEN {
        return None;
    }
    let seq = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let remote_time_ms = i64::from_be_bytes(payload[4..12].try_into().unwrap());
    let reply_seq = u32::from_be_bytes(payload[12..16].try_into().unwrap());
    let hold_ms = i64::from_be_bytes(payload[16..24].try_into().unwrap());
    Some(DecodedPayload { seq, remote_time_ms, reply_seq, hold_ms })
}

#[derive(Debug, Clone, Copy, Default)]
struct ReceiveRecord {
    last_inbound_seq: u32,
    last_inbound_remote_time_ms: i64,
    local_receipt_time_ms: i64,
    round_trip_ms: i64,
    round_trip_valid: bool,
    used: bool,
}

/// A fixed-capacity FIFO of the last `RING_CAPACITY` (seq, send-time) pairs,
/// shared across all connections per spec §4.6 / §9 ("bounded ring
/// buffers"); a send to any connection can evict an older entry belonging
/// to any other.
struct SendRing {
    entries: VecDeque<(u32, i64)>,
}

impl SendRing {
    fn new() -> Self {
        Self { entries: VecDeque::with_capacity(RING_CAPACITY) }
    }

    fn push(&mut self, seq: u32, now_ms: i64) {
        if self.entries.len() == RING_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((seq, now_ms));
    }

    fn lookup(&self, seq: u32) -> Option<i64> {
        self.entries.iter().find(|(s, _)| *s == seq).map(|(_, t)| *t)
    }
}

struct Shared {
    ring: SendRing,
    records: HashMap<ConnectionId, ReceiveRecord>,
}

/// The clock-sync daemon: one instance per bus context, bound to port
/// 50123.
pub struct ClockSync {
    bus: Arc<BusContext>,
    clock: Arc<dyn Clock>,
    offset_ms: AtomicI64,
    seq: AtomicU32,
    shared: Mutex<Shared>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClockSync {
    pub fn new(bus: Arc<BusContext>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            offset_ms: AtomicI64::new(0),
            seq: AtomicU32::new(0),
            shared: Mutex::new(Shared { ring: SendRing::new(), records: HashMap::new() }),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) -> Result<(), crate::error::BusError> {
        let listener: Arc<dyn PortListener> = self.clone();
        self.bus.bind(listener, CLOCKSYNC_PORT)?;
        self.running.store(true, Ordering::SeqCst);
        let daemon = self.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                daemon.tick();
                let jitter = 1.0 + (OsRng.next_u32() as f64 / u32::MAX as f64) * 0.5;
                std::thread::sleep(Duration::from_millis((UPDATE_PERIOD_MS as f64 * jitter) as u64));
            }
        });
        *self.worker.lock().expect("clocksync worker mutex poisoned") = Some(handle);
        Ok(())
    }

    pub fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        let listener: Arc<dyn PortListener> = self.clone();
        self.bus.unbind(&listener, Some(CLOCKSYNC_PORT));
    }

    /// `currentTimeMillis() = internalClock() + offset` (spec §4.6).
    pub fn now_ms(&self) -> i64 {
        self.clock.monotonic_millis() + self.offset()
    }

    /// The current offset. A clean parameterless accessor — see
    /// SPEC_FULL.md §0.1 on the source's `getOffset(long)` accessor bug,
    /// which this reimplementation does not carry over.
    pub fn offset(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    fn next_seq(&self) -> u32 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn tick(&self) {
        let connections = self.bus.connections();
        let now_local = self.clock.monotonic_millis();

        for connection in &connections {
            let seq = self.next_seq();
            let (reply_seq, hold_ms) = {
                let shared = self.shared.lock().expect("clocksync mutex poisoned");
                match shared.records.get(&connection.id()) {
                    Some(record) => (record.last_inbound_seq, now_local - record.local_receipt_time_ms),
                    None => (0, 0),
                }
            };
            let remote_time_ms = now_local + self.offset();
            let payload = encode_payload(seq, remote_time_ms, reply_seq, hold_ms);
            if let Ok(datagram) = Datagram::new(CLOCKSYNC_PORT, payload) {
                if let Err(err) = self.bus.send(Some(connection), datagram) {
                    log::warn!("clocksync: send to {:?} failed: {err}", connection.id());
                } else {
                    self.shared.lock().expect("clocksync mutex poisoned").ring.push(seq, now_local);
                }
            }
        }

        self.update_offset(connections.len());
    }

    fn update_offset(&self, active_connections: usize) {
        let mut accumulator: i64 = 0;
        let current_offset = self.offset();
        let mut shared = self.shared.lock().expect("clocksync mutex poisoned");
        for record in shared.records.values_mut() {
            if record.round_trip_valid && !record.used {
                accumulator += record.last_inbound_remote_time_ms + record.round_trip_ms / 2
                    - record.local_receipt_time_ms
                    - current_offset;
                record.used = true;
            }
        }
        drop(shared);

        // gain is effectively integer-truncated to 1 in the source; this is
        // a documented, deliberate preservation (spec §9).
        let delta = accumulator / (active_connections as i64 + 1);
        self.offset_ms.fetch_add(delta, Ordering::AcqRel);
    }
}

impl PortListener for ClockSync {
    fn receive(&self, from: Option<ConnectionId>, datagram: Datagram) {
        let Some(from) = from else {
            return;
        };
        let Some(decoded) = decode_payload(datagram.payload()) else {
            log::warn!("clocksync: dropping wrong-length payload ({} octets)", datagram.payload().len());
            return;
        };
        let local_receipt_time_ms = self.clock.monotonic_millis();

        let mut shared = self.shared.lock().expect("clocksync mutex poisoned");
        let round_trip = if decoded.reply_seq != 0 {
            shared.ring.lookup(decoded.reply_seq).map(|send_time| local_receipt_time_ms - send_time - decoded.hold_ms)
        } else {
            None
        };

        shared.records.insert(
            from,
            ReceiveRecord {
                last_inbound_seq: decoded.seq,
                last_inbound_remote_time_ms: decoded.remote_time_ms,
                local_receipt_time_ms,
                round_trip_ms: round_trip.unwrap_or(0),
                round_trip_valid: round_trip.is_some(),
                used: false,
            },
        );
    }
}
