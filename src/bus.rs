//! The bus context: owns connections, multiplexes DMP over each, and
//! dispatches received datagrams to port-bound listeners (spec §4.3).
//!
//! Grounded on `InterfaceManager` in the teacher's `iface.rs`: a registration
//! counter, mutex-guarded tables, a worker spawned per registered stream,
//! and a `Drop` that signals everything to stop. The worker model is
//! std-thread/blocking-I/O rather than tokio, per spec §5.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::address::InterfaceAddress;
use crate::connection::{Connection, ConnectionId};
use crate::dmp::Datagram;
use crate::error::BusError;

/// A port-bound listener (spec §3 "Port binding", §4.3).
pub trait PortListener: Send + Sync {
    /// Invoked with the datagram and the connection it arrived on, or
    /// `None` for a locally-looped-back send (spec §4.3 "send").
    fn receive(&self, from: Option<ConnectionId>, datagram: Datagram);
}

/// Connection-set change notifications (spec §4.3 "change listener").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChange {
    Added,
    Removed,
}

pub trait ChangeListener: Send + Sync {
    fn on_change(&self, connection: Arc<Connection>, change: ConnectionChange);
}

struct PortBinding {
    port: u16,
    listener: Arc<dyn PortListener>,
}

#[derive(Default)]
struct Shared {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    bindings: Vec<PortBinding>,
    change_listeners: Vec<Arc<dyn ChangeListener>>,
    main_address: Option<InterfaceAddress>,
    workers: HashMap<ConnectionId, JoinHandle<()>>,
}

pub struct BusContext {
    shared: Mutex<Shared>,
}

impl BusContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { shared: Mutex::new(Shared::default()) })
    }

    /// Explicitly set this node's identity (spec §4.3 "Main-address
    /// policy"); overrides the lazily-derived default.
    pub fn set_main_address(&self, address: InterfaceAddress) {
        self.shared.lock().expect("bus mutex poisoned").main_address = Some(address);
    }

    /// This node's identity: the explicitly set address, or else the first
    /// active connection's local address.
    pub fn main_address(&self) -> Option<InterfaceAddress> {
        let shared = self.shared.lock().expect("bus mutex poisoned");
        shared.main_address.or_else(|| shared.connections.values().next().map(|c| c.local_address()))
    }

    /// Register a connection and start its receive worker. A no-op if the
    /// connection is already present.
    pub fn add_connection(self: &Arc<Self>, connection: Arc<Connection>) {
        let mut shared = self.shared.lock().expect("bus mutex poisoned");
        if shared.connections.contains_key(&connection.id()) {
            return;
        }

        let id = connection.id();
        shared.connections.insert(id, connection.clone());

        let bus = self.clone();
        let worker_conn = connection.clone();
        let handle = std::thread::spawn(move || bus.receive_worker(worker_conn));
        shared.workers.insert(id, handle);

        let listeners = shared.change_listeners.clone();
        drop(shared);
        log::debug!("bus: connection {:?} added", id);
        for listener in listeners {
            listener.on_change(connection.clone(), ConnectionChange::Added);
        }
    }

    /// Remove a connection from the active set and signal its worker to
    /// stop. Does NOT close the underlying stream — the caller owns that.
    pub fn remove_connection(&self, connection: &Arc<Connection>) {
        let id = connection.id();
        let mut shared = self.shared.lock().expect("bus mutex poisoned");
        let removed = shared.connections.remove(&id);
        shared.workers.remove(&id);

        if let Some(connection) = removed {
            connection.mark_disconnected();
            let listeners = shared.change_listeners.clone();
            drop(shared);
            log::debug!("bus: connection {:?} removed", id);
            for listener in listeners {
                listener.on_change(connection.clone(), ConnectionChange::Removed);
            }
        }
    }

    fn receive_worker(self: Arc<Self>, connection: Arc<Connection>) {
        loop {
            if !connection.is_connected() {
                break;
            }
            match connection.recv() {
                Ok(datagram) => self.receive(Some(connection.id()), datagram),
                Err(BusError::MalformedFrame(err)) => {
                    log::warn!("bus: dropping malformed datagram on {:?}: {err}", connection.id());
                    continue;
                }
                Err(_) => {
                    log::info!("bus: connection {:?} failed, removing", connection.id());
                    break;
                }
            }
        }
        self.remove_connection(&connection);
    }

    /// Register `listener` for `port`. Fails with [`BusError::PortInUse`] if
    /// any registration already holds that port.
    pub fn bind(&self, listener: Arc<dyn PortListener>, port: u16) -> Result<(), BusError> {
        let mut shared = self.shared.lock().expect("bus mutex poisoned");
        if shared.bindings.iter().any(|b| b.port == port) {
            return Err(BusError::PortInUse(port));
        }
        shared.bindings.push(PortBinding { port, listener });
        Ok(())
    }

    /// Remove the binding for `(listener, port)`. `port = None` is the
    /// "all ports for this listener" sentinel (spec §4.3).
    pub fn unbind(&self, listener: &Arc<dyn PortListener>, port: Option<u16>) {
        let mut shared = self.shared.lock().expect("bus mutex poisoned");
        shared.bindings.retain(|b| {
            let same_listener = Arc::ptr_eq(&b.listener, listener);
            !(same_listener && port.map_or(true, |p| p == b.port))
        });
    }

    /// Deliver a datagram: to self if `connection` is `None` (the "sentinel
    /// null" of spec §4.3), else write it to the connection. An I/O failure
    /// disconnects the connection and the error is surfaced to the caller.
    pub fn send(&self, connection: Option<&Arc<Connection>>, datagram: Datagram) -> Result<(), BusError> {
        match connection {
            None => {
                self.receive(None, datagram);
                Ok(())
            }
            Some(connection) => connection.send(&datagram).map_err(|err| {
                self.remove_connection(connection);
                err
            }),
        }
    }

    /// Look up the port binding and deliver; drop silently if unbound.
    pub fn receive(&self, from: Option<ConnectionId>, datagram: Datagram) {
        let listener = {
            let shared = self.shared.lock().expect("bus mutex poisoned");
            shared.bindings.iter().find(|b| b.port == datagram.port()).map(|b| b.listener.clone())
        };
        match listener {
            Some(listener) => listener.receive(from, datagram),
            None => log::trace!("bus: no listener bound to port {}, dropping", datagram.port()),
        }
    }

    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        let mut shared = self.shared.lock().expect("bus mutex poisoned");
        if !shared.change_listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            shared.change_listeners.push(listener);
        }
    }

    pub fn remove_change_listener(&self, listener: &Arc<dyn ChangeListener>) {
        let mut shared = self.shared.lock().expect("bus mutex poisoned");
        shared.change_listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Every connection currently in the active set.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.lock().expect("bus mutex poisoned").connections.values().cloned().collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.lock().expect("bus mutex poisoned").connections.get(&id).cloned()
    }
}
