pub mod address;
pub mod buffer;
pub mod bundle;
pub mod bundle_agent;
pub mod bus;
pub mod clocksync;
pub mod connection;
pub mod dmp;
pub mod error;
pub mod routing;
pub mod sdnv;
pub mod sfrp;
pub mod time;

pub use crate::address::InterfaceAddress;
pub use crate::bundle::Bundle;
pub use crate::bundle_agent::BundleAgent;
pub use crate::bus::BusContext;
pub use crate::clocksync::ClockSync;
pub use crate::connection::{Connection, ConnectionId};
pub use crate::dmp::Datagram;
pub use crate::error::BusError;
pub use crate::sfrp::Sfrp;
