//! Pluggable next-hop resolution and endpoint-host naming (spec §4.7 step 4,
//! §9 "cross-subsystem back-references": express collaborators as
//! capability interfaces the bundle agent is given at construction rather
//! than owning them).

use crate::address::InterfaceAddress;
use crate::connection::ConnectionId;

/// Resolves a destination address to an outgoing connection. The bundle
/// agent's default never finds a route, matching the spec's "default:
/// always nothing".
pub trait RoutingProvider: Send + Sync {
    fn next_hop(&self, destination: InterfaceAddress) -> Option<ConnectionId>;
}

/// The default routing provider: never resolves anything. A real deployment
/// wires in [`crate::sfrp::Sfrp`] (whose `next_hop` has the same shape) or
/// an equivalent.
pub struct NoRouting;

impl RoutingProvider for NoRouting {
    fn next_hop(&self, _destination: InterfaceAddress) -> Option<ConnectionId> {
        None
    }
}

/// Resolves an endpoint string's host part to an [`InterfaceAddress`].
/// Hostname lookup is out of scope for the core (spec §1 "Out of scope"); a
/// real naming provider would consult some directory, but the only
/// resolution this crate performs itself is the literal bracketed form
/// (spec §4.7 step 4), exposed as [`resolve_literal_host`].
pub trait NamingProvider: Send + Sync {
    fn resolve(&self, endpoint: &str) -> Option<InterfaceAddress>;
}

/// The default naming provider: only resolves a literal `[<address>]` host,
/// never a hostname (spec §4.7 step 4: "no hostname lookup is implemented
/// in the core").
pub struct LiteralOnlyNaming;

impl NamingProvider for LiteralOnlyNaming {
    fn resolve(&self, endpoint: &str) -> Option<InterfaceAddress> {
        resolve_literal_host(endpoint)
    }
}

/// Extract and parse a `[<address>]` literal from an endpoint string such as
/// `dtn://[fd00:0:0:0:0:0:0:1]/echo`. Returns `None` if no bracketed literal
/// is present or it fails to parse as an [`InterfaceAddress`].
pub fn resolve_literal_host(endpoint: &str) -> Option<InterfaceAddress> {
    let start = endpoint.find('[')?;
    let end = endpoint[start..].find(']')? + start;
    InterfaceAddress::parse(&endpoint[start + 1..end]).ok()
}
