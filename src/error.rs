//! Error kinds the core distinguishes (spec §7).

use std::io;

/// The single error type returned by fallible `meshbus` operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("port {0} already bound")]
    PortInUse(u16),

    #[error("malformed interface address: {0}")]
    MalformedAddress(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("transport error: {0}")]
    TransportError(#[from] io::Error),

    #[error("could not resolve destination to a next hop")]
    ResolutionFailed,

    #[error("bundle queue is full")]
    QueueFull,

    #[error("endpoint already registered")]
    DuplicateEndpoint,

    #[error("dtn:none cannot be registered")]
    ReservedEndpoint,
}

/// Malformed-datagram family: always handled by dropping the datagram,
/// never by tearing down the connection (spec §4.8, §7).
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum FrameError {
    #[error("frame truncated before payload_length octets were available")]
    Truncated,

    #[error("sdnv continuation ran past the ninth octet")]
    Overflow,

    #[error("attempted to encode a negative value as an sdnv")]
    NegativeValue,

    #[error("bundle version was not 0x06")]
    BadVersion,

    #[error("expected the payload block, found a different block type")]
    BadBlockType,

    #[error("payload block flags were not 0x08 (last block)")]
    BadBlockFlags,
}
