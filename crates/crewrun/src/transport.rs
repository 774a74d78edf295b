//! # Transport Abstraction
//!
//! A minimal, async interface for moving messages between execution
//! units.
//!
//! ## Philosophy
//!
//! - **One capability interface**: thread-, process-, or socket-backed
//!   connections all implement the same object-safe trait; the backing
//!   is selected at construction, never by runtime type inspection.
//! - **Packets, not bytes**: what crosses the boundary is an envelope
//!   plus its transfer list. Buffers in the transfer list are moved by
//!   ownership; once sent, the sender must not touch them again.

use std::fmt;

use bytes::Bytes;
use crewrpc::Envelope;
use crewrpc::transfer;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// This endpoint has been closed locally.
    Closed,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One unit of delivery: an envelope plus everything moved alongside it.
///
/// `buffers` is the transfer list from transferable-buffer detection.
/// `endpoints` carries channel endpoints inside control messages, the
/// way a message port rides a structured-clone transfer.
pub struct Packet {
    pub envelope: Envelope,
    pub buffers: Vec<Bytes>,
    pub endpoints: Vec<Box<dyn Transport>>,
}

impl Packet {
    /// Wraps an envelope, running transferable detection on its args.
    pub fn from_envelope(envelope: Envelope) -> Self {
        let buffers = transfer::transferables(&envelope);
        Packet { envelope, buffers, endpoints: Vec::new() }
    }

    /// Wraps an envelope with an explicit transfer list, skipping
    /// detection.
    pub fn with_buffers(envelope: Envelope, buffers: Vec<Bytes>) -> Self {
        Packet { envelope, buffers, endpoints: Vec::new() }
    }

    /// Attaches a channel endpoint to travel with the envelope.
    pub fn with_endpoint(envelope: Envelope, endpoint: Box<dyn Transport>) -> Self {
        let buffers = transfer::transferables(&envelope);
        Packet { envelope, buffers, endpoints: vec![endpoint] }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("envelope", &self.envelope)
            .field("buffers", &self.buffers.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

/// A mechanism to exchange packets with one isolated execution unit.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers one packet to the peer.
    ///
    /// # invariants
    /// - Must not block waiting for the peer to process the packet.
    /// - Must return `Err` when the peer is gone; delivery failures are
    ///   reported, never retried, at this layer.
    async fn send(&self, packet: Packet) -> Result<()>;

    /// Receives the next packet; `Ok(None)` once the peer is gone and
    /// all buffered packets were drained.
    async fn recv(&self) -> Result<Option<Packet>>;

    /// Closes this endpoint. Idempotent.
    fn close(&self);

    /// Whether this endpoint can still send.
    fn is_open(&self) -> bool;
}
