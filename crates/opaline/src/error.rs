use opal_binary::BinaryError;
use std::io;
use thiserror::Error;

/// Errors surfaced by the transport engine.
#[derive(Error, Debug)]
pub enum TransportError {
    /// An I/O error on the underlying UDP socket or the file being served.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment could not be encoded or decoded.
    #[error("framing error: {0}")]
    Binary(#[from] BinaryError),

    /// The retransmission counter passed its limit; the peer is unreachable.
    #[error("gave up after {0} retransmissions")]
    RetransmitLimit(u32),

    /// A peer reply that contradicts the protocol invariants.
    #[error("malformed segment: {0}")]
    Malformed(String),

    /// The port-migration handshake could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
