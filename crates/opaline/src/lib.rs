//! Reliable file transfer over a lossy datagram transport.
//!
//! TCP-like guarantees in user space over UDP: in-order exactly-once
//! delivery via a sliding-window receive buffer and cumulative ACKs, RTO
//! retransmission with Jacobson/Karn estimation, slow-start and
//! congestion-avoidance pacing with fast retransmit, persist-mode window
//! probes, and a port-migration handshake that moves each session off the
//! well-known port. Datagram loss is simulated from a seed so adverse
//! networks are reproducible.

pub mod client;
pub mod congestion;
pub mod error;
pub mod fifo;
pub mod loss;
pub mod recv_buffer;
pub mod rtt;
pub mod segment;
pub mod send_window;
pub mod server;

pub use client::{ClientParams, ClientStats, FileClient};
pub use error::{Result, TransportError};
pub use segment::{Segment, SegmentFlags};
pub use server::{FileServer, SessionStats};
