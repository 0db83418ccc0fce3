//! # Error Types
//!
//! All error variants that can surface from the cothority runtime, from
//! low-level transport failures to protocol-level violations.
//!
//! Errors carry a kind and a human-readable cause; they never carry stack
//! traces. The propagation rules are:
//! - a transport error closes the affected connection only, translating
//!   pending sends into [`Error::PeerGone`]; the router survives,
//! - an inbound message with an unregistered type is logged and dropped,
//! - a handshake identity mismatch closes the connection and surfaces
//!   [`Error::WrongPeer`] to the dialer,
//! - protocol-instance failures stay inside the instance; the owning
//!   service decides what the client sees.

use std::io;
use thiserror::Error;

/// Primary error type for all cothority operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection (or router) has been closed; further sends fail fast.
    #[error("connection closed")]
    Closed,

    /// The remote peer vanished; the connection was removed from the table.
    #[error("peer {0} is gone")]
    PeerGone(String),

    /// Handshake completed with an identity other than the expected one.
    #[error("wrong peer: expected {expected}, got {actual}")]
    WrongPeer { expected: String, actual: String },

    /// Dialing a remote address did not complete within the dial timeout.
    #[error("dial to {0} timed out")]
    DialTimeout(String),

    /// No constructor is registered for the received message type.
    #[error("unknown message type {0}")]
    UnknownType(String),

    /// A client request named a service this host does not run.
    #[error("unknown service {0}")]
    UnknownService(String),

    /// A second channel or handler was bound for the same message type on
    /// one protocol instance.
    #[error("duplicate binding for message type {0}")]
    DuplicateBinding(String),

    /// A protocol instance failed; the cause is service-defined.
    #[error("protocol failed: {0}")]
    ProtocolFailed(String),

    /// Serialization or framing failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A configuration value or file is invalid.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

/// Type alias for Results using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
