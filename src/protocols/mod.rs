//! # Tree Protocols
//!
//! Concrete protocols running on the overlay engine.

pub mod cosign;

pub use cosign::{Announce, Cosign, Response, PROTOCOL_NAME};
