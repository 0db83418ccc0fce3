//! # Core Wire Components
//!
//! Message-type registry, packet framing, field serialization rules and
//! the dispatch packet.
//!
//! ## Wire format
//! ```text
//! [Length(4, BE, excludes itself)] [TypeId(16)] [Payload(N)]
//! ```
//!
//! Payload encoding is deterministic and structural: integers are
//! big-endian fixed-width, variable-length fields carry a `u32` length
//! prefix, and sequences carry a `u32` count followed by their elements
//! (see [`serialization`]). Two independent processes registering the same
//! message shape produce identical bytes.

pub mod codec;
pub mod packet;
pub mod registry;
pub mod serialization;

pub use codec::{Frame, FrameCodec};
pub use packet::Packet;
pub use registry::{register_message, Body, Message, MessageTypeID};
