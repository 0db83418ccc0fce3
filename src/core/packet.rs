//! The dispatch packet.

use std::fmt;

use crate::core::registry::{message_type_id, Body, Message, MessageTypeID};
use crate::error::{Error, Result};
use crate::identity::ServerIdentity;

/// What the router hands to processors: sender identity, message type, and
/// the decoded body.
pub struct Packet {
    pub from: ServerIdentity,
    pub msg_type: MessageTypeID,
    pub body: Body,
}

impl Packet {
    pub fn new(from: ServerIdentity, msg_type: MessageTypeID, body: Body) -> Self {
        Self { from, msg_type, body }
    }

    /// Whether the body is a `T`.
    pub fn is<T: Message>(&self) -> bool {
        self.msg_type == message_type_id::<T>()
    }

    /// Borrow the body as a `T`, if it is one.
    pub fn body_as<T: Message>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    /// Consume the packet, yielding the typed body.
    ///
    /// # Errors
    /// [`Error::UnknownType`] when the body is not a `T`.
    pub fn take<T: Message>(self) -> Result<T> {
        match self.body.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(_) => Err(Error::UnknownType(format!(
                "expected {}, packet carries {}",
                T::NAME,
                self.msg_type
            ))),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("from", &self.from)
            .field("msg_type", &self.msg_type)
            .finish_non_exhaustive()
    }
}
