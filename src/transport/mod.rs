//! # Transport Layer
//!
//! Connections and hosts. A [`Connection`] is one duplex authenticated link
//! carrying frames; a [`Host`] produces connections, either by accepting
//! inbound dials or by dialing out.
//!
//! Two host variants share the same observable contract:
//! - [`TcpHost`]: binds a TCP listener, dials with a bounded timeout.
//! - [`LocalHost`]: in-process switchboard keyed by `local://` address,
//!   strictly for testing.

pub mod conn;
pub mod local;
pub mod tcp;

use async_trait::async_trait;

pub use conn::Connection;
pub use local::LocalHost;
pub use tcp::TcpHost;

use crate::error::Result;
use crate::identity::{Address, Scheme};
use std::time::Duration;

/// A listener/dialer pair bound to one address.
#[async_trait]
pub trait Host: Send + Sync {
    /// The address this host is reachable at.
    fn address(&self) -> &Address;

    /// Bind the listener. Must be called before [`Host::accept`].
    async fn listen(&self) -> Result<()>;

    /// Wait for the next inbound connection. Returns [`crate::Error::Closed`]
    /// once the host is closed.
    async fn accept(&self) -> Result<Connection>;

    /// Dial a remote address. Bounded by the host's dial timeout.
    async fn connect(&self, addr: &Address) -> Result<Connection>;

    /// Stop listening and wake any blocked [`Host::accept`].
    async fn close(&self);
}

/// Build the host variant matching the address scheme.
pub fn new_host(addr: Address, dial_timeout: Duration, max_frame: usize) -> Box<dyn Host> {
    match addr.scheme() {
        Scheme::Tcp => Box::new(TcpHost::new(addr, dial_timeout, max_frame)),
        Scheme::Local => Box::new(LocalHost::new(addr)),
    }
}

/// Dial `remote` without a listening host, as clients do.
///
/// `local` only labels the connection; nothing is bound.
pub async fn dial(
    local: Address,
    remote: &Address,
    dial_timeout: Duration,
    max_frame: usize,
) -> Result<Connection> {
    match remote.scheme() {
        Scheme::Tcp => tcp::dial(local, remote, dial_timeout, max_frame).await,
        Scheme::Local => local::dial(local, remote),
    }
}
