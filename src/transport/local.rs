//! In-process host for tests.
//!
//! Listening hosts register in a process-wide switchboard keyed by their
//! `local://` address; dialing looks the target up and hands it one side of
//! a cross-wired [`Connection`] pair. The observable contract matches the
//! TCP host: same handshake, same counters, same close semantics.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::{Address, Scheme};
use crate::transport::{Connection, Host};

static SWITCHBOARD: Lazy<Mutex<HashMap<Address, mpsc::UnboundedSender<Connection>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// In-process variant of [`Host`].
pub struct LocalHost {
    addr: Address,
    incoming: AsyncMutex<Option<mpsc::UnboundedReceiver<Connection>>>,
}

impl LocalHost {
    pub fn new(addr: Address) -> Self {
        Self {
            addr,
            incoming: AsyncMutex::new(None),
        }
    }
}

#[async_trait]
impl Host for LocalHost {
    fn address(&self) -> &Address {
        &self.addr
    }

    async fn listen(&self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        SWITCHBOARD
            .lock()
            .expect("switchboard poisoned")
            .insert(self.addr.clone(), tx);
        *self.incoming.lock().await = Some(rx);
        debug!(addr = %self.addr, "local host listening");
        Ok(())
    }

    async fn accept(&self) -> Result<Connection> {
        let mut guard = self.incoming.lock().await;
        let rx = guard.as_mut().ok_or(Error::Closed)?;
        rx.recv().await.ok_or(Error::Closed)
    }

    async fn connect(&self, addr: &Address) -> Result<Connection> {
        dial(self.addr.clone(), addr)
    }

    async fn close(&self) {
        SWITCHBOARD.lock().expect("switchboard poisoned").remove(&self.addr);
        // Dropping the receiver wakes a blocked accept with Closed.
        self.incoming.lock().await.take();
    }
}

/// Dial a listening local host.
pub fn dial(local: Address, remote: &Address) -> Result<Connection> {
    if remote.scheme() != Scheme::Local {
        return Err(Error::ConfigInvalid(format!("not a local address: {remote}")));
    }
    let sender = SWITCHBOARD
        .lock()
        .expect("switchboard poisoned")
        .get(remote)
        .cloned()
        .ok_or_else(|| Error::DialTimeout(remote.to_string()))?;
    let (ours, theirs) = Connection::pair(local, remote.clone());
    sender.send(theirs).map_err(|_| Error::DialTimeout(remote.to_string()))?;
    Ok(ours)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_requires_listener() {
        let err = dial(Address::local("nobody"), &Address::local("missing-peer")).unwrap_err();
        assert!(matches!(err, Error::DialTimeout(_)));
    }

    #[tokio::test]
    async fn accept_sees_dialed_connection() {
        let host = LocalHost::new(Address::local("lh-accept"));
        host.listen().await.unwrap();
        let conn = dial(Address::local("lh-client"), &Address::local("lh-accept")).unwrap();
        let accepted = host.accept().await.unwrap();
        assert_eq!(accepted.remote_address(), conn.local_address());
        host.close().await;
        assert!(matches!(host.accept().await, Err(Error::Closed)));
    }
}
