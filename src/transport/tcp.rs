//! TCP host: listener plus dialer.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::identity::{Address, Scheme};
use crate::transport::{Connection, Host};

/// TCP variant of [`Host`].
pub struct TcpHost {
    addr: Address,
    listener: RwLock<Option<Arc<TcpListener>>>,
    closed: Notify,
    dial_timeout: Duration,
    max_frame: usize,
}

impl TcpHost {
    pub fn new(addr: Address, dial_timeout: Duration, max_frame: usize) -> Self {
        Self {
            addr,
            listener: RwLock::new(None),
            closed: Notify::new(),
            dial_timeout,
            max_frame,
        }
    }
}

#[async_trait]
impl Host for TcpHost {
    fn address(&self) -> &Address {
        &self.addr
    }

    #[instrument(skip(self), fields(addr = %self.addr))]
    async fn listen(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr.network_address()).await?;
        info!("listening");
        *self.listener.write().expect("listener lock poisoned") = Some(Arc::new(listener));
        Ok(())
    }

    async fn accept(&self) -> Result<Connection> {
        let listener = self
            .listener
            .read()
            .expect("listener lock poisoned")
            .clone()
            .ok_or(Error::Closed)?;
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer_addr) = res?;
                debug!(peer = %peer_addr, "inbound connection");
                Ok(Connection::from_tcp(
                    stream,
                    self.addr.clone(),
                    Address::tcp(peer_addr.to_string()),
                    self.max_frame,
                ))
            }
            _ = self.closed.notified() => Err(Error::Closed),
        }
    }

    async fn connect(&self, addr: &Address) -> Result<Connection> {
        dial(self.addr.clone(), addr, self.dial_timeout, self.max_frame).await
    }

    async fn close(&self) {
        self.listener.write().expect("listener lock poisoned").take();
        self.closed.notify_waiters();
    }
}

/// Dial `remote` over TCP, bounded by `dial_timeout`.
pub async fn dial(
    local: Address,
    remote: &Address,
    dial_timeout: Duration,
    max_frame: usize,
) -> Result<Connection> {
    if remote.scheme() != Scheme::Tcp {
        return Err(Error::ConfigInvalid(format!("not a TCP address: {remote}")));
    }
    let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(remote.network_address()))
        .await
        .map_err(|_| Error::DialTimeout(remote.to_string()))??;
    stream.set_nodelay(true)?;
    Ok(Connection::from_tcp(stream, local, remote.clone(), max_frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::MAX_FRAME_SIZE;

    #[tokio::test]
    async fn listen_accept_connect() {
        let host = TcpHost::new(
            Address::tcp("127.0.0.1:12704"),
            Duration::from_secs(1),
            MAX_FRAME_SIZE,
        );
        host.listen().await.unwrap();
        let dialer = tokio::spawn(async move {
            dial(
                Address::tcp("127.0.0.1:0"),
                &Address::tcp("127.0.0.1:12704"),
                Duration::from_secs(1),
                MAX_FRAME_SIZE,
            )
            .await
        });
        let accepted = host.accept().await.unwrap();
        let dialed = dialer.await.unwrap().unwrap();
        assert_eq!(accepted.local_address(), host.address());
        assert_eq!(dialed.remote_address().network_address(), "127.0.0.1:12704");
    }

    #[tokio::test]
    async fn close_wakes_accept() {
        let host = Arc::new(TcpHost::new(
            Address::tcp("127.0.0.1:12705"),
            Duration::from_secs(1),
            MAX_FRAME_SIZE,
        ));
        host.listen().await.unwrap();
        let acceptor = {
            let host = host.clone();
            tokio::spawn(async move { host.accept().await })
        };
        tokio::task::yield_now().await;
        host.close().await;
        let res = tokio::time::timeout(Duration::from_millis(500), acceptor)
            .await
            .expect("accept should unblock")
            .unwrap();
        assert!(matches!(res, Err(Error::Closed)));
    }
}
