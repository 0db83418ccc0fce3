//! One duplex authenticated link.
//!
//! A [`Connection`] is single-writer/single-reader internally (the sink and
//! stream halves are independently locked), so `send` and `recv` may be
//! called from different tasks concurrently. Closing is idempotent; sends
//! after close fail with [`Error::Closed`]. Tx/Rx counters account whole
//! frames, header included, on both flavors.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::codec::Framed;
use tracing::trace;

use crate::core::codec::{Frame, FrameCodec};
use crate::core::registry::{self, message_type_id, Message};
use crate::core::Packet;
use crate::error::{Error, Result};
use crate::identity::{Address, ServerIdentity};

enum Inner {
    Tcp {
        sink: AsyncMutex<SplitSink<Framed<TcpStream, FrameCodec>, Frame>>,
        stream: AsyncMutex<SplitStream<Framed<TcpStream, FrameCodec>>>,
    },
    Local {
        tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
        rx: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    },
}

/// A full-duplex link to one peer.
pub struct Connection {
    local: Address,
    remote: Address,
    peer: RwLock<Option<ServerIdentity>>,
    inner: Inner,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl Connection {
    /// Wrap an established TCP stream.
    pub fn from_tcp(stream: TcpStream, local: Address, remote: Address, max_frame: usize) -> Self {
        let framed = Framed::new(stream, FrameCodec::new(max_frame));
        let (sink, stream) = framed.split();
        Self {
            local,
            remote,
            peer: RwLock::new(None),
            inner: Inner::Tcp {
                sink: AsyncMutex::new(sink),
                stream: AsyncMutex::new(stream),
            },
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    /// Cross-wired in-process pair: what one side sends, the other receives.
    pub fn pair(a: Address, b: Address) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let mk = |local: Address, remote: Address, tx, rx| Self {
            local,
            remote,
            peer: RwLock::new(None),
            inner: Inner::Local {
                tx: Mutex::new(Some(tx)),
                rx: AsyncMutex::new(rx),
            },
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        };
        (mk(a.clone(), b.clone(), a_tx, a_rx), mk(b, a, b_tx, b_rx))
    }

    /// The address this side goes by.
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    /// The address of the other side, as dialed or accepted.
    pub fn remote_address(&self) -> &Address {
        &self.remote
    }

    /// The peer identity learned during the handshake, if completed.
    pub fn peer(&self) -> Option<ServerIdentity> {
        self.peer.read().expect("peer lock poisoned").clone()
    }

    /// Record the peer identity after a successful handshake.
    pub fn set_peer(&self, id: ServerIdentity) {
        *self.peer.write().expect("peer lock poisoned") = Some(id);
    }

    /// Encode and send one message.
    ///
    /// # Errors
    /// [`Error::Closed`] after [`Connection::close`]; transport errors close
    /// the connection.
    pub async fn send<T: Message>(&self, msg: &T) -> Result<()> {
        let payload = registry::encode(msg)?;
        self.send_frame(Frame {
            msg_type: message_type_id::<T>(),
            payload: payload.into(),
        })
        .await
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let wire_len = frame.wire_len();
        match &self.inner {
            Inner::Tcp { sink, .. } => {
                let mut sink = sink.lock().await;
                if let Err(e) = sink.send(frame).await {
                    self.closed.store(true, Ordering::Release);
                    return Err(e);
                }
            }
            Inner::Local { tx, .. } => {
                let sender = tx.lock().expect("sender lock poisoned").clone();
                match sender {
                    Some(tx) => tx.send(frame).map_err(|_| Error::Closed)?,
                    None => return Err(Error::Closed),
                }
            }
        }
        self.tx_bytes.fetch_add(wire_len, Ordering::Relaxed);
        trace!(to = %self.remote, bytes = wire_len, "frame sent");
        Ok(())
    }

    /// Receive the next frame.
    ///
    /// Returns [`Error::Closed`] when the link ends; a decode failure inside
    /// the codec surfaces as [`Error::Encoding`] and does terminate the
    /// stream.
    pub(crate) async fn recv_frame(&self) -> Result<Frame> {
        let frame = match &self.inner {
            Inner::Tcp { stream, .. } => {
                let mut stream = stream.lock().await;
                match stream.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::Closed),
                }
            }
            Inner::Local { rx, .. } => {
                let mut rx = rx.lock().await;
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => return Err(Error::Closed),
                    },
                    _ = self.closed_notify.notified() => return Err(Error::Closed),
                }
            }
        };
        self.rx_bytes.fetch_add(frame.wire_len(), Ordering::Relaxed);
        Ok(frame)
    }

    /// Receive and decode the next message into a [`Packet`].
    ///
    /// The packet's `from` is the handshaken peer identity, or an unverified
    /// placeholder before the handshake completes. An unregistered type
    /// yields [`Error::UnknownType`] without terminating the connection.
    pub async fn recv(&self) -> Result<Packet> {
        let frame = self.recv_frame().await?;
        let body = registry::decode(frame.msg_type, &frame.payload)?;
        let from = self
            .peer()
            .unwrap_or_else(|| ServerIdentity::unverified(self.remote.clone()));
        Ok(Packet::new(from, frame.msg_type, body))
    }

    /// Receive the next message, requiring it to be a `T`. Handshake helper.
    pub(crate) async fn expect<T: Message>(&self) -> Result<T> {
        let frame = self.recv_frame().await?;
        if frame.msg_type != message_type_id::<T>() {
            return Err(Error::Encoding(format!(
                "expected {}, received type {}",
                T::NAME,
                frame.msg_type
            )));
        }
        registry::decode_as(&frame.payload)
    }

    /// Close the link. Idempotent; wakes a blocked local receive.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.inner {
            Inner::Tcp { sink, .. } => {
                let mut sink = sink.lock().await;
                let _ = sink.close().await;
            }
            Inner::Local { tx, .. } => {
                tx.lock().expect("sender lock poisoned").take();
            }
        }
        self.closed_notify.notify_waiters();
    }

    /// Whether [`Connection::close`] has been called or the link failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Total bytes sent, headers included.
    pub fn tx(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes received, headers included.
    pub fn rx(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        i: u64,
    }

    impl Message for Probe {
        const NAME: &'static str = "test.conn.Probe";
    }

    #[tokio::test]
    async fn local_pair_duplex() {
        registry::register_message::<Probe>();
        let (a, b) = Connection::pair(Address::local("a"), Address::local("b"));
        a.send(&Probe { i: 3 }).await.unwrap();
        b.send(&Probe { i: 4 }).await.unwrap();
        assert_eq!(b.recv().await.unwrap().take::<Probe>().unwrap(), Probe { i: 3 });
        assert_eq!(a.recv().await.unwrap().take::<Probe>().unwrap(), Probe { i: 4 });
        assert_eq!(a.tx(), b.rx());
        assert!(a.tx() > 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_sends() {
        registry::register_message::<Probe>();
        let (a, b) = Connection::pair(Address::local("a"), Address::local("b"));
        a.close().await;
        a.close().await;
        assert!(matches!(a.send(&Probe { i: 1 }).await, Err(Error::Closed)));
        assert!(matches!(b.recv().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn close_wakes_blocked_receive() {
        let (a, _b) = Connection::pair(Address::local("a"), Address::local("b"));
        let a = std::sync::Arc::new(a);
        let receiver = {
            let a = a.clone();
            tokio::spawn(async move { a.recv_frame().await })
        };
        tokio::task::yield_now().await;
        a.close().await;
        let res = tokio::time::timeout(std::time::Duration::from_millis(200), receiver)
            .await
            .expect("receive should unblock")
            .unwrap();
        assert!(matches!(res, Err(Error::Closed)));
    }
}
