//! # Router
//!
//! Owns a [`Host`] and the table of live peer connections; dispatches
//! inbound messages to registered processors and auto-dials on outbound
//! sends.
//!
//! ## Contract
//! - [`Router::start`] accepts connections until [`Router::stop`] is called
//!   and returns shortly after.
//! - [`Router::send`] dials and handshakes first when no live connection to
//!   the peer exists; a send to this router's own identity dispatches
//!   locally without any connection.
//! - One processor per message type; re-registration replaces.
//! - Per-connection I/O errors close that connection only; pending sends to
//!   it fail with [`Error::PeerGone`]. The router survives peer loss.
//!
//! ## Handshake
//! The dialer opens with `Hello{identity, expected}`; an acceptor whose own
//! identity differs from `expected` closes. Otherwise it answers
//! `HelloReply{identity, expected}` and the dialer aborts with
//! [`Error::WrongPeer`] if the replied identity is not the one it dialed.
//!
//! ## Duplicate dials
//! Concurrent dials between two routers are resolved deterministically:
//! the side with the lower public key keeps its outgoing connection, the
//! other keeps the incoming one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::core::registry::{self, message_type_id, register_message, Message, MessageTypeID};
use crate::core::Packet;
use crate::error::{Error, Result};
use crate::identity::{PublicId, ServerIdentity};
use crate::transport::{Connection, Host};

/// Handles inbound packets of the types it registered for.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, packet: Packet);
}

/// Dialer's opening message: who it is and who it expects on the other end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub identity: ServerIdentity,
    pub expected: ServerIdentity,
}

impl Message for Hello {
    const NAME: &'static str = "router.Hello";
}

/// Acceptor's answer: its own identity plus the echoed expectation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HelloReply {
    pub identity: ServerIdentity,
    pub expected: ServerIdentity,
}

impl Message for HelloReply {
    const NAME: &'static str = "router.HelloReply";
}

/// Register the handshake message types. Idempotent.
pub(crate) fn register_messages() {
    register_message::<Hello>();
    register_message::<HelloReply>();
}

struct PeerEntry {
    conn: Arc<Connection>,
    outgoing: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    id: ServerIdentity,
    host: Box<dyn Host>,
    config: Config,
    connections: Mutex<HashMap<PublicId, Arc<PeerEntry>>>,
    processors: RwLock<HashMap<MessageTypeID, Arc<dyn Processor>>>,
    retired_tx: AtomicU64,
    retired_rx: AtomicU64,
    stopping: AtomicBool,
    running: watch::Sender<bool>,
}

/// Authenticated, multiplexed point-to-point transport.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub fn new(id: ServerIdentity, host: Box<dyn Host>, config: Config) -> Self {
        register_messages();
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id,
                host,
                config,
                connections: Mutex::new(HashMap::new()),
                processors: RwLock::new(HashMap::new()),
                retired_tx: AtomicU64::new(0),
                retired_rx: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
                running,
            }),
        }
    }

    /// This router's identity.
    pub fn identity(&self) -> &ServerIdentity {
        &self.inner.id
    }

    /// Observe the running flag; flips to `true` once the listener is bound
    /// and back to `false` when [`Router::start`] returns.
    pub fn running(&self) -> watch::Receiver<bool> {
        self.inner.running.subscribe()
    }

    /// Bind the listener and accept connections until [`Router::stop`].
    #[instrument(skip(self), fields(id = %self.inner.id))]
    pub async fn start(&self) -> Result<()> {
        self.inner.host.listen().await?;
        self.inner.running.send_replace(true);
        info!("router started");
        while !self.inner.stopping.load(Ordering::Acquire) {
            match self.inner.host.accept().await {
                Ok(conn) => {
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Inner::handle_incoming(&inner, conn).await {
                            debug!(error = %e, "incoming connection rejected");
                        }
                    });
                }
                Err(Error::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        Inner::close_all(&self.inner).await;
        self.inner.running.send_replace(false);
        info!("router stopped");
        Ok(())
    }

    /// Shut the router down: stop accepting, close every peer connection,
    /// fail new sends fast. Idempotent; [`Router::start`] returns shortly
    /// after.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.host.close().await;
        Inner::close_all(&self.inner).await;
        Ok(())
    }

    /// Deliver `msg` to `to`, dialing and handshaking first if needed.
    pub async fn send<T: Message>(&self, to: &ServerIdentity, msg: &T) -> Result<()> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if to.public == self.inner.id.public {
            // Loopback: run our own encoding through the registry so the
            // observable path matches a remote delivery.
            let bytes = registry::encode(msg)?;
            let body = registry::decode(message_type_id::<T>(), &bytes)?;
            let packet = Packet::new(self.inner.id.clone(), message_type_id::<T>(), body);
            Inner::dispatch(&self.inner, packet).await;
            return Ok(());
        }
        let entry = {
            let table = self.inner.connections.lock().expect("connection table poisoned");
            table.get(&to.public).cloned()
        };
        let entry = match entry {
            Some(entry) => entry,
            None => self.connect_to(to).await?,
        };
        if let Err(e) = entry.conn.send(msg).await {
            debug!(peer = %to, error = %e, "send failed, removing connection");
            Inner::remove_connection(&self.inner, to.public).await;
            return Err(Error::PeerGone(to.to_string()));
        }
        Ok(())
    }

    /// Route inbound messages of the listed types to `proc`. Exactly one
    /// processor per type; re-registration replaces the previous one.
    pub fn register_processor(&self, proc: Arc<dyn Processor>, types: &[MessageTypeID]) {
        let mut processors = self.inner.processors.write().expect("processor table poisoned");
        for t in types {
            processors.insert(*t, proc.clone());
        }
    }

    /// Total bytes sent over all connections, past and present.
    pub fn tx(&self) -> u64 {
        let live: u64 = {
            let table = self.inner.connections.lock().expect("connection table poisoned");
            table.values().map(|e| e.conn.tx()).sum()
        };
        self.inner.retired_tx.load(Ordering::Relaxed) + live
    }

    /// Total bytes received over all connections, past and present.
    pub fn rx(&self) -> u64 {
        let live: u64 = {
            let table = self.inner.connections.lock().expect("connection table poisoned");
            table.values().map(|e| e.conn.rx()).sum()
        };
        self.inner.retired_rx.load(Ordering::Relaxed) + live
    }

    /// Dialer side of the identity handshake over an already-open
    /// connection.
    ///
    /// # Errors
    /// [`Error::WrongPeer`] when the acceptor's identity is not `remote`'s;
    /// [`Error::DialTimeout`] when the reply does not arrive in time.
    pub async fn negotiate_open(&self, remote: &ServerIdentity, conn: &Connection) -> Result<()> {
        conn.send(&Hello {
            identity: self.inner.id.clone(),
            expected: remote.clone(),
        })
        .await?;
        let reply = timeout(self.inner.config.dial_timeout, conn.expect::<HelloReply>())
            .await
            .map_err(|_| Error::DialTimeout(remote.to_string()))??;
        if reply.identity.public != remote.public {
            conn.close().await;
            return Err(Error::WrongPeer {
                expected: remote.to_string(),
                actual: reply.identity.to_string(),
            });
        }
        conn.set_peer(reply.identity);
        Ok(())
    }

    async fn connect_to(&self, to: &ServerIdentity) -> Result<Arc<PeerEntry>> {
        debug!(peer = %to, "auto-dialing");
        let conn = self.inner.host.connect(&to.address).await?;
        self.negotiate_open(to, &conn).await?;
        Inner::add_connection(&self.inner, to.clone(), Arc::new(conn), true).await
    }
}

impl Inner {
    async fn handle_incoming(inner: &Arc<Inner>, conn: Connection) -> Result<()> {
        let conn = Arc::new(conn);
        let hello = timeout(inner.config.dial_timeout, conn.expect::<Hello>())
            .await
            .map_err(|_| Error::DialTimeout(conn.remote_address().to_string()))??;
        if hello.expected.public != inner.id.public {
            conn.close().await;
            return Err(Error::WrongPeer {
                expected: hello.expected.to_string(),
                actual: inner.id.to_string(),
            });
        }
        conn.send(&HelloReply {
            identity: inner.id.clone(),
            expected: hello.identity.clone(),
        })
        .await?;
        conn.set_peer(hello.identity.clone());
        Self::add_connection(inner, hello.identity, conn, false).await?;
        Ok(())
    }

    /// Insert a handshaken connection, resolving duplicates by the
    /// lowest-public-key-keeps-its-outgoing rule.
    async fn add_connection(
        inner: &Arc<Inner>,
        peer: ServerIdentity,
        conn: Arc<Connection>,
        outgoing: bool,
    ) -> Result<Arc<PeerEntry>> {
        if inner.stopping.load(Ordering::Acquire) {
            conn.close().await;
            return Err(Error::Closed);
        }
        let entry = Arc::new(PeerEntry {
            conn,
            outgoing,
            tasks: Mutex::new(Vec::new()),
        });
        let (kept, loser): (Arc<PeerEntry>, Option<Arc<PeerEntry>>) = {
            let mut table = inner.connections.lock().expect("connection table poisoned");
            match table.get(&peer.public).cloned() {
                None => {
                    table.insert(peer.public, entry.clone());
                    (entry.clone(), None)
                }
                Some(existing) if existing.outgoing == outgoing || existing.conn.is_closed() => {
                    // Same direction means a reconnect, not a concurrent
                    // dial: the newer edge wins.
                    table.insert(peer.public, entry.clone());
                    (entry.clone(), Some(existing))
                }
                Some(existing) => {
                    let keep_outgoing = inner.id.public < peer.public;
                    if existing.outgoing == keep_outgoing {
                        (existing, Some(entry.clone()))
                    } else {
                        table.insert(peer.public, entry.clone());
                        (entry.clone(), Some(existing))
                    }
                }
            }
        };
        if let Some(loser) = loser {
            debug!(peer = %peer, "duplicate connection resolved");
            inner.retired_tx.fetch_add(loser.conn.tx(), Ordering::Relaxed);
            inner.retired_rx.fetch_add(loser.conn.rx(), Ordering::Relaxed);
            loser.conn.close().await;
            for task in loser.tasks.lock().expect("task list poisoned").drain(..) {
                task.abort();
            }
            if Arc::ptr_eq(&loser, &entry) {
                // Ours lost; hand the caller the surviving edge.
                return Ok(kept);
            }
        }
        if Arc::ptr_eq(&kept, &entry) {
            Self::spawn_loops(inner, peer, entry.clone());
        }
        Ok(kept)
    }

    fn spawn_loops(inner: &Arc<Inner>, peer: ServerIdentity, entry: Arc<PeerEntry>) {
        let (queue_tx, mut queue_rx) = mpsc::channel::<Packet>(inner.config.dispatch_queue_limit);

        let dispatcher = {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(packet) = queue_rx.recv().await {
                    Self::dispatch(&inner, packet).await;
                }
            })
        };

        let receiver = {
            let inner = inner.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                loop {
                    match entry.conn.recv().await {
                        Ok(packet) => match queue_tx.try_send(packet) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!(peer = %peer, "dispatch queue over high-water mark, closing connection");
                                break;
                            }
                            Err(TrySendError::Closed(_)) => break,
                        },
                        // Forward compatibility: peers may speak types we
                        // do not know; never a reason to drop the link.
                        Err(Error::UnknownType(t)) => {
                            warn!(peer = %peer, msg_type = %t, "dropping message of unknown type");
                        }
                        Err(Error::Closed) => break,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "connection receive failed");
                            break;
                        }
                    }
                }
                Self::remove_entry(&inner, peer.public, &entry).await;
            })
        };

        entry
            .tasks
            .lock()
            .expect("task list poisoned")
            .extend([receiver, dispatcher]);
    }

    async fn dispatch(inner: &Arc<Inner>, packet: Packet) {
        let proc = {
            let processors = inner.processors.read().expect("processor table poisoned");
            processors.get(&packet.msg_type).cloned()
        };
        match proc {
            Some(proc) => proc.process(packet).await,
            None => warn!(msg_type = %packet.msg_type, "no processor registered, dropping packet"),
        }
    }

    async fn remove_connection(inner: &Arc<Inner>, peer: PublicId) {
        let entry = {
            let mut table = inner.connections.lock().expect("connection table poisoned");
            table.remove(&peer)
        };
        if let Some(entry) = entry {
            inner.retired_tx.fetch_add(entry.conn.tx(), Ordering::Relaxed);
            inner.retired_rx.fetch_add(entry.conn.rx(), Ordering::Relaxed);
            entry.conn.close().await;
        }
    }

    /// Remove `expected` from the table, but only if it is still the entry
    /// registered for `peer`; a duplicate-dial winner must not be evicted by
    /// its loser's teardown.
    async fn remove_entry(inner: &Arc<Inner>, peer: PublicId, expected: &Arc<PeerEntry>) {
        let removed = {
            let mut table = inner.connections.lock().expect("connection table poisoned");
            match table.get(&peer) {
                Some(current) if Arc::ptr_eq(current, expected) => table.remove(&peer),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            inner.retired_tx.fetch_add(entry.conn.tx(), Ordering::Relaxed);
            inner.retired_rx.fetch_add(entry.conn.rx(), Ordering::Relaxed);
        }
        expected.conn.close().await;
    }

    async fn close_all(inner: &Arc<Inner>) {
        let entries: Vec<(PublicId, Arc<PeerEntry>)> = {
            let mut table = inner.connections.lock().expect("connection table poisoned");
            table.drain().collect()
        };
        for (_, entry) in entries {
            inner.retired_tx.fetch_add(entry.conn.tx(), Ordering::Relaxed);
            inner.retired_rx.fetch_add(entry.conn.rx(), Ordering::Relaxed);
            entry.conn.close().await;
            for task in entry.tasks.lock().expect("task list poisoned").drain(..) {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("id", &self.inner.id).finish_non_exhaustive()
    }
}
