//! Client side of the service API.
//!
//! A client holds an ephemeral identity, dials any roster member, performs
//! the identity handshake, sends one [`ClientRequest`] and waits for the
//! service's typed reply packet on the same connection.

use rand_core::{OsRng, RngCore};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::core::registry::{self, register_message, Message};
use crate::core::Packet;
use crate::error::{Error, Result};
use crate::identity::{Address, Keypair, ServerIdentity};
use crate::router::{Hello, HelloReply};
use crate::service::registry::{service_id, ServiceId};
use crate::service::ClientRequest;
use crate::transport;

/// Default bound on waiting for a service reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// One-shot requester for a named service.
pub struct Client {
    service: ServiceId,
    keypair: Keypair,
    config: Config,
    reply_timeout: Duration,
}

impl Client {
    /// Build a client for the service registered under `service_name`,
    /// with a fresh ephemeral identity.
    pub fn new(service_name: &str) -> Self {
        crate::router::register_messages();
        register_message::<ClientRequest>();
        let mut tag = [0u8; 8];
        OsRng.fill_bytes(&mut tag);
        let keypair = Keypair::generate(Address::local(format!("client-{}", hex::encode(tag))));
        Self {
            service: service_id(service_name),
            keypair,
            config: Config::default(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Override the reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// The client's ephemeral identity; replies are addressed to it.
    pub fn identity(&self) -> &ServerIdentity {
        self.keypair.identity()
    }

    /// Send `msg` to the service on `dst` and wait for one reply packet.
    ///
    /// The reply's type must be registered by the caller (or by the crate)
    /// for decoding to succeed.
    pub async fn send<T: Message>(&self, dst: &ServerIdentity, msg: &T) -> Result<Packet> {
        register_message::<T>();
        let conn = transport::dial(
            self.keypair.identity().address.clone(),
            &dst.address,
            self.config.dial_timeout,
            self.config.max_frame_size,
        )
        .await?;

        conn.send(&Hello {
            identity: self.keypair.identity().clone(),
            expected: dst.clone(),
        })
        .await?;
        let reply = timeout(self.config.dial_timeout, conn.expect::<HelloReply>())
            .await
            .map_err(|_| Error::DialTimeout(dst.to_string()))??;
        if reply.identity.public != dst.public {
            conn.close().await;
            return Err(Error::WrongPeer {
                expected: dst.to_string(),
                actual: reply.identity.to_string(),
            });
        }
        conn.set_peer(reply.identity);

        debug!(service = %self.service, to = %dst, "sending client request");
        conn.send(&ClientRequest {
            service: self.service,
            data: registry::marshal(msg)?,
        })
        .await?;

        let packet = timeout(self.reply_timeout, conn.recv())
            .await
            .map_err(|_| Error::ProtocolFailed(format!("no reply from {dst}")))??;
        conn.close().await;
        Ok(packet)
    }
}
