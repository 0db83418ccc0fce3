//! # Services
//!
//! A service is a singleton per (service-name, host), created at host start
//! through its registered factory and alive until shutdown. Services own
//! protocol instances: they spawn them as roots in response to client
//! requests, and bring them up on demand when a peer-initiated protocol
//! message arrives.

pub mod client;
pub mod context;
pub mod manager;
pub mod registry;

pub use client::Client;
pub use context::{Context, ServiceProcessor};
pub use manager::ServiceManager;
pub use registry::{
    delete_new_service, register_new_service, registered_service_names, service_id, ServiceId,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::registry::Message;
use crate::core::Packet;
use crate::error::Result;
use crate::identity::ServerIdentity;
use crate::overlay::{ProtocolInstance, TreeNodeInstance};

/// What external clients send: the target service plus an opaque body that
/// is itself a marshalled registered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub service: ServiceId,
    #[serde(with = "crate::core::serialization::bytes")]
    pub data: Vec<u8>,
}

impl Message for ClientRequest {
    const NAME: &'static str = "service.ClientRequest";
}

/// The capability set every service implements.
///
/// A service that also wants direct (non-protocol) messages implements
/// [`Processor`](crate::router::Processor) as well and registers itself
/// through [`Context::register_processor`].
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Entry point for requests from external clients.
    async fn process_client_request(&self, from: &ServerIdentity, req: ClientRequest);

    /// Spawn-on-demand hook: called when a protocol envelope arrives for a
    /// token of this service that has no local instance yet. Returning
    /// `None` declines participation and the triggering message is dropped
    /// silently.
    async fn new_protocol(
        &self,
        tni: Arc<TreeNodeInstance>,
        config: Option<&[u8]>,
    ) -> Result<Option<Arc<dyn ProtocolInstance>>>;

    /// Direct service-to-service messages outside any protocol tree.
    async fn process(&self, packet: Packet);
}
