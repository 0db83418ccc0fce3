//! Per-service handle onto the host, plus the typed request dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::core::registry::{self, message_type_id, register_message, Body, Message, MessageTypeID};
use crate::error::{Error, Result};
use crate::identity::{Keypair, ServerIdentity};
use crate::overlay::{Overlay, ProtocolInstance, Tree, TreeNodeInstance};
use crate::router::{Processor, Router};
use crate::service::{ClientRequest, ServiceId};

/// What a service factory receives: the host surface a service is allowed
/// to touch. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    router: Router,
    overlay: Arc<Overlay>,
    service_id: ServiceId,
    service_name: String,
    keypair: Arc<Keypair>,
    path: PathBuf,
}

impl Context {
    pub(crate) fn new(
        router: Router,
        overlay: Arc<Overlay>,
        service_id: ServiceId,
        service_name: String,
        keypair: Arc<Keypair>,
        path: PathBuf,
    ) -> Self {
        Self {
            router,
            overlay,
            service_id,
            service_name,
            keypair,
            path,
        }
    }

    /// This host's identity.
    pub fn server_identity(&self) -> &ServerIdentity {
        self.keypair.identity()
    }

    /// This host's signing keypair.
    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    /// The id of the service this context belongs to.
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Directory reserved for this service's data.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the handle for a fresh protocol instance of this service at
    /// `node_index` of `tree`.
    pub fn new_tree_node_instance(
        &self,
        tree: &Arc<Tree>,
        node_index: usize,
        protocol: &str,
    ) -> Arc<TreeNodeInstance> {
        self.overlay
            .new_tree_node_instance(tree, node_index, protocol, self.service_id)
    }

    /// Make `pi` addressable by its token and run its dispatch task.
    pub fn register_protocol_instance(&self, pi: Arc<dyn ProtocolInstance>) -> Result<()> {
        self.overlay.register_protocol_instance(pi)
    }

    /// Route inbound messages of the listed types to `proc`.
    pub fn register_processor(&self, proc: Arc<dyn Processor>, types: &[MessageTypeID]) {
        self.router.register_processor(proc, types);
    }

    /// Router passthrough: send a bare registered message to a peer.
    pub async fn send_raw<T: Message>(&self, to: &ServerIdentity, msg: &T) -> Result<()> {
        register_message::<T>();
        self.router.send(to, msg).await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("service", &self.service_name)
            .field("id", &self.server_identity())
            .finish_non_exhaustive()
    }
}

type ReplyHandler =
    Box<dyn Fn(ServerIdentity, Body) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Typed request dispatcher for services.
///
/// A service embeds one of these and registers typed handlers; the
/// processor decodes the request out of [`ClientRequest::data`], runs the
/// handler, and serializes the return value back to the originating peer
/// as a reply packet.
pub struct ServiceProcessor {
    ctx: Context,
    handlers: RwLock<HashMap<MessageTypeID, ReplyHandler>>,
}

impl ServiceProcessor {
    pub fn new(ctx: Context) -> Self {
        register_message::<ClientRequest>();
        Self {
            ctx,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Register a typed handler: requests of type `Req` are decoded and
    /// passed in; the `Resp` return value is sent back to the requester.
    ///
    /// # Errors
    /// [`Error::DuplicateBinding`] when `Req` already has a handler.
    pub fn register_message<Req, Resp, F, Fut>(&self, handler: F) -> Result<()>
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerIdentity, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        register_message::<Req>();
        register_message::<Resp>();
        let ctx = self.ctx.clone();
        let handler = Arc::new(handler);
        let erased: ReplyHandler = Box::new(move |from, body| {
            let ctx = ctx.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let req = match body.downcast::<Req>() {
                    Ok(req) => *req,
                    Err(_) => {
                        warn!(msg_type = Req::NAME, "request body of unexpected type");
                        return;
                    }
                };
                match (*handler)(from.clone(), req).await {
                    Ok(resp) => {
                        if let Err(e) = ctx.send_raw(&from, &resp).await {
                            warn!(error = %e, "reply to client failed");
                        }
                    }
                    Err(e) => warn!(error = %e, msg_type = Req::NAME, "request handler failed"),
                }
            })
        });
        let id = message_type_id::<Req>();
        let mut handlers = self.handlers.write().expect("handler table poisoned");
        if handlers.contains_key(&id) {
            return Err(Error::DuplicateBinding(Req::NAME.to_string()));
        }
        handlers.insert(id, erased);
        Ok(())
    }

    /// Decode and dispatch one client request.
    pub async fn process_client_request(&self, from: &ServerIdentity, req: ClientRequest) {
        let (id, body) = match registry::unmarshal(&req.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "undecodable client request, dropping");
                return;
            }
        };
        let fut = {
            let handlers = self.handlers.read().expect("handler table poisoned");
            handlers.get(&id).map(|h| h(from.clone(), body))
        };
        match fut {
            Some(fut) => fut.await,
            None => warn!(msg_type = %id, "no handler for request type, dropping"),
        }
    }
}
