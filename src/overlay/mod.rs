//! # Overlay
//!
//! The tree-protocol engine: rosters, derived trees, protocol tokens, and
//! the per-node instance handles that exchange typed messages along tree
//! edges.
//!
//! The overlay owns the table of live protocol instances, keyed by
//! [`Token`]. An envelope arriving for an unknown token is either spawned
//! on demand through the owning service's `new_protocol`, or dropped when
//! the instance already finished. Envelopes for trees this host has not
//! seen yet are parked while the tree is fetched from the sender.

pub mod node;
pub mod roster;
pub mod token;
pub mod tree;

pub use node::TreeNodeInstance;
pub use roster::{Roster, RosterId};
pub use token::{InstanceId, Token};
pub use tree::{Tree, TreeId, TreeNode, TreeNodeId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, warn};

use crate::core::registry::{self, register_message, Message, MessageTypeID};
use crate::core::Packet;
use crate::error::{Error, Result};
use crate::identity::{Keypair, ServerIdentity};
use crate::router::{Processor, Router};
use crate::service::manager::ServiceManager;
use crate::service::ServiceId;

/// A live execution of a named protocol at one node of a tree.
///
/// `start` is the root-only entry point; `dispatch` is the long-running
/// logic, returning once the node is locally done.
#[async_trait]
pub trait ProtocolInstance: Send + Sync + 'static {
    /// The node handle this instance runs on.
    fn node(&self) -> Arc<TreeNodeInstance>;

    /// Root-only: initiate the protocol.
    async fn start(&self) -> Result<()>;

    /// Run until this node has played its part.
    async fn dispatch(&self) -> Result<()>;
}

/// Envelope wrapping every intra-protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEnvelope {
    pub token: Token,
    /// Tree index of the sending node.
    pub from: u32,
    /// Tree index of the destination node.
    pub to: u32,
    pub inner_type: MessageTypeID,
    #[serde(with = "crate::core::serialization::bytes")]
    pub inner: Vec<u8>,
}

impl Message for ProtocolEnvelope {
    const NAME: &'static str = "overlay.ProtocolEnvelope";
}

/// Ask the sender of an envelope for the tree it referenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TreeRequest {
    pub tree_id: TreeId,
}

impl Message for TreeRequest {
    const NAME: &'static str = "overlay.TreeRequest";
}

/// Answer to a [`TreeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TreeReply {
    pub tree: Tree,
}

impl Message for TreeReply {
    const NAME: &'static str = "overlay.TreeReply";
}

struct ActiveInstance {
    tni: Arc<TreeNodeInstance>,
    /// Keeps the protocol implementation alive while registered.
    _protocol: Arc<dyn ProtocolInstance>,
}

/// Per-host protocol engine.
pub struct Overlay {
    router: Router,
    keypair: Arc<Keypair>,
    instances: Mutex<HashMap<Token, ActiveInstance>>,
    /// Tokens of finished instances; late envelopes for them are dropped
    /// instead of respawned.
    finished: Mutex<HashSet<Token>>,
    trees: Mutex<HashMap<TreeId, Arc<Tree>>>,
    pending: Mutex<HashMap<TreeId, Vec<(ServerIdentity, ProtocolEnvelope)>>>,
    services: OnceLock<Weak<ServiceManager>>,
    self_ref: Weak<Overlay>,
}

impl Overlay {
    pub fn new(router: Router, keypair: Arc<Keypair>) -> Arc<Self> {
        register_message::<ProtocolEnvelope>();
        register_message::<TreeRequest>();
        register_message::<TreeReply>();
        let overlay = Arc::new_cyclic(|self_ref| Self {
            router: router.clone(),
            keypair,
            instances: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
            trees: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            services: OnceLock::new(),
            self_ref: self_ref.clone(),
        });
        router.register_processor(
            Arc::new(OverlayProcessor(overlay.clone())),
            &[
                registry::message_type_id::<ProtocolEnvelope>(),
                registry::message_type_id::<TreeRequest>(),
                registry::message_type_id::<TreeReply>(),
            ],
        );
        overlay
    }

    /// Wire in the service manager that answers spawn-on-demand lookups.
    pub(crate) fn set_services(&self, services: Weak<ServiceManager>) {
        let _ = self.services.set(services);
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    /// Make `tree` known to this host, so envelopes referencing it need no
    /// fetch round-trip.
    pub fn add_tree(&self, tree: Arc<Tree>) {
        self.trees.lock().expect("tree table poisoned").insert(tree.id(), tree);
    }

    pub fn tree(&self, id: TreeId) -> Option<Arc<Tree>> {
        self.trees.lock().expect("tree table poisoned").get(&id).cloned()
    }

    fn arc(&self) -> Arc<Overlay> {
        self.self_ref.upgrade().expect("overlay alive while referenced")
    }

    /// Create the root-side handle for a fresh protocol instance.
    pub fn new_tree_node_instance(
        &self,
        tree: &Arc<Tree>,
        node_index: usize,
        protocol: &str,
        service: ServiceId,
    ) -> Arc<TreeNodeInstance> {
        self.add_tree(tree.clone());
        let token = Token {
            roster_id: tree.roster().id(),
            tree_id: tree.id(),
            service,
            protocol: protocol.to_string(),
            instance: InstanceId::random(),
        };
        TreeNodeInstance::new(token, tree.clone(), node_index, &self.arc())
    }

    fn instance_for_token(
        &self,
        token: &Token,
        tree: &Arc<Tree>,
        node_index: usize,
    ) -> Arc<TreeNodeInstance> {
        TreeNodeInstance::new(token.clone(), tree.clone(), node_index, &self.arc())
    }

    /// Make `pi` addressable by its token and run its dispatch task.
    ///
    /// # Errors
    /// [`Error::ProtocolFailed`] when the token is already taken or the
    /// instance already finished.
    pub fn register_protocol_instance(&self, pi: Arc<dyn ProtocolInstance>) -> Result<()> {
        let tni = pi.node();
        let token = tni.token().clone();
        if self.finished.lock().expect("finished set poisoned").contains(&token) {
            return Err(Error::ProtocolFailed(format!("instance {token} already finished")));
        }
        {
            let mut instances = self.instances.lock().expect("instance table poisoned");
            if instances.contains_key(&token) {
                return Err(Error::ProtocolFailed(format!("token {token} already in use")));
            }
            instances.insert(
                token.clone(),
                ActiveInstance {
                    tni,
                    _protocol: pi.clone(),
                },
            );
        }
        debug!(token = %token, "protocol instance registered");
        tokio::spawn(async move {
            if let Err(e) = pi.dispatch().await {
                warn!(error = %e, "protocol dispatch failed");
            }
        });
        Ok(())
    }

    /// Called by [`TreeNodeInstance::done`]: release the token and drop any
    /// further envelopes addressed to it.
    pub(crate) fn instance_done(&self, token: &Token) {
        self.instances.lock().expect("instance table poisoned").remove(token);
        self.finished.lock().expect("finished set poisoned").insert(token.clone());
        debug!(token = %token, "protocol instance done");
    }

    pub(crate) async fn send_envelope(
        &self,
        dst: &ServerIdentity,
        env: &ProtocolEnvelope,
    ) -> Result<()> {
        self.router.send(dst, env).await
    }

    async fn handle_envelope(&self, from: ServerIdentity, env: ProtocolEnvelope) {
        let Some(tree) = self.tree(env.token.tree_id) else {
            debug!(tree = %env.token.tree_id, "unknown tree, fetching from sender");
            let tree_id = env.token.tree_id;
            self.pending
                .lock()
                .expect("pending queue poisoned")
                .entry(tree_id)
                .or_default()
                .push((from.clone(), env));
            if let Err(e) = self.router.send(&from, &TreeRequest { tree_id }).await {
                warn!(error = %e, "tree request failed");
            }
            return;
        };

        let Some(dst_node) = tree.node(env.to as usize) else {
            warn!(to = env.to, "envelope addressed outside the tree, dropping");
            return;
        };
        if tree.identity(dst_node).public != self.keypair.identity().public {
            warn!(to = env.to, "envelope for a node this host does not occupy, dropping");
            return;
        }
        let Some(sender_node) = tree.node(env.from as usize).cloned() else {
            warn!(from = env.from, "envelope sent from outside the tree, dropping");
            return;
        };
        let node_index = dst_node.tree_index;

        if self.finished.lock().expect("finished set poisoned").contains(&env.token) {
            debug!(token = %env.token, "envelope for finished instance, dropping");
            return;
        }
        let existing = {
            let instances = self.instances.lock().expect("instance table poisoned");
            instances.get(&env.token).map(|i| i.tni.clone())
        };
        let tni = match existing {
            Some(tni) => tni,
            None => match self.spawn_on_demand(&env.token, &tree, node_index).await {
                Some(tni) => tni,
                None => return,
            },
        };

        match registry::decode(env.inner_type, &env.inner) {
            Ok(body) => tni.deliver(sender_node, env.inner_type, body),
            Err(e) => warn!(error = %e, "undecodable protocol message, dropping"),
        }
    }

    /// Ask the service named in the token for a fresh instance; `None`
    /// means the service declined participation and the envelope is dropped
    /// silently.
    async fn spawn_on_demand(
        &self,
        token: &Token,
        tree: &Arc<Tree>,
        node_index: usize,
    ) -> Option<Arc<TreeNodeInstance>> {
        let manager = self.services.get().and_then(Weak::upgrade)?;
        let Some(service) = manager.service_by_id(token.service) else {
            warn!(service = %token.service, "envelope names an unknown service, dropping");
            return None;
        };
        let tni = self.instance_for_token(token, tree, node_index);
        match service.new_protocol(tni.clone(), None).await {
            Ok(Some(pi)) => match self.register_protocol_instance(pi) {
                Ok(()) => Some(tni),
                Err(_) => {
                    // Lost a race against a concurrent spawn; deliver there.
                    let instances = self.instances.lock().expect("instance table poisoned");
                    instances.get(token).map(|i| i.tni.clone())
                }
            },
            Ok(None) => {
                debug!(token = %token, "service declined instance, dropping envelope");
                None
            }
            Err(e) => {
                warn!(token = %token, error = %e, "new_protocol failed");
                None
            }
        }
    }
}

/// Adapter registering the overlay as the router-side processor for
/// protocol traffic.
struct OverlayProcessor(Arc<Overlay>);

#[async_trait]
impl Processor for OverlayProcessor {
    async fn process(&self, packet: Packet) {
        let this = &self.0;
        let from = packet.from.clone();
        if packet.is::<ProtocolEnvelope>() {
            match packet.take::<ProtocolEnvelope>() {
                Ok(env) => this.handle_envelope(from, env).await,
                Err(e) => warn!(error = %e, "bad protocol envelope"),
            }
        } else if packet.is::<TreeRequest>() {
            let Ok(req) = packet.take::<TreeRequest>() else { return };
            let Some(tree) = this.tree(req.tree_id) else {
                debug!(tree = %req.tree_id, "tree requested but unknown here");
                return;
            };
            if let Err(e) = this.router.send(&from, &TreeReply { tree: (*tree).clone() }).await {
                warn!(error = %e, "tree reply failed");
            }
        } else if packet.is::<TreeReply>() {
            let Ok(reply) = packet.take::<TreeReply>() else { return };
            // Only binary trees are derived here; rebuild and compare so a
            // peer cannot plant a tree whose id does not match its content.
            let rebuilt = Tree::new_binary(reply.tree.roster().clone());
            if rebuilt.id() != reply.tree.id() {
                warn!(tree = %reply.tree.id(), "tree reply fails verification, dropping");
                return;
            }
            let tree = Arc::new(reply.tree);
            this.add_tree(tree.clone());
            let parked = this
                .pending
                .lock()
                .expect("pending queue poisoned")
                .remove(&tree.id())
                .unwrap_or_default();
            for (sender, env) in parked {
                this.handle_envelope(sender, env).await;
            }
        } else {
            warn!(msg_type = %packet.msg_type, "overlay received unexpected packet type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity::{Address, Keypair};
    use crate::service::registry::service_id;
    use crate::transport::new_host;

    struct IdleProtocol {
        tni: Arc<TreeNodeInstance>,
    }

    #[async_trait]
    impl ProtocolInstance for IdleProtocol {
        fn node(&self) -> Arc<TreeNodeInstance> {
            self.tni.clone()
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn dispatch(&self) -> Result<()> {
            Ok(())
        }
    }

    fn new_overlay(label: &str) -> Arc<Overlay> {
        let keypair = Arc::new(Keypair::generate(Address::local(format!("overlay-{label}"))));
        let config = Config::default();
        let host = new_host(
            keypair.identity().address.clone(),
            config.dial_timeout,
            config.max_frame_size,
        );
        let router = Router::new(keypair.identity().clone(), host, config);
        Overlay::new(router, keypair)
    }

    fn singleton_tree(overlay: &Overlay) -> Arc<Tree> {
        Arc::new(Roster::new(vec![overlay.keypair().identity().clone()]).generate_binary_tree())
    }

    #[tokio::test]
    async fn duplicate_token_registration_fails() {
        let overlay = new_overlay("dup-token");
        let tree = singleton_tree(&overlay);
        let tni = overlay.new_tree_node_instance(&tree, 0, "idle", service_id("idle"));
        overlay
            .register_protocol_instance(Arc::new(IdleProtocol { tni: tni.clone() }))
            .unwrap();
        let err = overlay
            .register_protocol_instance(Arc::new(IdleProtocol { tni }))
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolFailed(_)));
    }

    #[tokio::test]
    async fn finished_tokens_stay_released() {
        let overlay = new_overlay("tombstone");
        let tree = singleton_tree(&overlay);
        let tni = overlay.new_tree_node_instance(&tree, 0, "idle", service_id("idle"));
        overlay
            .register_protocol_instance(Arc::new(IdleProtocol { tni: tni.clone() }))
            .unwrap();
        tni.done();
        // Gone from the live table, and the token cannot come back.
        let err = overlay
            .register_protocol_instance(Arc::new(IdleProtocol { tni }))
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolFailed(_)));
    }

    #[tokio::test]
    async fn instance_creation_registers_its_tree() {
        let overlay = new_overlay("tree-reg");
        let tree = singleton_tree(&overlay);
        assert!(overlay.tree(tree.id()).is_none());
        let _tni = overlay.new_tree_node_instance(&tree, 0, "idle", service_id("idle"));
        assert!(overlay.tree(tree.id()).is_some());
    }
}
