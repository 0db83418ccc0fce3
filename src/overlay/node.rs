//! Per-node protocol instance handles.
//!
//! A [`TreeNodeInstance`] is one node's view of a running protocol: it
//! knows its position in the tree, sends enveloped messages to parent and
//! children, and hands inbound messages to typed channels or handlers
//! registered by the protocol implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::registry::{self, message_type_id, register_message, Body, Message, MessageTypeID};
use crate::error::{Error, Result};
use crate::identity::Keypair;
use crate::overlay::{Overlay, ProtocolEnvelope, Token, Tree, TreeNode};

type Binding = Box<dyn Fn(TreeNode, Body) + Send + Sync>;

/// Handle onto one node of a running protocol instance.
pub struct TreeNodeInstance {
    token: Token,
    tree: Arc<Tree>,
    node_index: usize,
    overlay: Weak<Overlay>,
    keypair: Arc<Keypair>,
    bindings: Mutex<HashMap<MessageTypeID, Binding>>,
    done: AtomicBool,
}

impl TreeNodeInstance {
    pub(crate) fn new(
        token: Token,
        tree: Arc<Tree>,
        node_index: usize,
        overlay: &Arc<Overlay>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            tree,
            node_index,
            overlay: Arc::downgrade(overlay),
            keypair: overlay.keypair().clone(),
            bindings: Mutex::new(HashMap::new()),
            done: AtomicBool::new(false),
        })
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// The tree node this instance occupies.
    pub fn tree_node(&self) -> TreeNode {
        self.tree.node(self.node_index).expect("own node in tree").clone()
    }

    pub fn parent(&self) -> Option<TreeNode> {
        let me = self.tree.node(self.node_index)?;
        me.parent.and_then(|p| self.tree.node(p)).cloned()
    }

    pub fn children(&self) -> Vec<TreeNode> {
        match self.tree.node(self.node_index) {
            Some(me) => me
                .children
                .iter()
                .filter_map(|&c| self.tree.node(c))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.node_index == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.tree
            .node(self.node_index)
            .map(|n| n.is_leaf())
            .unwrap_or(true)
    }

    /// The host's signing keypair, for protocols that produce signatures.
    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    /// Bind an unbounded typed channel: inbound messages of type `T` for
    /// this instance arrive on it, paired with the sending tree node, in
    /// per-sender send order. The channel stays drainable after
    /// [`TreeNodeInstance::done`].
    ///
    /// # Errors
    /// [`Error::DuplicateBinding`] when `T` is already bound on this
    /// instance.
    pub fn register_channel<T: Message>(&self) -> Result<mpsc::UnboundedReceiver<(TreeNode, T)>> {
        register_message::<T>();
        let (tx, rx) = mpsc::unbounded_channel();
        self.bind::<T>(Box::new(move |sender, body| match body.downcast::<T>() {
            Ok(msg) => {
                let _ = tx.send((sender, *msg));
            }
            Err(_) => warn!(msg_type = T::NAME, "delivery body of unexpected type"),
        }))?;
        Ok(rx)
    }

    /// Bind a synchronous callback instead of a channel.
    ///
    /// # Errors
    /// [`Error::DuplicateBinding`] when `T` is already bound.
    pub fn register_handler<T, F>(&self, handler: F) -> Result<()>
    where
        T: Message,
        F: Fn(TreeNode, T) + Send + Sync + 'static,
    {
        register_message::<T>();
        self.bind::<T>(Box::new(move |sender, body| match body.downcast::<T>() {
            Ok(msg) => handler(sender, *msg),
            Err(_) => warn!(msg_type = T::NAME, "delivery body of unexpected type"),
        }))
    }

    fn bind<T: Message>(&self, binding: Binding) -> Result<()> {
        let id = message_type_id::<T>();
        let mut bindings = self.bindings.lock().expect("binding table poisoned");
        if bindings.contains_key(&id) {
            return Err(Error::DuplicateBinding(T::NAME.to_string()));
        }
        bindings.insert(id, binding);
        Ok(())
    }

    /// Envelope `msg` with this instance's token and route it to the server
    /// occupying `to`. Sending to this host's own node delivers locally.
    pub async fn send_to<T: Message>(&self, to: &TreeNode, msg: &T) -> Result<()> {
        if self.done.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        register_message::<T>();
        let env = ProtocolEnvelope {
            token: self.token.clone(),
            from: self.node_index as u32,
            to: to.tree_index as u32,
            inner_type: message_type_id::<T>(),
            inner: registry::encode(msg)?,
        };
        let overlay = self.overlay.upgrade().ok_or(Error::Closed)?;
        let dst = self.tree.identity(to).clone();
        overlay.send_envelope(&dst, &env).await
    }

    /// Hand an inbound message to the matching binding. Deliveries after
    /// [`TreeNodeInstance::done`] are dropped.
    pub(crate) fn deliver(&self, sender: TreeNode, msg_type: MessageTypeID, body: Body) {
        if self.done.load(Ordering::Acquire) {
            debug!(token = %self.token, "delivery after done, dropping");
            return;
        }
        let bindings = self.bindings.lock().expect("binding table poisoned");
        match bindings.get(&msg_type) {
            Some(binding) => binding(sender, body),
            None => warn!(token = %self.token, msg_type = %msg_type, "no binding for message, dropping"),
        }
    }

    /// Mark this node's run complete: the token is released, queued
    /// envelopes for it are dropped, and bound channels end once drained.
    pub fn done(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the bindings drops the channel senders, so receivers
        // observe end-of-stream after draining what was delivered.
        self.bindings.lock().expect("binding table poisoned").clear();
        if let Some(overlay) = self.overlay.upgrade() {
            overlay.instance_done(&self.token);
        }
    }

    /// Whether [`TreeNodeInstance::done`] has been called.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TreeNodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeNodeInstance")
            .field("token", &self.token)
            .field("node_index", &self.node_index)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity::Address;
    use crate::overlay::Roster;
    use crate::router::Router;
    use crate::service::registry::service_id;
    use crate::transport::new_host;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        n: u32,
    }

    impl Message for Note {
        const NAME: &'static str = "test.node.Note";
    }

    fn single_node_instance(label: &str) -> Arc<TreeNodeInstance> {
        let keypair = Arc::new(Keypair::generate(Address::local(format!("node-{label}"))));
        let config = Config::default();
        let host = new_host(
            keypair.identity().address.clone(),
            config.dial_timeout,
            config.max_frame_size,
        );
        let router = Router::new(keypair.identity().clone(), host, config);
        let overlay = Overlay::new(router, keypair.clone());
        let tree = Arc::new(Roster::new(vec![keypair.identity().clone()]).generate_binary_tree());
        overlay.new_tree_node_instance(&tree, 0, "test", service_id("test"))
    }

    #[tokio::test]
    async fn duplicate_binding_rejected() {
        let tni = single_node_instance("dup");
        let _rx = tni.register_channel::<Note>().unwrap();
        assert!(matches!(
            tni.register_channel::<Note>(),
            Err(Error::DuplicateBinding(_))
        ));
    }

    #[tokio::test]
    async fn deliver_reaches_channel_until_done() {
        let tni = single_node_instance("deliver");
        let mut rx = tni.register_channel::<Note>().unwrap();
        let sender = tni.tree_node();

        tni.deliver(sender.clone(), message_type_id::<Note>(), Box::new(Note { n: 1 }));
        let (from, note) = rx.recv().await.unwrap();
        assert_eq!(from.tree_index, 0);
        assert_eq!(note, Note { n: 1 });

        tni.done();
        tni.deliver(sender, message_type_id::<Note>(), Box::new(Note { n: 2 }));
        // Dropped after done; channel ends once drained.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn handler_binding_is_invoked() {
        let tni = single_node_instance("handler");
        let (tx, mut rx) = mpsc::unbounded_channel();
        tni.register_handler::<Note, _>(move |_, note| {
            let _ = tx.send(note.n);
        })
        .unwrap();
        // A channel for the same type now collides with the handler.
        assert!(matches!(
            tni.register_channel::<Note>(),
            Err(Error::DuplicateBinding(_))
        ));
        tni.deliver(tni.tree_node(), message_type_id::<Note>(), Box::new(Note { n: 9 }));
        assert_eq!(rx.recv().await, Some(9));
    }

    #[tokio::test]
    async fn accessors_on_singleton_tree() {
        let tni = single_node_instance("acc");
        assert!(tni.is_root());
        assert!(tni.is_leaf());
        assert!(tni.parent().is_none());
        assert!(tni.children().is_empty());
    }
}
