//! Collective signing over the tree.
//!
//! The root announces the message down the tree; every node signs it with
//! its host key; leaves answer immediately and every interior node waits
//! for all of its children before adding its own share and passing the
//! batch upward. The root assembles the full [`CollectiveSignature`] and
//! fires the registered signature hook.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::debug;

use crate::core::registry::Message;
use crate::crypto::{CollectiveSignature, SignatureShare};
use crate::error::{Error, Result};
use crate::overlay::{ProtocolInstance, TreeNode, TreeNodeInstance};

/// Name this protocol registers its instances under.
pub const PROTOCOL_NAME: &str = "cosign";

/// Root-to-leaves: the message everyone is asked to sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    #[serde(with = "crate::core::serialization::bytes")]
    pub message: Vec<u8>,
}

impl Message for Announce {
    const NAME: &'static str = "protocol.cosign.Announce";
}

/// Leaves-to-root: the signature shares of a whole subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(with = "crate::core::serialization::seq")]
    pub shares: Vec<SignatureShare>,
}

impl Message for Response {
    const NAME: &'static str = "protocol.cosign.Response";
}

/// One node's run of the collective-signing protocol.
pub struct Cosign {
    tni: Arc<TreeNodeInstance>,
    message: Mutex<Option<Vec<u8>>>,
    announce_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<(TreeNode, Announce)>>>,
    response_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<(TreeNode, Response)>>>,
    hook: Mutex<Option<oneshot::Sender<CollectiveSignature>>>,
}

impl Cosign {
    /// Participant-side constructor; the message arrives with the announce.
    pub fn new(tni: Arc<TreeNodeInstance>) -> Result<Arc<Self>> {
        let announce_rx = tni.register_channel::<Announce>()?;
        let response_rx = tni.register_channel::<Response>()?;
        Ok(Arc::new(Self {
            tni,
            message: Mutex::new(None),
            announce_rx: AsyncMutex::new(Some(announce_rx)),
            response_rx: AsyncMutex::new(Some(response_rx)),
            hook: Mutex::new(None),
        }))
    }

    /// Root-side constructor: fixes the message to sign and returns the
    /// completion hook alongside the instance.
    pub fn new_root(
        tni: Arc<TreeNodeInstance>,
        message: Vec<u8>,
    ) -> Result<(Arc<Self>, oneshot::Receiver<CollectiveSignature>)> {
        let pi = Self::new(tni)?;
        *pi.message.lock().expect("message lock poisoned") = Some(message);
        let (tx, rx) = oneshot::channel();
        *pi.hook.lock().expect("hook lock poisoned") = Some(tx);
        Ok((pi, rx))
    }

    fn own_share(&self, message: &[u8]) -> SignatureShare {
        SignatureShare {
            index: self.tni.tree_node().roster_index as u32,
            signature: self.tni.keypair().sign(message),
        }
    }

    fn fire_hook(&self, signature: CollectiveSignature) {
        if let Some(hook) = self.hook.lock().expect("hook lock poisoned").take() {
            let _ = hook.send(signature);
        }
    }
}

#[async_trait]
impl ProtocolInstance for Cosign {
    fn node(&self) -> Arc<TreeNodeInstance> {
        self.tni.clone()
    }

    /// Root-only: push the announce to the children. A singleton tree has
    /// nothing to announce; dispatch completes it on its own.
    async fn start(&self) -> Result<()> {
        let message = self
            .message
            .lock()
            .expect("message lock poisoned")
            .clone()
            .ok_or_else(|| Error::ProtocolFailed("started without a message to sign".into()))?;
        for child in self.tni.children() {
            self.tni.send_to(&child, &Announce { message: message.clone() }).await?;
        }
        Ok(())
    }

    async fn dispatch(&self) -> Result<()> {
        let mut announce_rx = self
            .announce_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::ProtocolFailed("dispatch already ran".into()))?;
        let mut response_rx = self
            .response_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::ProtocolFailed("dispatch already ran".into()))?;
        let children = self.tni.children();

        // Non-root nodes learn the message from the announce and pass it
        // down; the root fixed it at construction.
        let message = {
            let preset = self.message.lock().expect("message lock poisoned").clone();
            match preset {
                Some(message) => message,
                None => {
                    let Some((_, announce)) = announce_rx.recv().await else {
                        return Ok(());
                    };
                    let message = announce.message;
                    *self.message.lock().expect("message lock poisoned") = Some(message.clone());
                    for child in &children {
                        self.tni
                            .send_to(child, &Announce { message: message.clone() })
                            .await?;
                    }
                    message
                }
            }
        };

        if children.is_empty() && !self.tni.is_root() {
            // Leaf: answer upward and finish.
            let parent = self
                .tni
                .parent()
                .ok_or_else(|| Error::ProtocolFailed("non-root node without parent".into()))?;
            let share = self.own_share(&message);
            self.tni.send_to(&parent, &Response { shares: vec![share] }).await?;
            self.tni.done();
            return Ok(());
        }

        let mut shares = Vec::new();
        let mut responded = 0usize;
        while responded < children.len() {
            let Some((from, response)) = response_rx.recv().await else {
                return Err(Error::ProtocolFailed(
                    "signing tree collapsed before completion".into(),
                ));
            };
            debug!(from = from.tree_index, shares = response.shares.len(), "subtree responded");
            shares.extend(response.shares);
            responded += 1;
        }
        shares.push(self.own_share(&message));

        if self.tni.is_root() {
            self.fire_hook(CollectiveSignature::new(shares));
        } else {
            let parent = self
                .tni
                .parent()
                .ok_or_else(|| Error::ProtocolFailed("non-root node without parent".into()))?;
            self.tni.send_to(&parent, &Response { shares }).await?;
        }
        self.tni.done();
        Ok(())
    }
}
