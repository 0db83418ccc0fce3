//! # Timestamp Service
//!
//! A batched timestamp authority. Clients submit statements; the service
//! pools them for one epoch, builds a Merkle tree over the batch, has the
//! roster collectively sign `root ‖ varint(epoch-time)`, and vends
//! per-statement inclusion proofs.
//!
//! The immediate [`SignatureRequest`] reply is fire-and-forget: it carries
//! the signature of the *previous* completed epoch and no proof for the
//! statement just submitted. Clients poll [`FetchProofRequest`] with the
//! same statement after the next epoch to obtain its proof.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::config::{GroupToml, DEFAULT_EPOCH_DURATION, DEFAULT_SIGNATURE_DEADLINE};
use crate::core::registry::Message;
use crate::core::Packet;
use crate::crypto::merkle::{hash_leaf, proof_tree, HashId, Proof};
use crate::crypto::{put_varint, CollectiveSignature};
use crate::error::Result;
use crate::identity::ServerIdentity;
use crate::overlay::{ProtocolInstance, Roster, TreeNodeInstance};
use crate::protocols::cosign::{Cosign, PROTOCOL_NAME};
use crate::service::{register_new_service, ClientRequest, Context, Service, ServiceProcessor};

/// Name this service registers under.
pub const SERVICE_NAME: &str = "Timestamp";

/// Roster group file expected in the service's data directory.
pub const GROUP_FILE: &str = "group.toml";

/// Client statement submission. The message should be a hashed nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRequest {
    #[serde(with = "crate::core::serialization::bytes")]
    pub message: Vec<u8>,
}

impl Message for SignatureRequest {
    const NAME: &'static str = "timestamp.SignatureRequest";
}

/// Immediate answer to a [`SignatureRequest`]: the previous epoch's
/// signature and epoch time; no proof for the statement just pooled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureResponse {
    pub timestamp: i64,
    pub proof: Option<Proof>,
    pub signature: Option<CollectiveSignature>,
}

impl Message for SignatureResponse {
    const NAME: &'static str = "timestamp.SignatureResponse";
}

/// Look up the inclusion proof of a statement batched in the last
/// completed epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchProofRequest {
    #[serde(with = "crate::core::serialization::bytes")]
    pub message: Vec<u8>,
}

impl Message for FetchProofRequest {
    const NAME: &'static str = "timestamp.FetchProofRequest";
}

/// Answer to [`FetchProofRequest`]. All fields are present iff the
/// statement was part of the last completed epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchProofResponse {
    pub timestamp: i64,
    pub root: Option<HashId>,
    pub proof: Option<Proof>,
    pub signature: Option<CollectiveSignature>,
}

impl Message for FetchProofResponse {
    const NAME: &'static str = "timestamp.FetchProofResponse";
}

/// Mutex-guarded ordered pool of statements awaiting the next epoch.
#[derive(Default)]
pub struct RequestPool {
    data: Mutex<Vec<Vec<u8>>>,
}

impl RequestPool {
    /// Append one statement.
    pub fn add(&self, data: Vec<u8>) {
        self.data.lock().expect("pool poisoned").push(data);
    }

    /// Snapshot the pooled statements without clearing.
    pub fn get_data(&self) -> Vec<Vec<u8>> {
        self.data.lock().expect("pool poisoned").clone()
    }

    /// Atomically snapshot and clear, yielding the batch.
    pub fn reset(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.data.lock().expect("pool poisoned"))
    }
}

/// Everything one completed epoch left behind.
struct EpochRecord {
    timestamp: i64,
    root: HashId,
    leaves: Vec<HashId>,
    proofs: Vec<Proof>,
    signature: CollectiveSignature,
}

struct TimestampState {
    ctx: Context,
    epoch_duration: Duration,
    signature_deadline: Duration,
    roster: Roster,
    pool: RequestPool,
    current: RwLock<Option<EpochRecord>>,
}

/// The batched timestamp authority, one instance per host.
pub struct TimestampService {
    processor: ServiceProcessor,
    state: Option<Arc<TimestampState>>,
}

impl TimestampService {
    /// Register under [`SERVICE_NAME`] with default epoch parameters; the
    /// roster is read from `group.toml` under the service path.
    pub fn register() {
        Self::register_with(DEFAULT_EPOCH_DURATION, DEFAULT_SIGNATURE_DEADLINE, None);
    }

    /// Register with explicit epoch parameters and, optionally, an
    /// explicit roster instead of the group file.
    pub fn register_with(
        epoch_duration: Duration,
        signature_deadline: Duration,
        roster: Option<Roster>,
    ) {
        register_new_service(SERVICE_NAME, move |ctx, path| {
            Arc::new(Self::new(
                ctx,
                path,
                epoch_duration,
                signature_deadline,
                roster.clone(),
            )) as Arc<dyn Service>
        });
    }

    fn new(
        ctx: Context,
        path: &Path,
        epoch_duration: Duration,
        signature_deadline: Duration,
        roster: Option<Roster>,
    ) -> Self {
        let processor = ServiceProcessor::new(ctx.clone());
        let roster = roster.or_else(|| match GroupToml::from_file(path.join(GROUP_FILE)) {
            Ok(group) => group.roster().ok(),
            Err(e) => {
                warn!(error = %e, "no usable roster for timestamp service");
                None
            }
        });
        let Some(roster) = roster else {
            // No roster, no epochs; requests still pool but never sign.
            return Self { processor, state: None };
        };

        let state = Arc::new(TimestampState {
            ctx: ctx.clone(),
            epoch_duration,
            signature_deadline,
            roster,
            pool: RequestPool::default(),
            current: RwLock::new(None),
        });
        let service = Self {
            processor,
            state: Some(state.clone()),
        };
        service.register_handlers(&state);

        // Only the roster's first member roots the signing tree; the
        // others take part through spawn-on-demand.
        let is_signing_root = state
            .roster
            .get(0)
            .map(|root| root.public == ctx.server_identity().public)
            .unwrap_or(false);
        if is_signing_root {
            tokio::spawn(run_loop(Arc::downgrade(&state)));
        } else {
            debug!("not the signing root; epoch loop not started");
        }
        service
    }

    /// The roster this instance signs with, if one was configured.
    pub fn roster(&self) -> Option<&Roster> {
        self.state.as_ref().map(|s| &s.roster)
    }

    fn register_handlers(&self, state: &Arc<TimestampState>) {
        let pool_state = state.clone();
        if let Err(e) = self.processor.register_message(
            move |_from: ServerIdentity, req: SignatureRequest| {
                let state = pool_state.clone();
                async move {
                    state.pool.add(req.message);
                    let current = state.current.read().expect("epoch record poisoned");
                    Ok(match current.as_ref() {
                        Some(record) => SignatureResponse {
                            timestamp: record.timestamp,
                            proof: None,
                            signature: Some(record.signature.clone()),
                        },
                        None => SignatureResponse {
                            timestamp: 0,
                            proof: None,
                            signature: None,
                        },
                    })
                }
            },
        ) {
            warn!(error = %e, "signature request handler registration failed");
        }

        let fetch_state = state.clone();
        if let Err(e) = self.processor.register_message(
            move |_from: ServerIdentity, req: FetchProofRequest| {
                let state = fetch_state.clone();
                async move {
                    let leaf = hash_leaf(&req.message);
                    let current = state.current.read().expect("epoch record poisoned");
                    let found = current.as_ref().and_then(|record| {
                        record
                            .leaves
                            .iter()
                            .position(|l| *l == leaf)
                            .map(|i| (record, i))
                    });
                    Ok(match found {
                        Some((record, i)) => FetchProofResponse {
                            timestamp: record.timestamp,
                            root: Some(record.root),
                            proof: Some(record.proofs[i].clone()),
                            signature: Some(record.signature.clone()),
                        },
                        None => FetchProofResponse {
                            timestamp: 0,
                            root: None,
                            proof: None,
                            signature: None,
                        },
                    })
                }
            },
        ) {
            warn!(error = %e, "fetch proof handler registration failed");
        }
    }
}

#[async_trait]
impl Service for TimestampService {
    async fn process_client_request(&self, from: &ServerIdentity, req: ClientRequest) {
        self.processor.process_client_request(from, req).await;
    }

    async fn new_protocol(
        &self,
        tni: Arc<TreeNodeInstance>,
        _config: Option<&[u8]>,
    ) -> Result<Option<Arc<dyn ProtocolInstance>>> {
        debug!("timestamp service spawning cosign participant");
        let pi = Cosign::new(tni)?;
        Ok(Some(pi as Arc<dyn ProtocolInstance>))
    }

    async fn process(&self, packet: Packet) {
        debug!(msg_type = %packet.msg_type, "timestamp service ignoring direct message");
    }
}

/// The epoch loop of the signing root.
async fn run_loop(state: Weak<TimestampState>) {
    let Some(initial) = state.upgrade() else { return };
    let mut interval = tokio::time::interval(initial.epoch_duration);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    drop(initial);

    loop {
        interval.tick().await;
        let Some(state) = state.upgrade() else { return };
        let batch = state.pool.reset();
        if batch.is_empty() {
            continue;
        }
        if let Err(e) = run_epoch(&state, batch).await {
            warn!(error = %e, "epoch failed, keeping previous signature");
        }
    }
}

async fn run_epoch(state: &Arc<TimestampState>, batch: Vec<Vec<u8>>) -> Result<()> {
    let (root, proofs) = proof_tree(&batch);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut message = root.to_vec();
    message.extend(put_varint(now));

    let tree = Arc::new(state.roster.generate_binary_tree());
    let tni = state.ctx.new_tree_node_instance(&tree, 0, PROTOCOL_NAME);
    let (pi, signature_rx) = Cosign::new_root(tni, message)?;
    state.ctx.register_protocol_instance(pi.clone())?;
    tokio::spawn(async move {
        if let Err(e) = pi.start().await {
            warn!(error = %e, "cosign start failed");
        }
    });

    let signature = timeout(state.signature_deadline, signature_rx)
        .await
        .map_err(|_| crate::error::Error::ProtocolFailed("signature deadline exceeded".into()))?
        .map_err(|_| crate::error::Error::ProtocolFailed("signing protocol aborted".into()))?;

    info!(batch = batch.len(), timestamp = now, "epoch signed");
    let record = EpochRecord {
        timestamp: now,
        root,
        leaves: batch.iter().map(|m| hash_leaf(m)).collect(),
        proofs,
        signature,
    };
    *state.current.write().expect("epoch record poisoned") = Some(record);
    Ok(())
}

/// Client-side verification of a fetched proof: the proof must connect the
/// statement to the response's root, and the collective signature must
/// cover `root ‖ varint(timestamp)` for the given roster.
pub fn verify_response(roster: &Roster, message: &[u8], resp: &FetchProofResponse) -> bool {
    let (Some(root), Some(proof), Some(signature)) = (&resp.root, &resp.proof, &resp.signature)
    else {
        return false;
    };
    if proof.root_from(hash_leaf(message)) != *root {
        return false;
    }
    let mut signed = root.to_vec();
    signed.extend(put_varint(resp.timestamp));
    signature.verify(roster, &signed)
}
