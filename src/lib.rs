//! # Cothority Core
//!
//! Runtime for collective authorities: a roster of servers jointly running
//! tree-structured protocols and producing collectively signed statements.
//!
//! ## Layers
//! - **Transport** ([`transport`]): authenticated duplex connections over
//!   TCP, plus an in-process loopback for tests.
//! - **Router** ([`router`]): connection table, identity handshake, typed
//!   dispatch to registered processors, auto-dial on send.
//! - **Overlay** ([`overlay`]): rosters, deterministic binary trees, and
//!   per-node protocol instances exchanging typed messages along tree
//!   edges.
//! - **Services** ([`service`]): per-host singletons wired to client
//!   requests, able to spawn protocol instances on demand.
//! - **Timestamp** ([`timestamp`]): a batched timestamp authority built on
//!   all of the above.
//!
//! ## Example
//! ```ignore
//! use cothority::{Client, Server, TimestampService};
//!
//! TimestampService::register();
//! let server = Server::new(keypair, "/var/lib/cothority", Config::default());
//! server.start().await?;
//!
//! let client = Client::new(cothority::timestamp::SERVICE_NAME);
//! client.send(server.identity(), &request).await?;
//! ```

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod overlay;
pub mod protocols;
pub mod router;
pub mod server;
pub mod service;
pub mod testing;
pub mod timestamp;
pub mod transport;

pub use crate::core::{register_message, Body, Message, MessageTypeID, Packet};
pub use config::Config;
pub use error::{Error, Result};
pub use identity::{Address, Keypair, PublicId, ServerIdentity};
pub use overlay::{
    ProtocolInstance, Roster, RosterId, Token, Tree, TreeId, TreeNode, TreeNodeInstance,
};
pub use router::{Processor, Router};
pub use server::Server;
pub use service::{
    delete_new_service, register_new_service, registered_service_names, Client, ClientRequest,
    Context, Service, ServiceId, ServiceManager, ServiceProcessor,
};
pub use timestamp::TimestampService;
