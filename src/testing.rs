//! In-process test harness.
//!
//! Spins up N servers over the local transport, derives their roster and
//! binary tree, and tears everything down afterwards. Mirrors what the
//! integration tests need without binding sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::identity::{Address, Keypair};
use crate::overlay::{Roster, Tree};
use crate::server::Server;

static NEXT_HARNESS: AtomicU64 = AtomicU64::new(0);

/// A set of running in-process servers sharing one roster.
pub struct LocalSet {
    servers: Vec<Arc<Server>>,
    roster: Roster,
}

impl LocalSet {
    /// Start `n` servers on fresh local addresses with default config.
    pub async fn new(n: usize) -> Self {
        Self::with_config(n, Config::default()).await
    }

    /// Start `n` servers on fresh local addresses.
    pub async fn with_config(n: usize, config: Config) -> Self {
        Self::with_keypairs(Self::fresh_keypairs(n), config).await
    }

    /// Generate `n` keypairs on fresh local addresses, for callers that
    /// need the roster before the servers exist (e.g. to register a
    /// service parameterized by it).
    pub fn fresh_keypairs(n: usize) -> Vec<Keypair> {
        let harness = NEXT_HARNESS.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| Keypair::generate(Address::local(format!("harness-{harness}-{i}"))))
            .collect()
    }

    /// Start one server per keypair.
    pub async fn with_keypairs(keypairs: Vec<Keypair>, config: Config) -> Self {
        let harness = NEXT_HARNESS.fetch_add(1, Ordering::Relaxed);
        let mut servers = Vec::with_capacity(keypairs.len());
        for (i, keypair) in keypairs.into_iter().enumerate() {
            let server = Server::new(
                keypair,
                format!("/tmp/cothority-test-{harness}-{i}"),
                config.clone(),
            );
            server.start().await.expect("server start");
            servers.push(server);
        }
        let roster = Roster::new(servers.iter().map(|s| s.identity().clone()).collect());
        Self { servers, roster }
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn server(&self, i: usize) -> &Arc<Server> {
        &self.servers[i]
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The roster's derived binary tree.
    pub fn tree(&self) -> Arc<Tree> {
        Arc::new(self.roster.generate_binary_tree())
    }

    /// Stop every server.
    pub async fn close_all(&self) {
        for server in &self.servers {
            let _ = server.stop().await;
        }
    }
}
