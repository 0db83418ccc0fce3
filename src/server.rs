//! One cothority process: router, overlay and instantiated services.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::{Keypair, ServerIdentity};
use crate::overlay::Overlay;
use crate::router::Router;
use crate::service::ServiceManager;
use crate::transport::new_host;

/// A running (or startable) host: owns the router and overlay, and holds
/// the one instance of every service registered at construction time.
pub struct Server {
    keypair: Arc<Keypair>,
    router: Router,
    overlay: Arc<Overlay>,
    services: Arc<ServiceManager>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Build a server for `keypair`'s address; services get their data
    /// directories under `path`.
    pub fn new(keypair: Keypair, path: impl Into<PathBuf>, config: Config) -> Arc<Self> {
        let keypair = Arc::new(keypair);
        let host = new_host(
            keypair.identity().address.clone(),
            config.dial_timeout,
            config.max_frame_size,
        );
        let router = Router::new(keypair.identity().clone(), host, config);
        let overlay = Overlay::new(router.clone(), keypair.clone());
        let services = ServiceManager::new(router.clone(), &overlay, keypair.clone(), &path.into());
        Arc::new(Self {
            keypair,
            router,
            overlay,
            services,
            router_task: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &ServerIdentity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    /// Run the router in the background; returns once the listener is
    /// bound and accepting.
    pub async fn start(&self) -> Result<()> {
        let router = self.router.clone();
        let mut running = router.running();
        let task = tokio::spawn(async move {
            if let Err(e) = router.start().await {
                warn!(error = %e, "router exited with error");
            }
        });
        *self.router_task.lock().expect("router task lock poisoned") = Some(task);
        timeout(
            std::time::Duration::from_secs(5),
            running.wait_for(|ready| *ready),
        )
        .await
        .map_err(|_| Error::ProtocolFailed("router did not come up".into()))?
        .map_err(|_| Error::Closed)?;
        info!(id = %self.identity(), "server started");
        Ok(())
    }

    /// Stop the router and wait for it to wind down. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.router.stop().await?;
        let task = self.router_task.lock().expect("router task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("id", self.identity()).finish_non_exhaustive()
    }
}
