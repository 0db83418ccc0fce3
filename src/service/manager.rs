//! Per-host service instantiation and client-request routing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::registry::{message_type_id, register_message};
use crate::core::Packet;
use crate::identity::Keypair;
use crate::overlay::Overlay;
use crate::router::{Processor, Router};
use crate::service::registry::{self, service_id, ServiceId};
use crate::service::{ClientRequest, Context, Service};

/// Holds the one instance of every registered service on this host and
/// routes [`ClientRequest`]s to them by service id.
pub struct ServiceManager {
    services: HashMap<ServiceId, (String, Arc<dyn Service>)>,
}

impl ServiceManager {
    /// Snapshot the process-wide registry and instantiate every service.
    pub fn new(
        router: Router,
        overlay: &Arc<Overlay>,
        keypair: Arc<Keypair>,
        path: &Path,
    ) -> Arc<Self> {
        register_message::<ClientRequest>();
        let mut services = HashMap::new();
        for (name, factory) in registry::snapshot() {
            let sid = service_id(&name);
            let service_path = path.join(&name);
            let ctx = Context::new(
                router.clone(),
                overlay.clone(),
                sid,
                name.clone(),
                keypair.clone(),
                service_path.clone(),
            );
            debug!(service = %name, "instantiating service");
            let service = factory(ctx, &service_path);
            services.insert(sid, (name, service));
        }
        let manager = Arc::new(Self { services });
        router.register_processor(manager.clone(), &[message_type_id::<ClientRequest>()]);
        overlay.set_services(Arc::downgrade(&manager));
        manager
    }

    pub fn service_by_id(&self, id: ServiceId) -> Option<Arc<dyn Service>> {
        self.services.get(&id).map(|(_, s)| s.clone())
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.service_by_id(service_id(name))
    }

    /// Names of the services running on this host.
    pub fn names(&self) -> Vec<String> {
        self.services.values().map(|(name, _)| name.clone()).collect()
    }
}

#[async_trait]
impl Processor for ServiceManager {
    async fn process(&self, packet: Packet) {
        let from = packet.from.clone();
        let req = match packet.take::<ClientRequest>() {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "service manager received non-request packet");
                return;
            }
        };
        match self.service_by_id(req.service) {
            Some(service) => service.process_client_request(&from, req).await,
            None => warn!(service = %req.service, "request for unknown service, dropping"),
        }
    }
}
