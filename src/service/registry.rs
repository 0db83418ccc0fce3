//! Process-wide service registry.
//!
//! Factories register before any host starts; a starting host snapshots
//! the table, so later mutation (including the [`delete_new_service`] test
//! hook) never changes a running host.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::service::{Context, Service};

/// Domain prefix hashed into every service id.
const SERVICE_ID_DOMAIN: &str = "cothority.service/";

/// Stable 16-byte identifier of a service name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub [u8; 16]);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", hex::encode(self.0))
    }
}

/// Derive the id a service name registers under.
pub fn service_id(name: &str) -> ServiceId {
    let mut hasher = Sha256::new();
    hasher.update(SERVICE_ID_DOMAIN.as_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    ServiceId(id)
}

/// Builds one service instance for one host.
pub type ServiceFactory = Arc<dyn Fn(Context, &Path) -> Arc<dyn Service> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, ServiceFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a service factory under `name`. Replaces a previous factory of
/// the same name; hosts already running keep their snapshot.
pub fn register_new_service<F>(name: impl Into<String>, factory: F)
where
    F: Fn(Context, &Path) -> Arc<dyn Service> + Send + Sync + 'static,
{
    REGISTRY
        .write()
        .expect("service registry poisoned")
        .insert(name.into(), Arc::new(factory));
}

/// Remove a registered factory. Test hook; running hosts are unaffected.
pub fn delete_new_service(name: &str) {
    REGISTRY.write().expect("service registry poisoned").remove(name);
}

/// Names currently registered, in no particular order.
pub fn registered_service_names() -> Vec<String> {
    REGISTRY
        .read()
        .expect("service registry poisoned")
        .keys()
        .cloned()
        .collect()
}

/// Snapshot for a starting host.
pub(crate) fn snapshot() -> Vec<(String, ServiceFactory)> {
    REGISTRY
        .read()
        .expect("service registry poisoned")
        .iter()
        .map(|(name, factory)| (name.clone(), factory.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_differ_per_name() {
        assert_ne!(service_id("a"), service_id("b"));
        assert_eq!(service_id("a"), service_id("a"));
    }
}
