//! # Configuration
//!
//! Runtime tunables for routers and services, plus the roster group file.
//!
//! ## Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//!
//! Durations appear in TOML as `{ secs = .., nanos = .. }` tables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::{Address, PublicId, ServerIdentity};
use crate::overlay::Roster;

/// Default bound on dialing (and handshaking with) a peer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-connection dispatch queue high-water mark, in packets.
/// A connection whose processor falls further behind is closed.
pub const DEFAULT_DISPATCH_QUEUE_LIMIT: usize = 100;

/// Default window during which the timestamp service batches requests.
pub const DEFAULT_EPOCH_DURATION: Duration = Duration::from_secs(10);

/// Default bound on waiting for the collective signature of one epoch.
pub const DEFAULT_SIGNATURE_DEADLINE: Duration = Duration::from_secs(5);

/// Runtime configuration shared by the router and services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bound on dialing and handshaking with one peer.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: Duration,

    /// Per-connection dispatch queue high-water mark, in packets.
    #[serde(default = "default_dispatch_queue_limit")]
    pub dispatch_queue_limit: usize,

    /// Maximum size of one wire frame, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Batching window of the timestamp service.
    #[serde(default = "default_epoch_duration")]
    pub epoch_duration: Duration,

    /// Bound on waiting for one epoch's collective signature.
    #[serde(default = "default_signature_deadline")]
    pub signature_deadline: Duration,
}

fn default_dial_timeout() -> Duration {
    DEFAULT_DIAL_TIMEOUT
}

fn default_dispatch_queue_limit() -> usize {
    DEFAULT_DISPATCH_QUEUE_LIMIT
}

fn default_max_frame_size() -> usize {
    crate::core::codec::MAX_FRAME_SIZE
}

fn default_epoch_duration() -> Duration {
    DEFAULT_EPOCH_DURATION
}

fn default_signature_deadline() -> Duration {
    DEFAULT_SIGNATURE_DEADLINE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_timeout: default_dial_timeout(),
            dispatch_queue_limit: default_dispatch_queue_limit(),
            max_frame_size: default_max_frame_size(),
            epoch_duration: default_epoch_duration(),
            signature_deadline: default_signature_deadline(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigInvalid(format!("failed to parse TOML: {e}")))
    }

    /// Validate for common misconfigurations.
    ///
    /// Returns a list of problems; empty means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.dial_timeout.is_zero() {
            errors.push("dial_timeout must be non-zero".to_string());
        }
        if self.dispatch_queue_limit == 0 {
            errors.push("dispatch_queue_limit must be at least 1".to_string());
        }
        if self.max_frame_size < 64 {
            errors.push("max_frame_size below 64 bytes cannot carry a handshake".to_string());
        }
        if self.epoch_duration.is_zero() {
            errors.push("epoch_duration must be non-zero".to_string());
        }
        if self.signature_deadline.is_zero() {
            errors.push("signature_deadline must be non-zero".to_string());
        }
        errors
    }
}

/// One member entry of a roster group file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupServer {
    /// Reachable address, e.g. `tcp://host:port`.
    pub address: String,
    /// Hex-encoded 32-byte public key.
    pub public: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The roster group file: an ordered list of members. Order is significant,
/// it fixes the derived tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupToml {
    pub servers: Vec<GroupServer>,
}

impl GroupToml {
    /// Read a group file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            Error::ConfigInvalid(format!(
                "failed to read group file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a group file from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse group file: {e}")))
    }

    /// Build the roster, preserving member order.
    pub fn roster(&self) -> Result<Roster> {
        if self.servers.is_empty() {
            return Err(Error::ConfigInvalid("group file lists no servers".into()));
        }
        let mut members = Vec::with_capacity(self.servers.len());
        for entry in &self.servers {
            let address: Address = entry.address.parse()?;
            let raw = hex::decode(&entry.public)
                .map_err(|e| Error::ConfigInvalid(format!("bad public key hex: {e}")))?;
            let key: [u8; 32] = raw
                .try_into()
                .map_err(|_| Error::ConfigInvalid("public key must be 32 bytes".into()))?;
            members.push(ServerIdentity::new(PublicId(key), address));
        }
        Ok(Roster::new(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn bad_values_are_listed() {
        let cfg = Config {
            dial_timeout: Duration::ZERO,
            dispatch_queue_limit: 0,
            ..Config::default()
        };
        assert_eq!(cfg.validate().len(), 2);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = Config::from_toml("dispatch_queue_limit = 7\n").unwrap();
        assert_eq!(cfg.dispatch_queue_limit, 7);
        assert_eq!(cfg.dial_timeout, DEFAULT_DIAL_TIMEOUT);
    }

    #[test]
    fn group_file_roundtrip() {
        let kp = crate::identity::Keypair::generate(Address::tcp("127.0.0.1:2000"));
        let toml = format!(
            "[[servers]]\naddress = \"tcp://127.0.0.1:2000\"\npublic = \"{}\"\n",
            hex::encode(kp.public().0)
        );
        let group = GroupToml::from_toml(&toml).unwrap();
        let roster = group.roster().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get(0).unwrap().public, kp.public());
    }

    #[test]
    fn empty_group_is_invalid() {
        let group = GroupToml { servers: vec![] };
        assert!(matches!(group.roster(), Err(Error::ConfigInvalid(_))));
    }
}
