//! Device identity sources and the submitted record
//!
//! Identifier sources are treated as always-available: every getter returns a
//! string, possibly empty. The store-backed install id is the only persisted
//! identity, and only its SHA-256 digest ever leaves the device.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::IdentityConfig;

/// Supplies the six opaque identifier fields for a report.
///
/// Implementations must be infallible; an unavailable source yields an empty
/// string rather than an error.
pub trait IdentitySource: Send + Sync {
    /// Anonymized device hash (never a raw hardware identifier)
    fn device_hash(&self) -> String;
    /// Device model name
    fn device_name(&self) -> String;
    /// OS build version
    fn mod_version(&self) -> String;
    /// ISO country code
    fn country_code(&self) -> String;
    /// Mobile carrier name
    fn carrier_name(&self) -> String;
    /// Mobile carrier numeric id
    fn carrier_id(&self) -> String;
}

/// The six-field anonymized tuple submitted in a report.
///
/// Constructed fresh per attempt and immutable once built; field names match
/// the wire protocol's form keys exactly.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub device_hash: String,
    pub device_name: String,
    pub device_version: String,
    pub device_country: String,
    pub device_carrier: String,
    pub device_carrier_id: String,
}

impl DeviceRecord {
    /// Snapshot the identity source into an attempt-scoped record.
    pub fn collect(source: &dyn IdentitySource) -> Self {
        Self {
            device_hash: source.device_hash(),
            device_name: source.device_name(),
            device_version: source.mod_version(),
            device_country: source.country_code(),
            device_carrier: source.carrier_name(),
            device_carrier_id: source.carrier_id(),
        }
    }
}

/// Production identity source.
///
/// The device hash is the hex SHA-256 digest of the persisted install id.
/// The remaining fields come from config overrides, falling back to
/// `MODSTATS_*` environment variables and then to empty strings.
pub struct SystemIdentity {
    config: IdentityConfig,
    device_hash: String,
}

impl SystemIdentity {
    pub fn new(config: IdentityConfig, install_id: &str) -> Self {
        Self {
            config,
            device_hash: derive_device_hash(install_id),
        }
    }
}

/// Hex SHA-256 digest of the install id.
pub fn derive_device_hash(install_id: &str) -> String {
    let digest = Sha256::digest(install_id.as_bytes());
    hex::encode(digest)
}

fn field(overridden: Option<&str>, env_var: &str) -> String {
    if let Some(value) = overridden {
        return value.to_string();
    }
    std::env::var(env_var).unwrap_or_default()
}

impl IdentitySource for SystemIdentity {
    fn device_hash(&self) -> String {
        self.device_hash.clone()
    }

    fn device_name(&self) -> String {
        field(self.config.device_name.as_deref(), "MODSTATS_DEVICE")
    }

    fn mod_version(&self) -> String {
        field(self.config.mod_version.as_deref(), "MODSTATS_VERSION")
    }

    fn country_code(&self) -> String {
        field(self.config.country_code.as_deref(), "MODSTATS_COUNTRY")
    }

    fn carrier_name(&self) -> String {
        field(self.config.carrier_name.as_deref(), "MODSTATS_CARRIER")
    }

    fn carrier_id(&self) -> String {
        field(self.config.carrier_id.as_deref(), "MODSTATS_CARRIER_ID")
    }
}
