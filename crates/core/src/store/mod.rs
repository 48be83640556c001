//! Persisted slave roster and revocation list.
//!
//! The store is never the liveness authority: the registry's in-memory map
//! is. Store writes on the connection path are best-effort.

pub mod memory;
pub mod redb_store;

pub use self::memory::InMemorySlaveStore;
pub use self::redb_store::RedbSlaveStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A paired slave as recorded by the credential workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveRecord {
    pub host_id: String,
    pub cert_serial: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SlaveRecord {
    pub fn new(
        host_id: impl Into<String>,
        cert_serial: impl Into<String>,
        platform: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            host_id: host_id.into(),
            cert_serial: cert_serial.into(),
            platform: platform.into(),
            version: String::new(),
            issued_at,
            expires_at,
            last_seen: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A durable revocation entry. Authentication consults these by serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokedCredential {
    pub id: String,
    pub host_id: String,
    pub cert_serial: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
}

impl RevokedCredential {
    pub fn new(host_id: &str, cert_serial: &str, reason: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            host_id: host_id.to_string(),
            cert_serial: cert_serial.to_string(),
            revoked_at: Utc::now(),
            reason: reason.to_string(),
        }
    }
}

/// Operations the fleet core needs from persistence.
pub trait SlaveStore: Send + Sync {
    /// Insert or replace a slave record
    fn create_slave_server(&self, record: &SlaveRecord) -> Result<()>;

    fn get_slave_server(&self, host_id: &str) -> Result<Option<SlaveRecord>>;

    /// All records, ordered by host id
    fn list_slave_servers(&self) -> Result<Vec<SlaveRecord>>;

    /// Stamp the last time the host was seen alive. Unknown hosts are ignored.
    fn update_slave_last_seen(&self, host_id: &str, at: DateTime<Utc>) -> Result<()>;

    fn update_slave_enabled(&self, host_id: &str, enabled: bool) -> Result<()>;

    fn update_slave_version(&self, host_id: &str, version: &str) -> Result<()>;

    /// Durably record a revocation
    fn revoke_credential(&self, host_id: &str, cert_serial: &str, reason: &str) -> Result<RevokedCredential>;

    fn is_credential_revoked(&self, cert_serial: &str) -> Result<bool>;

    /// Revocations, most recent first
    fn list_revoked_credentials(&self) -> Result<Vec<RevokedCredential>>;
}
