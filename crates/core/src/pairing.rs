//! Per-slave credential issuing and connect-time authentication.
//!
//! Certificate signing itself lives outside this crate; what the fleet core
//! needs is a serial per slave and a yes/no answer when a link comes up.

use crate::error::{FleetError, FleetResult};
use crate::store::{SlaveRecord, SlaveStore};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Default credential lifetime
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

pub struct PairingService {
    store: Arc<dyn SlaveStore>,
    validity: Duration,
}

impl PairingService {
    pub fn new(store: Arc<dyn SlaveStore>) -> Self {
        Self::with_validity(store, Duration::days(DEFAULT_VALIDITY_DAYS))
    }

    pub fn with_validity(store: Arc<dyn SlaveStore>, validity: Duration) -> Self {
        Self { store, validity }
    }

    /// Issue a fresh credential for `host_id`, replacing any previous serial.
    ///
    /// Re-pairing re-enables a disabled slave but does not lift revocations of
    /// the old serial.
    pub fn issue_credential(&self, host_id: &str, platform: &str) -> FleetResult<SlaveRecord> {
        if host_id.trim().is_empty() {
            return Err(FleetError::Unauthorized("empty host id".to_string()));
        }

        let now = Utc::now();
        let serial = generate_serial(host_id);
        let record = match self.store.get_slave_server(host_id).map_err(FleetError::Store)? {
            Some(mut existing) => {
                existing.cert_serial = serial;
                existing.platform = platform.to_string();
                existing.issued_at = now;
                existing.expires_at = now + self.validity;
                existing.enabled = true;
                existing.updated_at = now;
                existing
            }
            None => SlaveRecord::new(host_id, serial, platform, now, now + self.validity),
        };

        self.store
            .create_slave_server(&record)
            .map_err(FleetError::Store)?;

        tracing::info!(host_id = %host_id, serial = %record.cert_serial, "Issued slave credential");
        Ok(record)
    }

    /// Decide whether a link presenting `cert_serial` for `host_id` may register.
    ///
    /// Consults the revocation list, so a revoked slave cannot re-authenticate
    /// even if a disconnect raced with its revocation.
    pub fn authenticate(&self, host_id: &str, cert_serial: &str) -> FleetResult<SlaveRecord> {
        let record = self
            .store
            .get_slave_server(host_id)
            .map_err(FleetError::Store)?
            .ok_or_else(|| FleetError::Unauthorized(format!("unknown slave {}", host_id)))?;

        if self
            .store
            .is_credential_revoked(cert_serial)
            .map_err(FleetError::Store)?
        {
            return Err(FleetError::Revoked(host_id.to_string()));
        }

        if record.cert_serial != cert_serial {
            return Err(FleetError::Unauthorized(format!(
                "credential serial mismatch for {}",
                host_id
            )));
        }

        if !record.enabled {
            return Err(FleetError::Unauthorized(format!("slave {} is disabled", host_id)));
        }

        if record.is_expired(Utc::now()) {
            return Err(FleetError::Unauthorized(format!("credential for {} expired", host_id)));
        }

        Ok(record)
    }

    pub fn store(&self) -> &Arc<dyn SlaveStore> {
        &self.store
    }
}

fn generate_serial(host_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_id.as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySlaveStore;

    fn service() -> (PairingService, Arc<InMemorySlaveStore>) {
        let store = Arc::new(InMemorySlaveStore::new());
        (PairingService::new(store.clone()), store)
    }

    #[test]
    fn test_issue_then_authenticate() {
        let (pairing, _store) = service();
        let record = pairing.issue_credential("alpha", "linux").unwrap();

        assert_eq!(record.cert_serial.len(), 32);
        let authed = pairing.authenticate("alpha", &record.cert_serial).unwrap();
        assert_eq!(authed.host_id, "alpha");
    }

    #[test]
    fn test_reissue_rotates_serial() {
        let (pairing, _store) = service();
        let first = pairing.issue_credential("alpha", "linux").unwrap();
        let second = pairing.issue_credential("alpha", "linux").unwrap();

        assert_ne!(first.cert_serial, second.cert_serial);
        assert!(matches!(
            pairing.authenticate("alpha", &first.cert_serial),
            Err(FleetError::Unauthorized(_))
        ));
        assert!(pairing.authenticate("alpha", &second.cert_serial).is_ok());
    }

    #[test]
    fn test_unknown_host_rejected() {
        let (pairing, _store) = service();
        assert!(matches!(
            pairing.authenticate("ghost", "whatever"),
            Err(FleetError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_revoked_serial_rejected() {
        let (pairing, store) = service();
        let record = pairing.issue_credential("alpha", "linux").unwrap();
        store
            .revoke_credential("alpha", &record.cert_serial, "stolen")
            .unwrap();

        assert!(matches!(
            pairing.authenticate("alpha", &record.cert_serial),
            Err(FleetError::Revoked(host)) if host == "alpha"
        ));
    }

    #[test]
    fn test_disabled_and_expired_rejected() {
        let (pairing, store) = service();
        let record = pairing.issue_credential("alpha", "linux").unwrap();
        store.update_slave_enabled("alpha", false).unwrap();
        assert!(pairing.authenticate("alpha", &record.cert_serial).is_err());

        let expired = PairingService::with_validity(store.clone(), Duration::seconds(-1));
        let record = expired.issue_credential("beta", "linux").unwrap();
        assert!(matches!(
            expired.authenticate("beta", &record.cert_serial),
            Err(FleetError::Unauthorized(msg)) if msg.contains("expired")
        ));
    }
}
