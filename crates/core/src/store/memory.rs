use super::{RevokedCredential, SlaveRecord, SlaveStore};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    slaves: BTreeMap<String, SlaveRecord>,
    revoked: Vec<RevokedCredential>,
}

/// Volatile store for development and tests.
///
/// Writes can be made to fail on demand to exercise the best-effort and
/// fail-closed paths.
#[derive(Debug, Default)]
pub struct InMemorySlaveStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    fail_revocations: AtomicBool,
}

impl InMemorySlaveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every roster write (last seen, enabled, version) fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make revocation writes fail.
    pub fn set_fail_revocations(&self, fail: bool) {
        self.fail_revocations.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("slave store unavailable");
        }
        Ok(())
    }

    fn modify(&self, host_id: &str, apply: impl FnOnce(&mut SlaveRecord)) -> Result<()> {
        self.check_writable()?;
        if let Some(record) = self.tables().slaves.get_mut(host_id) {
            apply(record);
            record.updated_at = Utc::now();
        }
        Ok(())
    }
}

impl SlaveStore for InMemorySlaveStore {
    fn create_slave_server(&self, record: &SlaveRecord) -> Result<()> {
        self.check_writable()?;
        self.tables()
            .slaves
            .insert(record.host_id.clone(), record.clone());
        Ok(())
    }

    fn get_slave_server(&self, host_id: &str) -> Result<Option<SlaveRecord>> {
        Ok(self.tables().slaves.get(host_id).cloned())
    }

    fn list_slave_servers(&self) -> Result<Vec<SlaveRecord>> {
        Ok(self.tables().slaves.values().cloned().collect())
    }

    fn update_slave_last_seen(&self, host_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.modify(host_id, |record| record.last_seen = Some(at))
    }

    fn update_slave_enabled(&self, host_id: &str, enabled: bool) -> Result<()> {
        self.modify(host_id, |record| record.enabled = enabled)
    }

    fn update_slave_version(&self, host_id: &str, version: &str) -> Result<()> {
        self.modify(host_id, |record| record.version = version.to_string())
    }

    fn revoke_credential(&self, host_id: &str, cert_serial: &str, reason: &str) -> Result<RevokedCredential> {
        if self.fail_revocations.load(Ordering::SeqCst) {
            bail!("revocation list unavailable");
        }
        let entry = RevokedCredential::new(host_id, cert_serial, reason);
        self.tables().revoked.push(entry.clone());
        Ok(entry)
    }

    fn is_credential_revoked(&self, cert_serial: &str) -> Result<bool> {
        Ok(self
            .tables()
            .revoked
            .iter()
            .any(|r| r.cert_serial == cert_serial))
    }

    fn list_revoked_credentials(&self) -> Result<Vec<RevokedCredential>> {
        let mut revoked = self.tables().revoked.clone();
        revoked.sort_by(|a, b| b.revoked_at.cmp(&a.revoked_at));
        Ok(revoked)
    }
}
