use super::{RevokedCredential, SlaveRecord, SlaveStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const SLAVES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("slave_servers");
const REVOKED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("revoked_credentials");

/// Slave roster backed by redb
#[derive(Clone)]
pub struct RedbSlaveStore {
    db: Arc<Database>,
}

impl RedbSlaveStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _slaves_table = write_txn
                .open_table(SLAVES_TABLE)
                .context("Failed to open slave servers table")?;
            let _revoked_table = write_txn
                .open_table(REVOKED_TABLE)
                .context("Failed to open revoked credentials table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put_slave(&self, record: &SlaveRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(SLAVES_TABLE)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(record).context("Failed to serialize slave record")?;
            table
                .insert(record.host_id.as_str(), value.as_slice())
                .context("Failed to insert slave record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    /// Read-modify-write a record; missing hosts are left alone.
    fn modify(&self, host_id: &str, apply: impl FnOnce(&mut SlaveRecord)) -> Result<()> {
        let Some(mut record) = self.get_slave_server(host_id)? else {
            return Ok(());
        };
        apply(&mut record);
        record.updated_at = Utc::now();
        self.put_slave(&record)
    }

    fn read_revoked(&self) -> Result<Vec<RevokedCredential>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(REVOKED_TABLE)
            .context("Failed to open table")?;

        let mut revoked = Vec::new();
        for item in table.iter().context("Failed to iterate revocations")? {
            let (_key, value) = item.context("Failed to read item")?;
            let entry: RevokedCredential = serde_json::from_slice(value.value())
                .context("Failed to deserialize revocation")?;
            revoked.push(entry);
        }
        Ok(revoked)
    }
}

impl SlaveStore for RedbSlaveStore {
    fn create_slave_server(&self, record: &SlaveRecord) -> Result<()> {
        self.put_slave(record)
    }

    fn get_slave_server(&self, host_id: &str) -> Result<Option<SlaveRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(SLAVES_TABLE)
            .context("Failed to open table")?;

        match table.get(host_id).context("Failed to get slave record")? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize slave record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_slave_servers(&self) -> Result<Vec<SlaveRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(SLAVES_TABLE)
            .context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate slave records")? {
            let (_key, value) = item.context("Failed to read item")?;
            let record: SlaveRecord = serde_json::from_slice(value.value())
                .context("Failed to deserialize slave record")?;
            records.push(record);
        }

        Ok(records)
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
        let entry = RevokedCredential::new(host_id, cert_serial, reason);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(REVOKED_TABLE)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(&entry).context("Failed to serialize revocation")?;
            table
                .insert(entry.id.as_str(), value.as_slice())
                .context("Failed to insert revocation")?;
        }
        write_txn.commit().context("Failed to commit revocation")?;

        Ok(entry)
    }

    fn is_credential_revoked(&self, cert_serial: &str) -> Result<bool> {
        Ok(self
            .read_revoked()?
            .iter()
            .any(|entry| entry.cert_serial == cert_serial))
    }

    fn list_revoked_credentials(&self) -> Result<Vec<RevokedCredential>> {
        let mut revoked = self.read_revoked()?;
        revoked.sort_by(|a, b| b.revoked_at.cmp(&a.revoked_at));
        Ok(revoked)
    }
}
