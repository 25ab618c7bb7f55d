// ============================================================================
// GateDb - Embedded Database (redb)
// ============================================================================
// Persistent storage for the committee roster, proposals with their votes,
// parameter history, the settlement ledger and issued grants.
// Default path: ~/.tiergate/tiergate.redb (override via TIERGATE_DB_PATH)
// ============================================================================

pub mod types;

pub use types::DbStats;

use anyhow::{anyhow, Result};
use redb::{Builder, Database, ReadableTable, StorageBackend, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::gateway::AccessGrant;
use crate::governance::{CommitteeMember, ProposalRecord};
use crate::ledger::{SettlementKey, SettlementRecord};
use crate::params::ParameterSet;
use crate::types::ProposalId;

// Table definitions
const MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("members");
const PROPOSALS: TableDefinition<&str, &[u8]> = TableDefinition::new("proposals");
const PARAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("params");
const SETTLEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("settlements");
const GRANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("grants");

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Embedded database for governance and settlement state
pub struct GateDb {
    db: Database,
    path: PathBuf,
}

impl GateDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses TIERGATE_DB_PATH env var or ~/.tiergate/tiergate.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("TIERGATE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let dir = home.join(".tiergate");
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow!("Failed to create .tiergate directory: {}", e))?;
            dir.join("tiergate.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(|e| anyhow!("Failed to open database: {}", e))?;
        Self::init(db, db_path)
    }

    /// Open over a caller-supplied redb storage backend; `label` stands in for the path
    pub fn with_backend(backend: impl StorageBackend, label: &str) -> Result<Self> {
        let db = Builder::new()
            .create_with_backend(backend)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;
        Self::init(db, PathBuf::from(label))
    }

    fn init(db: Database, path: PathBuf) -> Result<Self> {
        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        for table in [MEMBERS, PROPOSALS, PARAMS, SETTLEMENTS, GRANTS] {
            write_txn
                .open_table(table)
                .map_err(|e| anyhow!("Failed to create {} table: {}", table.name(), e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self { db, path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Record helpers
    // ========================================================================

    fn put<T: Serialize>(&self, table: Table, key: &str, record: &T) -> Result<()> {
        let value = bincode::serialize(record)
            .map_err(|e| anyhow!("Failed to serialize {}: {}", key, e))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;
            t.insert(key, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert {}: {}", key, e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;

        let mut results = Vec::new();
        let iter = t
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate {}: {}", table.name(), e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let record = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize {} entry: {}", table.name(), e))?;
            results.push(record);
        }
        Ok(results)
    }

    fn count(&self, table: Table) -> Result<usize> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;
        let count = t
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate {}: {}", table.name(), e))?
            .count();
        Ok(count)
    }

    // ========================================================================
    // Roster Operations
    // ========================================================================

    pub fn store_member(&self, member: &CommitteeMember) -> Result<()> {
        // One row per term, so a re-seated identity keeps its earlier terms
        let key = format!(
            "members:{:03}:{:020}:{}",
            member.seat, member.term_start, member.member_id
        );
        self.put(MEMBERS, &key, member)?;
        debug!("Stored member {} (seat {})", member.member_id, member.seat);
        Ok(())
    }

    pub fn list_members(&self) -> Result<Vec<CommitteeMember>> {
        self.scan(MEMBERS)
    }

    // ========================================================================
    // Proposal Operations
    // ========================================================================

    pub fn store_proposal(&self, record: &ProposalRecord) -> Result<()> {
        let key = proposal_key(record.proposal.id);
        self.put(PROPOSALS, &key, record)?;
        debug!("Stored proposal #{} ({:?})", record.proposal.id, record.proposal.status);
        Ok(())
    }

    pub fn list_proposals(&self) -> Result<Vec<ProposalRecord>> {
        self.scan(PROPOSALS)
    }

    // ========================================================================
    // Parameter History Operations
    // ========================================================================

    pub fn store_param_set(&self, set: &ParameterSet) -> Result<()> {
        let key = format!("params:{:020}", set.version());
        self.put(PARAMS, &key, set)?;
        debug!("Stored parameter set v{}", set.version());
        Ok(())
    }

    /// All versions, ascending
    pub fn list_param_sets(&self) -> Result<Vec<ParameterSet>> {
        self.scan(PARAMS)
    }

    // ========================================================================
    // Settlement Operations
    // ========================================================================

    /// Insert a settlement record; returns false if the key was already consumed
    pub fn insert_settlement(&self, record: &SettlementRecord) -> Result<bool> {
        let key = settlement_key(&record.key);
        let value = bincode::serialize(record)
            .map_err(|e| anyhow!("Failed to serialize settlement: {}", e))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let inserted;
        {
            let mut table = write_txn
                .open_table(SETTLEMENTS)
                .map_err(|e| anyhow!("Failed to open settlements table: {}", e))?;
            let exists = table
                .get(key.as_str())
                .map_err(|e| anyhow!("Failed to read settlement: {}", e))?
                .is_some();
            inserted = !exists;
            if inserted {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| anyhow!("Failed to insert settlement: {}", e))?;
            }
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        if inserted {
            debug!("Recorded settlement {}", record.key);
        }
        Ok(inserted)
    }

    pub fn list_settlements(&self) -> Result<Vec<SettlementRecord>> {
        self.scan(SETTLEMENTS)
    }

    // ========================================================================
    // Grant Operations
    // ========================================================================

    pub fn store_grant(&self, grant: &AccessGrant) -> Result<()> {
        let key = format!("grants:{}", grant.grant_id);
        self.put(GRANTS, &key, grant)
    }

    pub fn list_grants(&self) -> Result<Vec<AccessGrant>> {
        self.scan(GRANTS)
    }

    pub fn delete_grant(&self, grant_id: &str) -> Result<bool> {
        let key = format!("grants:{}", grant_id);

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(GRANTS)
                .map_err(|e| anyhow!("Failed to open grants table: {}", e))?;
            removed = table
                .remove(key.as_str())
                .map_err(|e| anyhow!("Failed to remove grant: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted grant: {}", grant_id);
        }
        Ok(removed)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let proposals = self.list_proposals()?;

        let mut proposal_counts = HashMap::new();
        for record in &proposals {
            *proposal_counts
                .entry(format!("{:?}", record.proposal.status))
                .or_insert(0usize) += 1;
        }

        Ok(DbStats {
            total_members: self.count(MEMBERS)?,
            total_proposals: proposals.len(),
            proposal_counts,
            param_versions: self.count(PARAMS)?,
            total_settlements: self.count(SETTLEMENTS)?,
            total_grants: self.count(GRANTS)?,
        })
    }
}

/// Zero-padded so range scans come back in id order
fn proposal_key(id: ProposalId) -> String {
    format!("proposals:{:020}", id)
}

/// Length-prefixed so no two (tx reference, nonce) pairs share a row
fn settlement_key(key: &SettlementKey) -> String {
    format!(
        "settlements:{}:{}:{}",
        key.tx_reference.len(),
        key.tx_reference,
        key.nonce
    )
}
