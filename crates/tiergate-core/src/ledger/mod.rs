//! ============================================================================
//! Settlement Ledger - Append-only replay protection
//! ============================================================================
//! Every admitted payment consumes its (tx reference, nonce) key exactly once.
//! Consumption holds the map entry for that key while the record is made
//! durable, so concurrent admissions of the same proof serialize on the key
//! and independent proofs proceed in parallel.
//! ============================================================================

use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::GateDb;
use crate::types::{GateError, GateResult, GrantId, Timestamp};

/// Replay-protection key of a payment proof
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettlementKey {
    pub tx_reference: String,
    pub nonce: String,
}

impl SettlementKey {
    pub fn new(tx_reference: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            tx_reference: tx_reference.into(),
            nonce: nonce.into(),
        }
    }
}

impl fmt::Display for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tx_reference, self.nonce)
    }
}

/// A consumed payment proof and the grant it funded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub key: SettlementKey,
    pub consumed_at: Timestamp,
    pub grant_id: GrantId,
    pub payer: String,
    pub amount: u64,
    pub asset: String,
    /// Parameter version the tier was resolved under
    pub param_version: u64,
}

/// Append-only record of consumed settlement keys
pub struct SettlementLedger {
    consumed: DashMap<SettlementKey, SettlementRecord>,
    db: Option<Arc<GateDb>>,
}

impl SettlementLedger {
    /// Volatile ledger (tests, simulations)
    pub fn in_memory() -> Self {
        Self {
            consumed: DashMap::new(),
            db: None,
        }
    }

    /// Durable ledger, loading every previously consumed key
    pub fn with_db(db: Arc<GateDb>) -> Result<Self> {
        let consumed = DashMap::new();
        for record in db.list_settlements()? {
            consumed.insert(record.key.clone(), record);
        }
        info!("Settlement ledger loaded {} consumed keys", consumed.len());
        Ok(Self {
            consumed,
            db: Some(db),
        })
    }

    pub fn contains(&self, key: &SettlementKey) -> bool {
        self.consumed.contains_key(key)
    }

    pub fn get(&self, key: &SettlementKey) -> Option<SettlementRecord> {
        self.consumed.get(key).map(|r| r.value().clone())
    }

    /// Consume the record's key. Fails `ReplayDetected` if it was consumed
    /// before and `StorageUnavailable` if the record cannot be made durable,
    /// in which case the key stays unconsumed.
    pub fn consume(&self, record: SettlementRecord) -> GateResult<SettlementRecord> {
        match self.consumed.entry(record.key.clone()) {
            Entry::Occupied(existing) => {
                warn!(
                    "Replay of settlement {} (first consumed at {} for grant {})",
                    record.key,
                    existing.get().consumed_at,
                    existing.get().grant_id
                );
                Err(GateError::ReplayDetected {
                    reference: record.key.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                if let Some(db) = &self.db {
                    match db.insert_settlement(&record) {
                        Ok(true) => {}
                        Ok(false) => {
                            // Consumed by another process sharing the database
                            warn!("Settlement {} already persisted", record.key);
                            return Err(GateError::ReplayDetected {
                                reference: record.key.to_string(),
                            });
                        }
                        Err(e) => {
                            error!("Failed to persist settlement {}: {}", record.key, e);
                            return Err(GateError::storage(e));
                        }
                    }
                }
                debug!("Consumed settlement {} for grant {}", record.key, record.grant_id);
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<SettlementRecord> {
        let mut records: Vec<_> = self.consumed.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.consumed_at.cmp(&b.consumed_at).then_with(|| a.key.cmp(&b.key)));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::FailingBackend;
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;

    fn record(tx: &str, nonce: &str, grant: &str) -> SettlementRecord {
        SettlementRecord {
            key: SettlementKey::new(tx, nonce),
            consumed_at: 1,
            grant_id: grant.to_string(),
            payer: "payer".to_string(),
            amount: 10,
            asset: "SOL".to_string(),
            param_version: 1,
        }
    }

    #[test]
    fn test_consume_once() {
        let ledger = SettlementLedger::in_memory();
        assert!(ledger.consume(record("tx", "1", "g1")).is_ok());
        let err = ledger.consume(record("tx", "1", "g2")).unwrap_err();
        assert_eq!(err, GateError::ReplayDetected { reference: "tx/1".into() });
        // First consumer keeps the key
        assert_eq!(ledger.get(&SettlementKey::new("tx", "1")).unwrap().grant_id, "g1");
        // Same tx, different nonce is a different key
        assert!(ledger.consume(record("tx", "2", "g3")).is_ok());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_concurrent_consumers_single_winner() {
        let ledger = Arc::new(SettlementLedger::in_memory());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.consume(record("race", "n", &format!("g{}", i))).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_durable_ledger_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.redb");
        {
            let db = Arc::new(GateDb::open(path.to_str()).unwrap());
            let ledger = SettlementLedger::with_db(db).unwrap();
            ledger.consume(record("tx", "1", "g1")).unwrap();
        }
        let db = Arc::new(GateDb::open(path.to_str()).unwrap());
        let ledger = SettlementLedger::with_db(db).unwrap();
        assert!(ledger.contains(&SettlementKey::new("tx", "1")));
        assert!(ledger.consume(record("tx", "1", "g2")).is_err());
    }

    #[test]
    fn test_durable_keys_differing_in_separator_placement() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(GateDb::open(dir.path().join("ledger.redb").to_str()).unwrap());
        let ledger = SettlementLedger::with_db(db.clone()).unwrap();

        ledger.consume(record("a/b", "c", "g1")).unwrap();
        ledger.consume(record("a", "b/c", "g2")).unwrap();
        assert_eq!(ledger.len(), 2);

        let reloaded = SettlementLedger::with_db(db).unwrap();
        assert_eq!(reloaded.get(&SettlementKey::new("a/b", "c")).unwrap().grant_id, "g1");
        assert_eq!(reloaded.get(&SettlementKey::new("a", "b/c")).unwrap().grant_id, "g2");
    }

    #[test]
    fn test_storage_failure_leaves_key_unconsumed() {
        let (backend, failing) = FailingBackend::new();
        let db = Arc::new(GateDb::with_backend(backend, "memory").unwrap());
        let ledger = SettlementLedger::with_db(db).unwrap();

        failing.store(true, Ordering::SeqCst);
        let err = ledger.consume(record("tx", "1", "g1")).unwrap_err();
        assert!(matches!(err, GateError::StorageUnavailable(_)));
        assert!(!ledger.contains(&SettlementKey::new("tx", "1")));
    }
}
