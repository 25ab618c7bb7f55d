//! ============================================================================
//! Parameter Store - Copy-on-write parameter snapshots
//! ============================================================================
//! Readers clone the `Arc` of the current snapshot and never see a partially
//! written version. Publishing is compare-and-swap on the version number:
//! the caller names the version it derived from and loses if another publish
//! got there first.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info};

use super::types::ParameterSet;
use crate::db::GateDb;
use crate::types::{lock, read, write, GateError, GateResult, ProposalId, Timestamp};

/// Versioned parameter history with a single current pointer
pub struct ParameterStore {
    current: RwLock<Arc<ParameterSet>>,
    /// Index `n` holds version `n + 1`
    history: RwLock<Vec<Arc<ParameterSet>>>,
    /// Serializes publishers; readers never take it
    publish_lock: Mutex<()>,
    db: Option<Arc<GateDb>>,
}

impl ParameterStore {
    /// Volatile store seeded with `genesis`
    pub fn new(genesis: ParameterSet) -> Self {
        let genesis = Arc::new(genesis);
        Self {
            current: RwLock::new(genesis.clone()),
            history: RwLock::new(vec![genesis]),
            publish_lock: Mutex::new(()),
            db: None,
        }
    }

    /// Durable store. Loads the persisted history, or persists `genesis` as
    /// version 1 when the database holds none.
    pub fn open<F>(db: Arc<GateDb>, genesis: F) -> Result<Self>
    where
        F: FnOnce() -> GateResult<ParameterSet>,
    {
        let mut history: Vec<Arc<ParameterSet>> =
            db.list_param_sets()?.into_iter().map(Arc::new).collect();

        if history.is_empty() {
            let set = genesis().map_err(|e| anyhow!("Invalid genesis parameters: {}", e))?;
            db.store_param_set(&set)?;
            info!("Seeded parameter store with genesis v{}", set.version());
            history.push(Arc::new(set));
        }

        for (idx, set) in history.iter().enumerate() {
            if set.version() != idx as u64 + 1 {
                return Err(anyhow!(
                    "Parameter history has a gap: expected v{}, found v{}",
                    idx + 1,
                    set.version()
                ));
            }
        }

        let current = history
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("Parameter history is empty"))?;
        info!("Parameter store at v{} ({} versions)", current.version(), history.len());

        Ok(Self {
            current: RwLock::new(current),
            history: RwLock::new(history),
            publish_lock: Mutex::new(()),
            db: Some(db),
        })
    }

    /// Snapshot of the current version
    pub fn current_version(&self) -> Arc<ParameterSet> {
        read(&self.current).clone()
    }

    pub fn version(&self, version: u64) -> Option<Arc<ParameterSet>> {
        let idx = usize::try_from(version.checked_sub(1)?).ok()?;
        read(&self.history).get(idx).cloned()
    }

    /// Version in effect at `ts` (None before genesis took effect)
    pub fn version_at(&self, ts: Timestamp) -> Option<Arc<ParameterSet>> {
        read(&self.history)
            .iter()
            .rev()
            .find(|set| set.effective_at() <= ts)
            .cloned()
    }

    pub fn history(&self) -> Vec<Arc<ParameterSet>> {
        read(&self.history).clone()
    }

    /// Version published by the given proposal, if any
    pub fn published_by(&self, proposal: ProposalId) -> Option<Arc<ParameterSet>> {
        read(&self.history)
            .iter()
            .find(|set| set.provenance() == Some(proposal))
            .cloned()
    }

    /// Publish `next`, derived from `base_version`. Returns the new version.
    pub fn publish(&self, base_version: u64, next: ParameterSet) -> GateResult<u64> {
        let _guard = lock(&self.publish_lock);

        let current = self.current_version();
        if current.version() != base_version {
            debug!(
                "Stale publish: based on v{}, store at v{}",
                base_version,
                current.version()
            );
            return Err(GateError::ParameterVersionStale {
                expected: base_version,
                current: current.version(),
            });
        }
        if next.version() != base_version + 1 {
            return Err(GateError::validation(format!(
                "v{} cannot follow v{}",
                next.version(),
                base_version
            )));
        }
        if next.effective_at() < current.effective_at() {
            return Err(GateError::validation(format!(
                "v{} takes effect before v{}",
                next.version(),
                base_version
            )));
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.store_param_set(&next) {
                error!("Failed to persist parameter set v{}: {}", next.version(), e);
                return Err(GateError::storage(e));
            }
        }

        let next = Arc::new(next);
        let version = next.version();
        write(&self.history).push(next.clone());
        *write(&self.current) = next;

        info!("Published parameter set v{}", version);
        Ok(version)
    }
}
