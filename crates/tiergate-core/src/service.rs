//! ============================================================================
//! TierGate Service - Wiring of store, ledger, engine and gateway
//! ============================================================================
//! Opens (or creates) the database, seeds genesis parameters on first run,
//! rebuilds in-flight governance state and runs the background scheduler
//! that drives proposal timers and purges spent grants.
//! ============================================================================

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::TierGateConfig;
use crate::db::{DbStats, GateDb};
use crate::gateway::{AccessGateway, LedgerOracle};
use crate::governance::{DecisionEngine, TickReport};
use crate::ledger::SettlementLedger;
use crate::params::{ParameterSet, ParameterStore};
use crate::types::{Clock, GateResult, SystemClock};

/// Outcome of one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub governance: TickReport,
    pub grants_purged: usize,
}

pub struct TierGate {
    config: TierGateConfig,
    db: Option<Arc<GateDb>>,
    params: Arc<ParameterStore>,
    ledger: Arc<SettlementLedger>,
    engine: Arc<DecisionEngine>,
    gateway: Arc<AccessGateway>,
}

impl TierGate {
    /// Durable instance on the system clock
    pub fn open(config: TierGateConfig, oracle: Arc<dyn LedgerOracle>) -> Result<Self> {
        Self::open_with_clock(config, oracle, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: TierGateConfig,
        oracle: Arc<dyn LedgerOracle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.governance.validate()?;
        let db = Arc::new(GateDb::open(config.db_path.as_deref())?);

        let genesis_at = clock.now();
        let params = Arc::new(ParameterStore::open(db.clone(), || {
            ParameterSet::genesis(config.genesis_values(), genesis_at)
        })?);
        let ledger = Arc::new(SettlementLedger::with_db(db.clone())?);
        let engine = Arc::new(DecisionEngine::open(
            config.governance.clone(),
            clock.clone(),
            params.clone(),
            db.clone(),
        )?);
        let gateway = Arc::new(AccessGateway::with_db(
            config.gateway.clone(),
            params.clone(),
            ledger.clone(),
            oracle,
            clock,
            db.clone(),
        )?);

        info!("TierGate opened at {}", db.path().display());
        Ok(Self {
            config,
            db: Some(db),
            params,
            ledger,
            engine,
            gateway,
        })
    }

    /// Volatile instance; nothing survives the process
    pub fn in_memory(
        config: TierGateConfig,
        oracle: Arc<dyn LedgerOracle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.governance.validate()?;
        let genesis = ParameterSet::genesis(config.genesis_values(), clock.now())?;
        let params = Arc::new(ParameterStore::new(genesis));
        let ledger = Arc::new(SettlementLedger::in_memory());
        let engine = Arc::new(DecisionEngine::new(
            config.governance.clone(),
            clock.clone(),
            params.clone(),
        ));
        let gateway = Arc::new(AccessGateway::new(
            config.gateway.clone(),
            params.clone(),
            ledger.clone(),
            oracle,
            clock,
        ));

        Ok(Self {
            config,
            db: None,
            params,
            ledger,
            engine,
            gateway,
        })
    }

    pub fn config(&self) -> &TierGateConfig {
        &self.config
    }

    pub fn params(&self) -> &Arc<ParameterStore> {
        &self.params
    }

    pub fn ledger(&self) -> &Arc<SettlementLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn gateway(&self) -> &Arc<AccessGateway> {
        &self.gateway
    }

    /// Table counts; None for in-memory instances
    pub fn stats(&self) -> Result<Option<DbStats>> {
        self.db.as_ref().map(|db| db.stats()).transpose()
    }

    /// One scheduler pass: governance timers, then grant purge
    pub fn run_maintenance(&self) -> GateResult<MaintenanceReport> {
        let governance = self.engine.tick()?;
        let grants_purged = self.gateway.purge_expired()?;
        Ok(MaintenanceReport {
            governance,
            grants_purged,
        })
    }

    /// Run `run_maintenance` every `period` until the handle is aborted
    pub fn spawn_scheduler(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Scheduler started ({:?} period)", period);
            loop {
                interval.tick().await;
                let pass = Arc::clone(&gate);
                match tokio::task::spawn_blocking(move || pass.run_maintenance()).await {
                    Ok(Ok(report)) => debug!("Maintenance pass: {:?}", report),
                    Ok(Err(e)) => error!("Maintenance pass failed: {}", e),
                    Err(e) => error!("Maintenance task panicked: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisTier;
    use crate::gateway::{PaymentProof, StaticOracle};
    use crate::governance::{MajorityRule, ProposalStatus, ProposalSubmission, VoteChoice};
    use crate::params::{ParamChange, ParamValue};
    use crate::types::ManualClock;

    fn metal_config() -> TierGateConfig {
        let tier = |id: &str, min_amount: u64, caps: &[&str]| GenesisTier {
            id: id.to_string(),
            display_name: id.to_string(),
            min_amount,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            grant_ttl_secs: 3_600,
            grant_max_uses: 1,
            token_depth: 1,
        };
        TierGateConfig {
            genesis_tiers: vec![
                tier("Bronze", 5, &["read"]),
                tier("Silver", 10, &["read", "deep"]),
                tier("Gold", 20, &["read", "deep", "priority"]),
            ],
            ..Default::default()
        }
    }

    fn proof(tx: &str, amount: u64) -> PaymentProof {
        PaymentProof {
            payer: "wallet".into(),
            amount,
            asset: "SOL".into(),
            tx_reference: tx.into(),
            nonce: "0".into(),
            timestamp: 0,
        }
    }

    fn seat_committee(gate: &TierGate) {
        for seat in 1..=7u8 {
            gate.engine()
                .seat_member(&format!("member-{}", seat), seat, 0, i64::MAX)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_threshold_change_end_to_end() {
        let clock = Arc::new(ManualClock::new(1_000));
        let gate = TierGate::in_memory(metal_config(), Arc::new(StaticOracle::trusting()), clock.clone())
            .unwrap();
        seat_committee(&gate);

        let early = gate.gateway().verify_and_admit(&proof("tx-early", 12)).await.unwrap();
        assert_eq!(early.tier.id, "Silver");

        let id = gate
            .engine()
            .submit(ProposalSubmission {
                title: "Raise Silver".into(),
                body: "Silver threshold 10 -> 15".into(),
                changes: vec![ParamChange::set("Silver.min_amount", ParamValue::Int(15))],
                majority: MajorityRule::Supermajority,
                proposer: "member-1".into(),
            })
            .unwrap();

        clock.advance(gate.config().governance.review_period_secs);
        let report = gate.run_maintenance().unwrap();
        assert_eq!(report.governance.voting_opened, 1);

        for seat in 1..=5 {
            gate.engine()
                .cast_vote(id, &format!("member-{}", seat), VoteChoice::Approve)
                .unwrap();
        }
        gate.engine()
            .cast_vote(id, "member-6", VoteChoice::Reject)
            .unwrap();

        clock.advance(gate.config().governance.voting_window_secs);
        let report = gate.run_maintenance().unwrap();
        assert_eq!(report.governance.executed, 1);
        assert_eq!(gate.engine().status(id).unwrap(), ProposalStatus::Executed);
        assert_eq!(gate.params().current_version().version(), 2);

        let late = gate.gateway().verify_and_admit(&proof("tx-late", 12)).await.unwrap();
        assert_eq!(late.tier.id, "Bronze");

        // Issued before the swap, honoured with Silver capabilities
        gate.gateway().authorize(&early.token, "deep").unwrap();
    }

    #[tokio::test]
    async fn test_durable_instance_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = TierGateConfig {
            db_path: Some(dir.path().join("tiergate.redb").to_string_lossy().into_owned()),
            ..metal_config()
        };
        let clock = Arc::new(ManualClock::new(1_000));

        {
            let gate = TierGate::open_with_clock(config.clone(), Arc::new(StaticOracle::trusting()), clock.clone())
                .unwrap();
            seat_committee(&gate);
            gate.gateway().verify_and_admit(&proof("tx", 25)).await.unwrap();
            let stats = gate.stats().unwrap().unwrap();
            assert_eq!(stats.total_members, 7);
            assert_eq!(stats.total_settlements, 1);
            assert_eq!(stats.param_versions, 1);
        }

        let gate = TierGate::open_with_clock(config, Arc::new(StaticOracle::trusting()), clock).unwrap();
        assert_eq!(gate.engine().roster().len(), 7);
        assert_eq!(gate.gateway().grants().len(), 1);
        assert!(gate.gateway().verify_and_admit(&proof("tx", 25)).await.is_err());
    }

    #[tokio::test]
    async fn test_scheduler_opens_voting() {
        let clock = Arc::new(ManualClock::new(1_000));
        let gate = Arc::new(
            TierGate::in_memory(metal_config(), Arc::new(StaticOracle::trusting()), clock.clone()).unwrap(),
        );
        let id = gate
            .engine()
            .submit(ProposalSubmission {
                title: "Gold to 30".into(),
                body: String::new(),
                changes: vec![ParamChange::set("Gold.min_amount", ParamValue::Int(30))],
                majority: MajorityRule::Simple,
                proposer: "anyone".into(),
            })
            .unwrap();
        clock.advance(gate.config().governance.review_period_secs);

        let handle = gate.spawn_scheduler(Duration::from_millis(10));
        let mut status = ProposalStatus::Submitted;
        for _ in 0..100 {
            status = gate.engine().status(id).unwrap();
            if status == ProposalStatus::Voting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(status, ProposalStatus::Voting);
    }
}
