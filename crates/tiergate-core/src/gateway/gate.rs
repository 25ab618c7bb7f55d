//! ============================================================================
//! Access Gateway - Payment admission and capability checks
//! ============================================================================
//! Admission runs the proof past the oracle first and commits nothing until
//! it is verified. The tier is resolved against the parameter snapshot
//! current at that moment and copied into the grant, so a later parameter
//! version never changes a grant already issued.
//! ============================================================================

use anyhow::Result;
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::oracle::{verify_with_timeout, LedgerOracle, VerificationOutcome};
use super::types::{AccessGrant, PaymentProof};
use crate::config::GatewayConfig;
use crate::db::GateDb;
use crate::ledger::{SettlementLedger, SettlementRecord};
use crate::params::ParameterStore;
use crate::types::{Clock, GateError, GateResult, GrantId, Timestamp};

/// Admission control over the current parameter snapshot
pub struct AccessGateway {
    params: Arc<ParameterStore>,
    ledger: Arc<SettlementLedger>,
    oracle: Arc<dyn LedgerOracle>,
    grants: DashMap<GrantId, AccessGrant>,
    /// Bearer token -> grant id
    tokens: DashMap<String, GrantId>,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
    db: Option<Arc<GateDb>>,
}

impl AccessGateway {
    pub fn new(
        config: GatewayConfig,
        params: Arc<ParameterStore>,
        ledger: Arc<SettlementLedger>,
        oracle: Arc<dyn LedgerOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            params,
            ledger,
            oracle,
            grants: DashMap::new(),
            tokens: DashMap::new(),
            clock,
            config,
            db: None,
        }
    }

    /// Durable gateway; reloads outstanding grants
    pub fn with_db(
        config: GatewayConfig,
        params: Arc<ParameterStore>,
        ledger: Arc<SettlementLedger>,
        oracle: Arc<dyn LedgerOracle>,
        clock: Arc<dyn Clock>,
        db: Arc<GateDb>,
    ) -> Result<Self> {
        let mut gateway = Self::new(config, params, ledger, oracle, clock);
        for grant in db.list_grants()? {
            gateway.tokens.insert(grant.token.clone(), grant.grant_id.clone());
            gateway.grants.insert(grant.grant_id.clone(), grant);
        }
        info!("Access gateway loaded {} grants", gateway.grants.len());
        gateway.db = Some(db);
        Ok(gateway)
    }

    fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.config.oracle_timeout_ms)
    }

    /// Verify a payment proof and issue a grant for the tier it pays for
    pub async fn verify_and_admit(&self, proof: &PaymentProof) -> GateResult<AccessGrant> {
        proof.validate()?;
        if !self.params.current_version().accepts_asset(&proof.asset) {
            return Err(GateError::validation(format!(
                "asset '{}' is not accepted",
                proof.asset
            )));
        }

        match verify_with_timeout(self.oracle.as_ref(), proof, self.oracle_timeout()).await {
            VerificationOutcome::Verified => {}
            VerificationOutcome::Rejected(reason) => {
                return Err(GateError::PaymentVerificationFailure(reason));
            }
            VerificationOutcome::TimedOut => {
                return Err(GateError::PaymentVerificationFailure(format!(
                    "oracle did not answer within {}ms",
                    self.config.oracle_timeout_ms
                )));
            }
        }

        let key = proof.settlement_key();
        if self.ledger.contains(&key) {
            warn!("Rejected replayed proof {}", key);
            return Err(GateError::ReplayDetected {
                reference: key.to_string(),
            });
        }

        let snapshot = self.params.current_version();
        let tier = snapshot
            .resolve_tier(proof.amount)
            .cloned()
            .ok_or(GateError::TierNotFound { amount: proof.amount })?;

        let now = self.clock.now();
        let grant_id = uuid::Uuid::new_v4().to_string();

        // Consumption is the at-most-once point; a concurrent twin loses here
        self.ledger.consume(SettlementRecord {
            key: key.clone(),
            consumed_at: now,
            grant_id: grant_id.clone(),
            payer: proof.payer.clone(),
            amount: proof.amount,
            asset: proof.asset.clone(),
            param_version: snapshot.version(),
        })?;

        let policy = tier.grant_policy;
        let grant = AccessGrant {
            token: issue_token(&grant_id, &proof.payer, tier.token_depth),
            grant_id,
            payer: proof.payer.clone(),
            param_version: snapshot.version(),
            issued_at: now,
            expires_at: expiry(now, policy.ttl_secs),
            max_uses: policy.max_uses,
            uses: 0,
            consumed: false,
            settlement: key,
            tier,
        };

        self.persist(&grant)?;
        self.tokens.insert(grant.token.clone(), grant.grant_id.clone());
        self.grants.insert(grant.grant_id.clone(), grant.clone());

        info!(
            "Admitted {} for tier {} under v{} (grant {})",
            grant.payer, grant.tier.id, grant.param_version, grant.grant_id
        );
        Ok(grant)
    }

    /// Use `capability` against the grant behind `token`
    pub fn authorize(&self, token: &str, capability: &str) -> GateResult<AccessGrant> {
        let grant_id = self
            .tokens
            .get(token)
            .map(|id| id.value().clone())
            .ok_or_else(|| GateError::validation("unknown access token"))?;

        let mut entry = self
            .grants
            .get_mut(&grant_id)
            .ok_or_else(|| GateError::validation("unknown access token"))?;
        let grant = entry.value_mut();
        let now = self.clock.now();

        if grant.consumed {
            return Err(GateError::ReplayDetected {
                reference: grant.grant_id.clone(),
            });
        }
        if grant.is_expired(now) {
            return Err(GateError::GrantExpired {
                grant_id: grant.grant_id.clone(),
            });
        }
        if !grant.tier.can_use(capability) {
            return Err(GateError::CapabilityDenied {
                capability: capability.to_string(),
                tier: grant.tier.id.clone(),
            });
        }

        let mut next = grant.clone();
        next.uses += 1;
        if next.max_uses > 0 && next.uses >= next.max_uses {
            next.consumed = true;
        }
        self.persist(&next)?;
        *grant = next;

        debug!(
            "Grant {} used for {} ({} uses)",
            grant.grant_id, capability, grant.uses
        );
        Ok(grant.clone())
    }

    pub fn grant(&self, grant_id: &str) -> Option<AccessGrant> {
        self.grants.get(grant_id).map(|g| g.value().clone())
    }

    pub fn grant_by_token(&self, token: &str) -> Option<AccessGrant> {
        let grant_id = self.tokens.get(token).map(|id| id.value().clone())?;
        self.grant(&grant_id)
    }

    /// Grants still held, oldest first
    pub fn grants(&self) -> Vec<AccessGrant> {
        let mut grants: Vec<_> = self.grants.iter().map(|g| g.value().clone()).collect();
        grants.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.grant_id.cmp(&b.grant_id)));
        grants
    }

    /// Drop consumed and expired grants; their settlement records remain
    pub fn purge_expired(&self) -> GateResult<usize> {
        let now = self.clock.now();
        let stale: Vec<GrantId> = self
            .grants
            .iter()
            .filter(|g| !g.is_usable(now))
            .map(|g| g.key().clone())
            .collect();

        let mut purged = 0;
        for grant_id in stale {
            if let Some(db) = &self.db {
                db.delete_grant(&grant_id).map_err(|e| {
                    error!("Failed to delete grant {}: {}", grant_id, e);
                    GateError::storage(e)
                })?;
            }
            if let Some((_, grant)) = self.grants.remove_if(&grant_id, |_, g| !g.is_usable(now)) {
                self.tokens.remove(&grant.token);
                purged += 1;
            }
        }

        if purged > 0 {
            info!("Purged {} expired grants", purged);
        }
        Ok(purged)
    }

    fn persist(&self, grant: &AccessGrant) -> GateResult<()> {
        if let Some(db) = &self.db {
            db.store_grant(grant).map_err(|e| {
                error!("Failed to persist grant {}: {}", grant.grant_id, e);
                GateError::storage(e)
            })?;
        }
        Ok(())
    }
}

fn expiry(now: Timestamp, ttl_secs: u64) -> Option<Timestamp> {
    if ttl_secs == 0 {
        return None;
    }
    Some(now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX)))
}

/// Opaque bearer token: `TKN_<payer prefix>_<digest>`
fn issue_token(grant_id: &str, payer: &str, depth: u32) -> String {
    let seed: [u8; 32] = rand::thread_rng().gen();
    derive_token(&seed, grant_id, payer, depth)
}

/// Seeded digest rehashed `depth` more times; higher tiers carry deeper tokens
fn derive_token(seed: &[u8], grant_id: &str, payer: &str, depth: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(b"|");
    hasher.update(depth.to_be_bytes());
    hasher.update(b"|");
    hasher.update(grant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(payer.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 0..depth {
        digest = Sha256::digest(digest);
    }
    let digest = hex::encode(digest);
    let prefix: String = payer.chars().take(8).collect();
    format!("TKN_{}_{}", prefix, &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::FailingBackend;
    use crate::gateway::oracle::{OracleVerdict, StaticOracle};
    use crate::ledger::SettlementKey;
    use crate::params::{ParamChange, ParamValue, ParameterSet};
    use crate::types::ManualClock;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and can be told to hang
    struct MockOracle {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl LedgerOracle for MockOracle {
        async fn verify(&self, _proof: &PaymentProof) -> anyhow::Result<OracleVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(OracleVerdict { authentic: true, finalized: true })
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        params: Arc<ParameterStore>,
        ledger: Arc<SettlementLedger>,
        gateway: Arc<AccessGateway>,
    }

    fn genesis() -> ParameterSet {
        let mut values = BTreeMap::new();
        let caps = |c: &[&str]| ParamValue::List(c.iter().map(|s| s.to_string()).collect());
        values.insert("Bronze.min_amount".to_string(), ParamValue::Int(5));
        values.insert("Bronze.capabilities".to_string(), caps(&["read"]));
        values.insert("Silver.min_amount".to_string(), ParamValue::Int(10));
        values.insert("Silver.capabilities".to_string(), caps(&["read", "deep"]));
        values.insert("Silver.grant_ttl_secs".to_string(), ParamValue::Int(60));
        values.insert("Silver.grant_max_uses".to_string(), ParamValue::Int(2));
        values.insert("Gold.min_amount".to_string(), ParamValue::Int(20));
        values.insert("Gold.capabilities".to_string(), caps(&["read", "deep", "priority"]));
        values.insert("Gold.grant_max_uses".to_string(), ParamValue::Int(0));
        ParameterSet::genesis(values, 0).unwrap()
    }

    fn fixture_with(oracle: Arc<dyn LedgerOracle>, timeout_ms: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let params = Arc::new(ParameterStore::new(genesis()));
        let ledger = Arc::new(SettlementLedger::in_memory());
        let config = GatewayConfig {
            oracle_timeout_ms: timeout_ms,
            ..Default::default()
        };
        let gateway = Arc::new(AccessGateway::new(
            config,
            params.clone(),
            ledger.clone(),
            oracle,
            clock.clone(),
        ));
        Fixture {
            clock,
            params,
            ledger,
            gateway,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(StaticOracle::trusting()), 1_000)
    }

    fn proof(tx: &str, amount: u64) -> PaymentProof {
        PaymentProof {
            payer: "payer-wallet".into(),
            amount,
            asset: "SOL".into(),
            tx_reference: tx.into(),
            nonce: "n1".into(),
            timestamp: 1_000,
        }
    }

    #[tokio::test]
    async fn test_admit_resolves_tier() {
        let f = fixture();
        let grant = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap();
        assert_eq!(grant.tier.id, "Silver");
        assert_eq!(grant.param_version, 1);
        assert_eq!(grant.expires_at, Some(1_060));
        assert_eq!(grant.max_uses, 2);
        assert!(grant.token.starts_with("TKN_payer-wa_"));
        assert_eq!(grant.token.len(), "TKN_payer-wa_".len() + 32);

        let record = f.ledger.get(&grant.settlement).unwrap();
        assert_eq!(record.grant_id, grant.grant_id);

        let gold = f.gateway.verify_and_admit(&proof("tx2", 1_000)).await.unwrap();
        assert_eq!(gold.tier.id, "Gold");
        assert_eq!(gold.expires_at, Some(1_000 + 3_600));
    }

    #[test]
    fn test_token_depth_rehashes_digest() {
        let seed = [7u8; 32];
        let shallow = derive_token(&seed, "g1", "payer-wallet", 1);
        assert_eq!(shallow, derive_token(&seed, "g1", "payer-wallet", 1));
        assert_ne!(shallow, derive_token(&seed, "g1", "payer-wallet", 5));
        assert!(shallow.starts_with("TKN_payer-wa_"));

        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(b"|");
        hasher.update(3u32.to_be_bytes());
        hasher.update(b"|g1|payer-wallet");
        let mut digest = hasher.finalize();
        for _ in 0..3 {
            digest = Sha256::digest(digest);
        }
        let expected = format!("TKN_payer-wa_{}", &hex::encode(digest)[..32]);
        assert_eq!(derive_token(&seed, "g1", "payer-wallet", 3), expected);
    }

    #[tokio::test]
    async fn test_below_lowest_tier() {
        let f = fixture();
        let err = f.gateway.verify_and_admit(&proof("tx1", 4)).await.unwrap_err();
        assert_eq!(err, GateError::TierNotFound { amount: 4 });
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let f = fixture();
        f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap();
        let err = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap_err();
        assert_eq!(err, GateError::ReplayDetected { reference: "tx1/n1".into() });
        assert_eq!(f.gateway.grants().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replay_single_grant() {
        let f = fixture();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gateway = f.gateway.clone();
                tokio::spawn(async move { gateway.verify_and_admit(&proof("race", 25)).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(e) => assert!(matches!(e, GateError::ReplayDetected { .. })),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(f.ledger.len(), 1);
        assert_eq!(f.gateway.grants().len(), 1);
    }

    #[tokio::test]
    async fn test_oracle_timeout_commits_nothing() {
        let oracle = Arc::new(MockOracle {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(5),
        });
        let f = fixture_with(oracle.clone(), 50);
        let err = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap_err();
        assert!(matches!(err, GateError::PaymentVerificationFailure(_)));
        assert!(err.is_retryable());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert!(f.ledger.is_empty());
        assert!(f.gateway.grants().is_empty());
    }

    #[tokio::test]
    async fn test_unverified_proof_rejected() {
        let oracle = Arc::new(StaticOracle::new(OracleVerdict { authentic: false, finalized: false }));
        let f = fixture_with(oracle, 1_000);
        let err = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap_err();
        assert!(matches!(err, GateError::PaymentVerificationFailure(_)));
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_asset_allow_list() {
        let f = fixture();
        let base = f.params.current_version();
        let next = base
            .apply(
                &[ParamChange::set("accepted_assets", ParamValue::List(vec!["USDC".into()]))],
                1_000,
                None,
            )
            .unwrap();
        f.params.publish(1, next).unwrap();

        let err = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap_err();
        assert!(matches!(err, GateError::Validation(_)));
        let usdc = PaymentProof { asset: "usdc".into(), ..proof("tx1", 12) };
        f.gateway.verify_and_admit(&usdc).await.unwrap();
    }

    #[tokio::test]
    async fn test_hot_swap_keeps_issued_tier() {
        let f = fixture();
        let before = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap();
        assert_eq!(before.tier.id, "Silver");

        let base = f.params.current_version();
        let next = base
            .apply(&[ParamChange::set("Silver.min_amount", ParamValue::Int(15))], 1_000, Some(1))
            .unwrap();
        f.params.publish(1, next).unwrap();

        let after = f.gateway.verify_and_admit(&proof("tx2", 12)).await.unwrap();
        assert_eq!(after.tier.id, "Bronze");
        assert_eq!(after.param_version, 2);

        // The earlier grant still carries Silver capabilities
        let used = f.gateway.authorize(&before.token, "deep").unwrap();
        assert_eq!(used.tier.id, "Silver");
        assert_eq!(used.param_version, 1);
        assert!(matches!(
            f.gateway.authorize(&after.token, "deep"),
            Err(GateError::CapabilityDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_authorize_consumes_per_policy() {
        let f = fixture();
        let grant = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap();

        assert!(matches!(
            f.gateway.authorize("TKN_nope", "read"),
            Err(GateError::Validation(_))
        ));
        assert!(matches!(
            f.gateway.authorize(&grant.token, "priority"),
            Err(GateError::CapabilityDenied { .. })
        ));

        let first = f.gateway.authorize(&grant.token, "read").unwrap();
        assert_eq!(first.uses, 1);
        assert!(!first.consumed);
        let second = f.gateway.authorize(&grant.token, "read").unwrap();
        assert!(second.consumed);
        assert_eq!(
            f.gateway.authorize(&grant.token, "read"),
            Err(GateError::ReplayDetected { reference: grant.grant_id.clone() })
        );
    }

    #[tokio::test]
    async fn test_grant_expiry_and_purge() {
        let f = fixture();
        let silver = f.gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap();
        let gold = f.gateway.verify_and_admit(&proof("tx2", 30)).await.unwrap();

        f.clock.advance(60);
        assert_eq!(
            f.gateway.authorize(&silver.token, "read"),
            Err(GateError::GrantExpired { grant_id: silver.grant_id.clone() })
        );
        // Gold grants are unlimited in uses but still time-bound
        for _ in 0..5 {
            f.gateway.authorize(&gold.token, "priority").unwrap();
        }

        assert_eq!(f.gateway.purge_expired().unwrap(), 1);
        assert!(f.gateway.grant(&silver.grant_id).is_none());
        assert!(f.gateway.grant_by_token(&silver.token).is_none());
        assert!(f.gateway.grant(&gold.grant_id).is_some());
        // Replay protection outlives the grant
        assert_eq!(f.ledger.len(), 2);
        assert!(matches!(
            f.gateway.verify_and_admit(&proof("tx1", 12)).await,
            Err(GateError::ReplayDetected { .. })
        ));
    }

    #[tokio::test]
    async fn test_durable_gateway_reloads_grants() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gateway.redb");
        let clock = Arc::new(ManualClock::new(1_000));
        let params = Arc::new(ParameterStore::new(genesis()));

        let token = {
            let db = Arc::new(GateDb::open(path.to_str()).unwrap());
            let ledger = Arc::new(SettlementLedger::with_db(db.clone()).unwrap());
            let gateway = AccessGateway::with_db(
                GatewayConfig::default(),
                params.clone(),
                ledger,
                Arc::new(StaticOracle::trusting()),
                clock.clone(),
                db,
            )
            .unwrap();
            let grant = gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap();
            gateway.authorize(&grant.token, "read").unwrap();
            grant.token
        };

        let db = Arc::new(GateDb::open(path.to_str()).unwrap());
        let ledger = Arc::new(SettlementLedger::with_db(db.clone()).unwrap());
        let gateway = AccessGateway::with_db(
            GatewayConfig::default(),
            params,
            ledger,
            Arc::new(StaticOracle::trusting()),
            clock,
            db,
        )
        .unwrap();
        assert_eq!(gateway.grant_by_token(&token).unwrap().uses, 1);
        assert!(gateway.authorize(&token, "read").unwrap().consumed);
        assert!(matches!(
            gateway.verify_and_admit(&proof("tx1", 12)).await,
            Err(GateError::ReplayDetected { .. })
        ));
    }

    #[tokio::test]
    async fn test_grant_write_failure_keeps_settlement_consumed() {
        let clock = Arc::new(ManualClock::new(1_000));
        let params = Arc::new(ParameterStore::new(genesis()));
        let ledger = Arc::new(SettlementLedger::in_memory());
        let (backend, failing) = FailingBackend::new();
        let db = Arc::new(GateDb::with_backend(backend, "memory").unwrap());
        let gateway = AccessGateway::with_db(
            GatewayConfig::default(),
            params,
            ledger.clone(),
            Arc::new(StaticOracle::trusting()),
            clock,
            db,
        )
        .unwrap();

        failing.store(true, Ordering::SeqCst);
        let err = gateway.verify_and_admit(&proof("tx1", 12)).await.unwrap_err();
        assert!(matches!(err, GateError::StorageUnavailable(_)));
        assert!(gateway.grants().is_empty());

        // Fails closed: the proof cannot be spent a second time
        assert!(ledger.contains(&SettlementKey::new("tx1", "n1")));
        assert!(matches!(
            gateway.verify_and_admit(&proof("tx1", 12)).await,
            Err(GateError::ReplayDetected { .. })
        ));
    }
}
