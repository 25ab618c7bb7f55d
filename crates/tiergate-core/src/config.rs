//! ============================================================================
//! Configuration - Governance windows, gateway limits and genesis tiers
//! ============================================================================
//! Defaults follow the committee charter (7 seats, quorum 5, supermajority
//! 5-of-7, 7 day review, 72 hour vote). Every value can be overridden from
//! `TIERGATE_*` environment variables.
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::params::ParamValue;

/// Lamports per SOL, the unit genesis thresholds are expressed in
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

const DAY_SECS: i64 = 86_400;
const HOUR_SECS: i64 = 3_600;

/// Decision engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Number of committee seats
    pub seats: u8,
    /// Minimum number of members who must vote (any choice)
    pub quorum_min: u32,
    /// Absolute Approve count required for supermajority proposals
    pub supermajority_approvals: u32,
    /// Review period after submission
    pub review_period_secs: i64,
    /// Voting window opened when review ends
    pub voting_window_secs: i64,
    /// Drafts never submitted expire after this long
    pub draft_ttl_secs: i64,
    /// Publish attempts per execution before giving up until the next tick
    pub max_publish_retries: u32,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            seats: 7,
            quorum_min: 5,
            supermajority_approvals: 5,
            review_period_secs: 7 * DAY_SECS,
            voting_window_secs: 72 * HOUR_SECS,
            draft_ttl_secs: 30 * DAY_SECS,
            max_publish_retries: 3,
        }
    }
}

impl GovernanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.seats == 0 {
            return Err(anyhow!("committee needs at least one seat"));
        }
        let seats = u32::from(self.seats);
        if self.quorum_min == 0 || self.quorum_min > seats {
            return Err(anyhow!("quorum {} must be within 1..={}", self.quorum_min, seats));
        }
        if self.supermajority_approvals == 0 || self.supermajority_approvals > seats {
            return Err(anyhow!(
                "supermajority {} must be within 1..={}",
                self.supermajority_approvals,
                seats
            ));
        }
        if self.review_period_secs <= 0 || self.voting_window_secs <= 0 || self.draft_ttl_secs <= 0 {
            return Err(anyhow!("governance windows must be positive"));
        }
        if self.max_publish_retries == 0 {
            return Err(anyhow!("max_publish_retries must be at least 1"));
        }
        Ok(())
    }
}

/// Access gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// JSON-RPC endpoint used by the ledger oracle
    pub oracle_url: String,
    /// Upper bound on a single oracle verification
    pub oracle_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            oracle_url: "https://api.mainnet-beta.solana.com".to_string(),
            oracle_timeout_ms: 5_000,
        }
    }
}

/// Tier seeded into parameter version 1 when the store is empty
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisTier {
    pub id: String,
    pub display_name: String,
    pub min_amount: u64,
    pub capabilities: Vec<String>,
    pub grant_ttl_secs: u64,
    pub grant_max_uses: u32,
    pub token_depth: u32,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierGateConfig {
    /// Database file; None resolves TIERGATE_DB_PATH or ~/.tiergate/tiergate.redb
    pub db_path: Option<String>,
    pub governance: GovernanceConfig,
    pub gateway: GatewayConfig,
    pub genesis_tiers: Vec<GenesisTier>,
    /// Scheduler period for timers and grant purging
    pub scheduler_interval_secs: u64,
}

impl Default for TierGateConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            governance: GovernanceConfig::default(),
            gateway: GatewayConfig::default(),
            genesis_tiers: default_genesis_tiers(),
            scheduler_interval_secs: 30,
        }
    }
}

impl TierGateConfig {
    /// Defaults overridden by TIERGATE_* environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TIERGATE_DB_PATH") {
            config.db_path = Some(path);
        }
        if let Ok(url) = std::env::var("TIERGATE_ORACLE_URL") {
            config.gateway.oracle_url = url;
        }
        if let Some(v) = env_parse("TIERGATE_ORACLE_TIMEOUT_MS")? {
            config.gateway.oracle_timeout_ms = v;
        }
        if let Some(v) = env_parse("TIERGATE_SEATS")? {
            config.governance.seats = v;
        }
        if let Some(v) = env_parse("TIERGATE_QUORUM")? {
            config.governance.quorum_min = v;
        }
        if let Some(v) = env_parse("TIERGATE_SUPERMAJORITY")? {
            config.governance.supermajority_approvals = v;
        }
        if let Some(v) = env_parse("TIERGATE_REVIEW_PERIOD_SECS")? {
            config.governance.review_period_secs = v;
        }
        if let Some(v) = env_parse("TIERGATE_VOTING_WINDOW_SECS")? {
            config.governance.voting_window_secs = v;
        }
        if let Some(v) = env_parse("TIERGATE_DRAFT_TTL_SECS")? {
            config.governance.draft_ttl_secs = v;
        }
        if let Some(v) = env_parse("TIERGATE_SCHEDULER_INTERVAL_SECS")? {
            config.scheduler_interval_secs = v;
        }

        config.governance.validate()?;
        Ok(config)
    }

    /// Parameter values for version 1
    pub fn genesis_values(&self) -> BTreeMap<String, ParamValue> {
        let mut values = BTreeMap::new();
        for tier in &self.genesis_tiers {
            values.insert(format!("{}.min_amount", tier.id), ParamValue::Int(tier.min_amount));
            values.insert(
                format!("{}.display_name", tier.id),
                ParamValue::Text(tier.display_name.clone()),
            );
            values.insert(
                format!("{}.capabilities", tier.id),
                ParamValue::List(tier.capabilities.clone()),
            );
            values.insert(
                format!("{}.grant_ttl_secs", tier.id),
                ParamValue::Int(tier.grant_ttl_secs),
            );
            values.insert(
                format!("{}.grant_max_uses", tier.id),
                ParamValue::Int(u64::from(tier.grant_max_uses)),
            );
            values.insert(
                format!("{}.token_depth", tier.id),
                ParamValue::Int(u64::from(tier.token_depth)),
            );
        }
        values
    }
}

/// Standard, enhanced and premium settlement tiers (0.01 / 0.05 / 0.10 SOL)
fn default_genesis_tiers() -> Vec<GenesisTier> {
    let caps = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        GenesisTier {
            id: "base".to_string(),
            display_name: "Standard settlement".to_string(),
            min_amount: LAMPORTS_PER_SOL / 100,
            capabilities: caps(&["fragment.read"]),
            grant_ttl_secs: 60,
            grant_max_uses: 1,
            token_depth: 1,
        },
        GenesisTier {
            id: "deeper".to_string(),
            display_name: "Enhanced settlement".to_string(),
            min_amount: LAMPORTS_PER_SOL / 20,
            capabilities: caps(&["fragment.read", "fragment.deep"]),
            grant_ttl_secs: 60,
            grant_max_uses: 1,
            token_depth: 3,
        },
        GenesisTier {
            id: "monolith".to_string(),
            display_name: "Premium settlement".to_string(),
            min_amount: LAMPORTS_PER_SOL / 10,
            capabilities: caps(&["fragment.read", "fragment.deep", "fragment.monolith", "queue.priority"]),
            grant_ttl_secs: 60,
            grant_max_uses: 1,
            token_depth: 5,
        },
    ]
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {}='{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}
