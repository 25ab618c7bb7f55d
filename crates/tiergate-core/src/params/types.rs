//! ============================================================================
//! Parameter Types - Versioned parameter sets and the tiers derived from them
//! ============================================================================
//! Keys of the form `<Tier>.<field>` describe tiers; keys without a dot are
//! global protocol parameters. A parameter set is validated when it is built
//! and never mutated afterwards.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::types::{GateError, GateResult, ProposalId, Timestamp};

/// Grant lifetime used when a tier does not set `grant_ttl_secs`
pub const DEFAULT_GRANT_TTL_SECS: u64 = 3_600;

/// Grant use count used when a tier does not set `grant_max_uses`
pub const DEFAULT_GRANT_MAX_USES: u32 = 1;

/// Token rehash rounds used when a tier does not set `token_depth`
pub const DEFAULT_TOKEN_DEPTH: u32 = 1;

/// Upper bound on token rehash rounds
pub const MAX_TOKEN_DEPTH: u32 = 64;

/// Global key restricting admissible asset types
pub const ACCEPTED_ASSETS_KEY: &str = "accepted_assets";

const FIELD_MIN_AMOUNT: &str = "min_amount";
const FIELD_CAPABILITIES: &str = "capabilities";
const FIELD_GRANT_TTL: &str = "grant_ttl_secs";
const FIELD_GRANT_MAX_USES: &str = "grant_max_uses";
const FIELD_DISPLAY_NAME: &str = "display_name";
const FIELD_TOKEN_DEPTH: &str = "token_depth";

/// A single parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Int(u64),
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ParamValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
            ParamValue::List(v) => write!(f, "[{}]", v.join(",")),
        }
    }
}

/// Parses `15`, `[a,b]` or free text
impl FromStr for ParamValue {
    type Err = GateError;

    fn from_str(s: &str) -> GateResult<Self> {
        let s = s.trim();
        if let Ok(v) = s.parse::<u64>() {
            return Ok(ParamValue::Int(v));
        }
        if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let items = inner
                .split(',')
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect();
            return Ok(ParamValue::List(items));
        }
        if s.is_empty() {
            return Err(GateError::validation("empty parameter value"));
        }
        Ok(ParamValue::Text(s.to_string()))
    }
}

/// One change carried by a proposal; `None` removes the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamChange {
    pub key: String,
    pub value: Option<ParamValue>,
}

impl ParamChange {
    pub fn set(key: impl Into<String>, value: ParamValue) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn unset(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// How long and how often a grant may be used (0 = unbounded on that axis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantPolicy {
    pub ttl_secs: u64,
    pub max_uses: u32,
}

impl Default for GrantPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_GRANT_TTL_SECS,
            max_uses: DEFAULT_GRANT_MAX_USES,
        }
    }
}

/// Access tier unlocked by a payment of at least `min_amount`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: String,
    pub name: String,
    pub min_amount: u64,
    pub capabilities: BTreeSet<String>,
    pub grant_policy: GrantPolicy,
    /// Extra SHA-256 rounds applied when deriving this tier's access tokens
    pub token_depth: u32,
}

impl Tier {
    pub fn can_use(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Immutable snapshot of all protocol parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSet {
    version: u64,
    values: BTreeMap<String, ParamValue>,
    /// Derived from `values`, ascending by min_amount
    tiers: Vec<Tier>,
    effective_at: Timestamp,
    provenance: Option<ProposalId>,
}

impl ParameterSet {
    /// Version 1, seeded from configuration
    pub fn genesis(values: BTreeMap<String, ParamValue>, effective_at: Timestamp) -> GateResult<Self> {
        let tiers = build_tiers(&values)?;
        Ok(Self {
            version: 1,
            values,
            tiers,
            effective_at,
            provenance: None,
        })
    }

    /// Successor version with `changes` merged onto this one
    pub fn apply(
        &self,
        changes: &[ParamChange],
        effective_at: Timestamp,
        provenance: Option<ProposalId>,
    ) -> GateResult<Self> {
        validate_changes(changes)?;

        let mut values = self.values.clone();
        for change in changes {
            match &change.value {
                Some(value) => {
                    values.insert(change.key.clone(), value.clone());
                }
                None => {
                    if values.remove(&change.key).is_none() {
                        return Err(GateError::validation(format!(
                            "cannot unset missing parameter '{}'",
                            change.key
                        )));
                    }
                }
            }
        }

        let tiers = build_tiers(&values)?;
        Ok(Self {
            version: self.version + 1,
            values,
            tiers,
            effective_at,
            provenance,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn effective_at(&self) -> Timestamp {
        self.effective_at
    }

    pub fn provenance(&self) -> Option<ProposalId> {
        self.provenance
    }

    pub fn values(&self) -> &BTreeMap<String, ParamValue> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Tiers ascending by min_amount
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn tier(&self, id: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// Highest tier whose threshold the amount meets
    pub fn resolve_tier(&self, amount: u64) -> Option<&Tier> {
        self.tiers.iter().rev().find(|t| t.min_amount <= amount)
    }

    /// True when no asset restriction is configured or the asset is listed
    pub fn accepts_asset(&self, asset: &str) -> bool {
        match self.values.get(ACCEPTED_ASSETS_KEY).and_then(ParamValue::as_list) {
            Some(list) => list.iter().any(|a| a.eq_ignore_ascii_case(asset)),
            None => true,
        }
    }
}

/// Change list must be non-empty with unique, well-formed keys
pub fn validate_changes(changes: &[ParamChange]) -> GateResult<()> {
    if changes.is_empty() {
        return Err(GateError::validation("proposal changes no parameters"));
    }
    let mut seen = BTreeSet::new();
    for change in changes {
        validate_key(&change.key)?;
        if !seen.insert(change.key.as_str()) {
            return Err(GateError::validation(format!(
                "parameter '{}' changed twice",
                change.key
            )));
        }
    }
    Ok(())
}

fn validate_key(key: &str) -> GateResult<()> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(GateError::validation(format!("malformed parameter key '{}'", key)));
    }
    if let Some((tier, field)) = key.split_once('.') {
        if tier.is_empty() || field.is_empty() || field.contains('.') {
            return Err(GateError::validation(format!("malformed parameter key '{}'", key)));
        }
    }
    Ok(())
}

#[derive(Default)]
struct TierBuilder {
    name: Option<String>,
    min_amount: Option<u64>,
    capabilities: BTreeSet<String>,
    policy: GrantPolicy,
    token_depth: Option<u32>,
}

fn expect_int(key: &str, value: &ParamValue) -> GateResult<u64> {
    value
        .as_int()
        .ok_or_else(|| GateError::validation(format!("'{}' must be an integer", key)))
}

fn build_tiers(values: &BTreeMap<String, ParamValue>) -> GateResult<Vec<Tier>> {
    let mut builders: BTreeMap<&str, TierBuilder> = BTreeMap::new();

    for (key, value) in values {
        validate_key(key)?;
        let Some((tier_id, field)) = key.split_once('.') else {
            if key == ACCEPTED_ASSETS_KEY && value.as_list().is_none() {
                return Err(GateError::validation("'accepted_assets' must be a list"));
            }
            continue;
        };

        let builder = builders.entry(tier_id).or_default();
        match field {
            FIELD_MIN_AMOUNT => builder.min_amount = Some(expect_int(key, value)?),
            FIELD_GRANT_TTL => builder.policy.ttl_secs = expect_int(key, value)?,
            FIELD_GRANT_MAX_USES => {
                let uses = expect_int(key, value)?;
                builder.policy.max_uses = u32::try_from(uses)
                    .map_err(|_| GateError::validation(format!("'{}' is out of range", key)))?;
            }
            FIELD_TOKEN_DEPTH => {
                let depth = expect_int(key, value)?;
                match u32::try_from(depth) {
                    Ok(d) if (1..=MAX_TOKEN_DEPTH).contains(&d) => builder.token_depth = Some(d),
                    _ => {
                        return Err(GateError::validation(format!(
                            "'{}' must be between 1 and {}",
                            key, MAX_TOKEN_DEPTH
                        )))
                    }
                }
            }
            FIELD_CAPABILITIES => {
                let list = value
                    .as_list()
                    .ok_or_else(|| GateError::validation(format!("'{}' must be a list", key)))?;
                builder.capabilities = list.iter().cloned().collect();
            }
            FIELD_DISPLAY_NAME => {
                let name = value
                    .as_text()
                    .ok_or_else(|| GateError::validation(format!("'{}' must be text", key)))?;
                builder.name = Some(name.to_string());
            }
            other => {
                return Err(GateError::validation(format!(
                    "unknown tier field '{}' in '{}'",
                    other, key
                )))
            }
        }
    }

    let mut tiers = Vec::with_capacity(builders.len());
    for (id, builder) in builders {
        let min_amount = builder
            .min_amount
            .ok_or_else(|| GateError::validation(format!("tier '{}' has no min_amount", id)))?;
        if builder.policy.ttl_secs == 0 && builder.policy.max_uses == 0 {
            return Err(GateError::validation(format!(
                "tier '{}' grants would never expire",
                id
            )));
        }
        tiers.push(Tier {
            id: id.to_string(),
            name: builder.name.unwrap_or_else(|| id.to_string()),
            min_amount,
            capabilities: builder.capabilities,
            grant_policy: builder.policy,
            token_depth: builder.token_depth.unwrap_or(DEFAULT_TOKEN_DEPTH),
        });
    }

    tiers.sort_by_key(|t| t.min_amount);
    for pair in tiers.windows(2) {
        if pair[0].min_amount >= pair[1].min_amount {
            return Err(GateError::validation(format!(
                "tiers '{}' and '{}' share threshold {}",
                pair[0].id, pair[1].id, pair[1].min_amount
            )));
        }
    }

    Ok(tiers)
}
