//! ============================================================================
//! Params Module - Governed protocol parameters
//! ============================================================================
//! Versioned, immutable parameter sets and the tiers derived from them.
//!
//! ## Key grammar
//! - `<Tier>.min_amount`: admission threshold (required per tier)
//! - `<Tier>.capabilities`: list of capabilities the tier grants
//! - `<Tier>.grant_ttl_secs` / `<Tier>.grant_max_uses`: grant policy
//! - `<Tier>.display_name`: human-readable name
//! - `accepted_assets`: optional asset allow-list
//! ============================================================================

mod store;
mod types;

pub use store::ParameterStore;
pub use types::{
    validate_changes, GrantPolicy, ParamChange, ParamValue, ParameterSet, Tier,
    ACCEPTED_ASSETS_KEY, DEFAULT_GRANT_MAX_USES, DEFAULT_GRANT_TTL_SECS,
};
