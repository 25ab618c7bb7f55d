//! ============================================================================
//! TIERGATE-CORE: Governed tiered access
//! ============================================================================
//! A seven-seat committee votes on protocol parameters; an admission gateway
//! turns verified payments into tiered capability grants under whatever
//! parameters are current:
//! - Parameter store with copy-on-write versioned snapshots
//! - Decision engine for proposals, review, voting and execution
//! - Settlement ledger for at-most-once payment consumption
//! - Access gateway with a pluggable ledger oracle
//! - redb persistence for all of the above
//! ============================================================================

pub mod config;
pub mod db;
pub mod gateway;
pub mod governance;
pub mod ledger;
pub mod params;
pub mod service;
pub mod types;

// Re-export main types for convenience
pub use config::{GatewayConfig, GenesisTier, GovernanceConfig, TierGateConfig};
pub use db::{DbStats, GateDb};
pub use gateway::{
    AccessGateway, AccessGrant, LedgerOracle, OracleVerdict, PaymentProof, RpcLedgerOracle,
    StaticOracle,
};
pub use governance::{
    CommitteeMember, DecisionEngine, MajorityRule, Proposal, ProposalStatus, ProposalSubmission,
    Tally, TickReport, VoteChoice,
};
pub use ledger::{SettlementKey, SettlementLedger, SettlementRecord};
pub use params::{ParamChange, ParamValue, ParameterSet, ParameterStore, Tier};
pub use service::{MaintenanceReport, TierGate};
pub use types::*;
