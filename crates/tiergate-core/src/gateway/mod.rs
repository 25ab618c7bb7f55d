//! ============================================================================
//! Gateway Module - Payment-gated capability access
//! ============================================================================
//! Admission flow:
//! 1. Proof descriptor and asset checks
//! 2. Ledger oracle (bounded by a timeout)
//! 3. Replay check against the settlement ledger
//! 4. Tier resolution on the current parameter snapshot
//! 5. Settlement consumption, then grant issue
//! ============================================================================

mod gate;
mod oracle;
mod types;

pub use gate::AccessGateway;
pub use oracle::{
    verify_with_timeout, LedgerOracle, OracleVerdict, RpcLedgerOracle, StaticOracle,
    VerificationOutcome,
};
pub use types::{AccessGrant, PaymentProof};
