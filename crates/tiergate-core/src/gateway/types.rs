//! ============================================================================
//! Gateway Types - Payment proofs and access grants
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::ledger::SettlementKey;
use crate::params::Tier;
use crate::types::{GateError, GateResult, GrantId, Timestamp};

/// Payment descriptor presented for admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub payer: String,
    /// Smallest unit of the asset (lamports for SOL)
    pub amount: u64,
    pub asset: String,
    /// External transaction reference (signature)
    pub tx_reference: String,
    pub nonce: String,
    pub timestamp: Timestamp,
}

impl PaymentProof {
    pub fn settlement_key(&self) -> SettlementKey {
        SettlementKey::new(self.tx_reference.clone(), self.nonce.clone())
    }

    /// Descriptor checks made before the oracle is consulted
    pub fn validate(&self) -> GateResult<()> {
        if self.payer.trim().is_empty() {
            return Err(GateError::validation("payment proof has no payer"));
        }
        if self.tx_reference.trim().is_empty() {
            return Err(GateError::validation("payment proof has no transaction reference"));
        }
        if self.nonce.trim().is_empty() {
            return Err(GateError::validation("payment proof has no nonce"));
        }
        if self.amount == 0 {
            return Err(GateError::validation("payment amount is zero"));
        }
        if self.asset.trim().is_empty() {
            return Err(GateError::validation("payment proof has no asset"));
        }
        Ok(())
    }
}

/// Capability grant issued for one settled payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub grant_id: GrantId,
    /// Bearer token presented on capability use
    pub token: String,
    pub payer: String,
    /// Tier as resolved at admission; later parameter versions do not touch it
    pub tier: Tier,
    pub param_version: u64,
    pub issued_at: Timestamp,
    /// None when the tier's policy has no time bound
    pub expires_at: Option<Timestamp>,
    /// 0 = unlimited
    pub max_uses: u32,
    pub uses: u32,
    pub consumed: bool,
    pub settlement: SettlementKey,
}

impl AccessGrant {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    /// Neither consumed nor expired
    pub fn is_usable(&self, now: Timestamp) -> bool {
        !self.consumed && !self.is_expired(now)
    }

    /// Uses left before the grant is consumed; None if unlimited
    pub fn remaining_uses(&self) -> Option<u32> {
        (self.max_uses > 0).then(|| self.max_uses.saturating_sub(self.uses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::GrantPolicy;
    use std::collections::BTreeSet;

    fn proof() -> PaymentProof {
        PaymentProof {
            payer: "payer".into(),
            amount: 10,
            asset: "SOL".into(),
            tx_reference: "sig".into(),
            nonce: "1".into(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_proof_validation() {
        assert!(proof().validate().is_ok());
        assert!(PaymentProof { payer: " ".into(), ..proof() }.validate().is_err());
        assert!(PaymentProof { amount: 0, ..proof() }.validate().is_err());
        assert!(PaymentProof { nonce: String::new(), ..proof() }.validate().is_err());
        assert!(PaymentProof { tx_reference: String::new(), ..proof() }.validate().is_err());
    }

    #[test]
    fn test_grant_expiry_and_uses() {
        let grant = AccessGrant {
            grant_id: "g".into(),
            token: "TKN_x".into(),
            payer: "payer".into(),
            tier: Tier {
                id: "base".into(),
                name: "base".into(),
                min_amount: 1,
                capabilities: BTreeSet::new(),
                grant_policy: GrantPolicy::default(),
                token_depth: 1,
            },
            param_version: 1,
            issued_at: 0,
            expires_at: Some(60),
            max_uses: 3,
            uses: 1,
            consumed: false,
            settlement: SettlementKey::new("sig", "1"),
        };
        assert!(grant.is_usable(59));
        assert!(!grant.is_usable(60));
        assert_eq!(grant.remaining_uses(), Some(2));

        let open = AccessGrant { expires_at: None, max_uses: 0, ..grant };
        assert!(open.is_usable(i64::MAX));
        assert_eq!(open.remaining_uses(), None);
    }
}
