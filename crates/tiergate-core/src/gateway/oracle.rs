//! ============================================================================
//! Ledger Oracle - Payment authenticity and finality checks
//! ============================================================================
//! The gateway never trusts a proof on its own word: an oracle confirms that
//! the referenced transaction exists, succeeded and is final. Every call is
//! bounded by a timeout; a slow oracle fails the admission, it never stalls
//! it.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::PaymentProof;

/// Oracle answer for one proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub authentic: bool,
    pub finalized: bool,
}

impl OracleVerdict {
    pub fn accepted(&self) -> bool {
        self.authentic && self.finalized
    }
}

/// External verifier of payment proofs
#[async_trait]
pub trait LedgerOracle: Send + Sync {
    async fn verify(&self, proof: &PaymentProof) -> Result<OracleVerdict>;
}

/// Result of a bounded oracle call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    Rejected(String),
    TimedOut,
}

/// Ask the oracle, giving up after `timeout`
pub async fn verify_with_timeout(
    oracle: &dyn LedgerOracle,
    proof: &PaymentProof,
    timeout: Duration,
) -> VerificationOutcome {
    match tokio::time::timeout(timeout, oracle.verify(proof)).await {
        Err(_) => {
            warn!("Oracle timed out after {:?} for {}", timeout, proof.tx_reference);
            VerificationOutcome::TimedOut
        }
        Ok(Err(e)) => {
            warn!("Oracle error for {}: {}", proof.tx_reference, e);
            VerificationOutcome::Rejected(format!("oracle error: {}", e))
        }
        Ok(Ok(verdict)) if verdict.accepted() => VerificationOutcome::Verified,
        Ok(Ok(verdict)) => {
            debug!("Oracle verdict for {}: {:?}", proof.tx_reference, verdict);
            let reason = if !verdict.authentic {
                "transaction not found or failed"
            } else {
                "transaction not finalized"
            };
            VerificationOutcome::Rejected(reason.to_string())
        }
    }
}

/// Oracle returning a fixed verdict (offline runs and tests)
#[derive(Debug, Clone, Copy)]
pub struct StaticOracle {
    verdict: OracleVerdict,
}

impl StaticOracle {
    pub fn new(verdict: OracleVerdict) -> Self {
        Self { verdict }
    }

    /// Accepts every proof as authentic and final
    pub fn trusting() -> Self {
        Self::new(OracleVerdict {
            authentic: true,
            finalized: true,
        })
    }
}

#[async_trait]
impl LedgerOracle for StaticOracle {
    async fn verify(&self, _proof: &PaymentProof) -> Result<OracleVerdict> {
        Ok(self.verdict)
    }
}

/// Solana JSON-RPC oracle using `getSignatureStatuses`.
///
/// Confirms the transaction behind `tx_reference` landed without error at
/// `finalized` commitment. Amount and payer are taken from the proof as
/// presented.
pub struct RpcLedgerOracle {
    client: reqwest::Client,
    rpc_url: String,
}

impl RpcLedgerOracle {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build RPC client: {}", e))?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }
}

#[async_trait]
impl LedgerOracle for RpcLedgerOracle {
    async fn verify(&self, proof: &PaymentProof) -> Result<OracleVerdict> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getSignatureStatuses",
            "params": [[proof.tx_reference], { "searchTransactionHistory": true }],
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("RPC request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("RPC error {}: {}", status, body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse RPC response: {}", e))?;
        parse_signature_status(&body)
    }
}

/// Interpret a `getSignatureStatuses` response for a single signature
fn parse_signature_status(body: &Value) -> Result<OracleVerdict> {
    if let Some(error) = body.get("error") {
        return Err(anyhow!("RPC returned error: {}", error));
    }
    let status = body
        .pointer("/result/value/0")
        .ok_or_else(|| anyhow!("Malformed RPC response: {}", body))?;

    if status.is_null() {
        return Ok(OracleVerdict {
            authentic: false,
            finalized: false,
        });
    }

    let succeeded = status.get("err").map_or(true, Value::is_null);
    let finalized = status
        .get("confirmationStatus")
        .and_then(Value::as_str)
        .map_or(false, |s| s == "finalized");

    Ok(OracleVerdict {
        authentic: succeeded,
        finalized: succeeded && finalized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowOracle;

    #[async_trait]
    impl LedgerOracle for SlowOracle {
        async fn verify(&self, _proof: &PaymentProof) -> Result<OracleVerdict> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(OracleVerdict { authentic: true, finalized: true })
        }
    }

    struct FailingOracle;

    #[async_trait]
    impl LedgerOracle for FailingOracle {
        async fn verify(&self, _proof: &PaymentProof) -> Result<OracleVerdict> {
            Err(anyhow!("connection refused"))
        }
    }

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

    #[tokio::test]
    async fn test_outcomes() {
        let timeout = Duration::from_millis(50);
        assert_eq!(
            verify_with_timeout(&StaticOracle::trusting(), &proof(), timeout).await,
            VerificationOutcome::Verified
        );
        let pending = StaticOracle::new(OracleVerdict { authentic: true, finalized: false });
        assert_eq!(
            verify_with_timeout(&pending, &proof(), timeout).await,
            VerificationOutcome::Rejected("transaction not finalized".into())
        );
        assert!(matches!(
            verify_with_timeout(&FailingOracle, &proof(), timeout).await,
            VerificationOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_slow_oracle_times_out() {
        let outcome = verify_with_timeout(&SlowOracle, &proof(), Duration::from_millis(100)).await;
        assert_eq!(outcome, VerificationOutcome::TimedOut);
    }

    #[test]
    fn test_parse_signature_status() {
        let finalized = json!({
            "jsonrpc": "2.0",
            "result": {
                "context": { "slot": 82 },
                "value": [{ "slot": 72, "confirmations": null, "err": null, "confirmationStatus": "finalized" }]
            },
            "id": 1
        });
        assert_eq!(
            parse_signature_status(&finalized).unwrap(),
            OracleVerdict { authentic: true, finalized: true }
        );

        let confirmed = json!({
            "result": { "value": [{ "slot": 72, "confirmations": 10, "err": null, "confirmationStatus": "confirmed" }] }
        });
        assert_eq!(
            parse_signature_status(&confirmed).unwrap(),
            OracleVerdict { authentic: true, finalized: false }
        );

        let failed = json!({
            "result": { "value": [{ "slot": 72, "err": { "InstructionError": [0, "Custom"] }, "confirmationStatus": "finalized" }] }
        });
        assert!(!parse_signature_status(&failed).unwrap().accepted());

        let missing = json!({ "result": { "value": [null] } });
        assert_eq!(
            parse_signature_status(&missing).unwrap(),
            OracleVerdict { authentic: false, finalized: false }
        );

        assert!(parse_signature_status(&json!({ "error": { "code": -32602 } })).is_err());
        assert!(parse_signature_status(&json!({ "result": {} })).is_err());
    }
}
