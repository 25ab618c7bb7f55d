//! ============================================================================
//! Core Types for Tiergate
//! ============================================================================
//! Shared identifiers, the error taxonomy and the clock abstraction used by
//! the decision engine and the access gateway.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Proposal identifier (sequential, assigned by the decision engine)
pub type ProposalId = u64;

/// Committee member / proposer identity as authenticated upstream
pub type MemberId = String;

/// Access grant identifier
pub type GrantId = String;

/// Unix timestamp in seconds
pub type Timestamp = i64;

/// Error types for governance and admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum GateError {
    /// Malformed or unauthorized input; never retried automatically
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Parameter key write-locked by another in-flight proposal
    #[error("Parameter '{key}' is locked by proposal #{holder}")]
    Conflict { key: String, holder: ProposalId },

    /// The window for this action has closed
    #[error("Window closed: {0}")]
    TimeoutExpiry(String),

    /// Oracle rejected the proof or did not answer in time (caller may retry)
    #[error("Payment verification failed: {0}")]
    PaymentVerificationFailure(String),

    /// Settlement reference or grant already consumed
    #[error("Replay detected: {reference}")]
    ReplayDetected { reference: String },

    /// Amount is below the lowest tier
    #[error("No tier matches amount {amount}")]
    TierNotFound { amount: u64 },

    /// Optimistic publish lost against a concurrent publish
    #[error("Parameter version stale: based on v{expected}, current is v{current}")]
    ParameterVersionStale { expected: u64, current: u64 },

    #[error("Grant {grant_id} expired")]
    GrantExpired { grant_id: GrantId },

    #[error("Capability '{capability}' is not granted by tier {tier}")]
    CapabilityDenied { capability: String, tier: String },

    /// Persistence unavailable; admission and execution halt
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl GateError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GateError::Validation(msg.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        GateError::StorageUnavailable(err.to_string())
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::Conflict { .. }
                | GateError::PaymentVerificationFailure(_)
                | GateError::ParameterVersionStale { .. }
        )
    }
}

pub type GateResult<T> = std::result::Result<T, GateError>;

// ============================================================================
// Clock
// ============================================================================

/// Wall-clock source for deadlines and grant expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// System time via chrono
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        self.now.store(ts, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) -> Timestamp {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Lock helpers
// ============================================================================
// A panic while holding one of these guards leaves plain data behind, so the
// poisoned guard is recovered instead of propagating the panic.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
