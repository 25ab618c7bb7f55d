//! Parameter-key write locks held by in-flight proposals.

use std::collections::HashMap;

use crate::types::{GateError, GateResult, ProposalId};

#[derive(Debug, Default)]
pub struct ParamLocks {
    held: HashMap<String, ProposalId>,
}

impl ParamLocks {
    /// Lock every key for `owner`, or none of them
    pub fn acquire(&mut self, owner: ProposalId, keys: &[String]) -> GateResult<()> {
        for key in keys {
            if let Some(&holder) = self.held.get(key) {
                if holder != owner {
                    return Err(GateError::Conflict {
                        key: key.clone(),
                        holder,
                    });
                }
            }
        }
        for key in keys {
            self.held.insert(key.clone(), owner);
        }
        Ok(())
    }

    /// Drop every lock held by `owner`; returns how many were released
    pub fn release(&mut self, owner: ProposalId) -> usize {
        let before = self.held.len();
        self.held.retain(|_, holder| *holder != owner);
        before - self.held.len()
    }

    pub fn holder(&self, key: &str) -> Option<ProposalId> {
        self.held.get(key).copied()
    }

    /// (key, holder) pairs sorted by key
    pub fn snapshot(&self) -> Vec<(String, ProposalId)> {
        let mut locks: Vec<_> = self.held.iter().map(|(k, v)| (k.clone(), *v)).collect();
        locks.sort();
        locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let mut locks = ParamLocks::default();
        locks.acquire(1, &keys(&["Silver.min_amount"])).unwrap();

        let err = locks
            .acquire(2, &keys(&["Gold.min_amount", "Silver.min_amount"]))
            .unwrap_err();
        assert_eq!(err, GateError::Conflict { key: "Silver.min_amount".into(), holder: 1 });
        assert_eq!(locks.holder("Gold.min_amount"), None);
    }

    #[test]
    fn test_release() {
        let mut locks = ParamLocks::default();
        locks.acquire(1, &keys(&["a", "b"])).unwrap();
        locks.acquire(2, &keys(&["c"])).unwrap();
        assert_eq!(locks.release(1), 2);
        assert_eq!(locks.snapshot(), vec![("c".to_string(), 2)]);
        locks.acquire(3, &keys(&["a"])).unwrap();
    }
}
