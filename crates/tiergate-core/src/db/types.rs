//! ============================================================================
//! Database Types - Summary records for the redb store
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Row counts per table, proposals broken down by status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_members: usize,
    pub total_proposals: usize,
    pub proposal_counts: HashMap<String, usize>,
    pub param_versions: usize,
    pub total_settlements: usize,
    pub total_grants: usize,
}
