//! ============================================================================
//! Governance Types - Proposals, votes, tallies and majority rules
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::params::ParamChange;
use crate::types::{MemberId, ProposalId, Timestamp};

/// Proposal lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Submitted,
    UnderReview,
    Voting,
    Approved,
    Rejected,
    /// Draft never submitted
    Expired,
    Executed,
    Withdrawn,
}

impl ProposalStatus {
    /// Statuses that keep the target keys write-locked
    pub fn holds_lock(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Submitted
                | ProposalStatus::UnderReview
                | ProposalStatus::Voting
                | ProposalStatus::Approved
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Rejected
                | ProposalStatus::Expired
                | ProposalStatus::Executed
                | ProposalStatus::Withdrawn
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "under_review" | "underreview" => Some(Self::UnderReview),
            "voting" => Some(Self::Voting),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "executed" => Some(Self::Executed),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }
}

/// Approval rule a proposal is decided under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MajorityRule {
    /// More approvals than rejections and a strict majority of participants
    Simple,
    /// Absolute approval count, independent of turnout above quorum
    Supermajority,
}

impl MajorityRule {
    pub fn evaluate(&self, tally: &Tally, supermajority_approvals: u32) -> bool {
        match self {
            MajorityRule::Simple => simple_majority(tally),
            MajorityRule::Supermajority => supermajority(tally, supermajority_approvals),
        }
    }
}

fn simple_majority(tally: &Tally) -> bool {
    tally.approve > tally.reject && tally.approve * 2 > tally.participation()
}

fn supermajority(tally: &Tally, required: u32) -> bool {
    tally.approve >= required
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

impl VoteChoice {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "approve" | "yes" | "for" => Some(Self::Approve),
            "reject" | "no" | "against" => Some(Self::Reject),
            "abstain" => Some(Self::Abstain),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: ProposalId,
    pub member_id: MemberId,
    pub choice: VoteChoice,
    pub cast_at: Timestamp,
}

/// Vote counts at close
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approve: u32,
    pub reject: u32,
    pub abstain: u32,
}

impl Tally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        let mut tally = Tally::default();
        for vote in votes {
            match vote.choice {
                VoteChoice::Approve => tally.approve += 1,
                VoteChoice::Reject => tally.reject += 1,
                VoteChoice::Abstain => tally.abstain += 1,
            }
        }
        tally
    }

    /// Members who voted at all; abstentions count toward quorum
    pub fn participation(&self) -> u32 {
        self.approve + self.reject + self.abstain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    QuorumFailure { participation: u32, quorum: u32 },
    MajorityNotReached,
}

/// Outcome recorded when the voting window closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub closed_at: Timestamp,
    pub tally: Tally,
    pub approved: bool,
    pub reason: Option<RejectionReason>,
}

/// Opaque review note attached during the review period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub member_id: MemberId,
    pub body: String,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: ProposalStatus,
    pub at: Timestamp,
}

/// Input of the submission interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalSubmission {
    pub title: String,
    pub body: String,
    pub changes: Vec<ParamChange>,
    pub majority: MajorityRule,
    pub proposer: MemberId,
}

/// Proposal as exposed by the query interface (votes excluded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub title: String,
    pub body: String,
    pub proposer: MemberId,
    pub changes: Vec<ParamChange>,
    pub majority: MajorityRule,
    pub status: ProposalStatus,
    pub created_at: Timestamp,
    pub submitted_at: Option<Timestamp>,
    pub review_ends_at: Option<Timestamp>,
    pub voting_ends_at: Option<Timestamp>,
    pub resolution: Option<Resolution>,
    pub executed_version: Option<u64>,
    pub execution_attempts: u32,
    pub last_execution_error: Option<String>,
    pub comments: Vec<ReviewComment>,
    pub history: Vec<StatusChange>,
}

impl Proposal {
    pub fn target_keys(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.key.clone()).collect()
    }

    pub(crate) fn transition(&mut self, status: ProposalStatus, at: Timestamp) {
        self.status = status;
        self.history.push(StatusChange { status, at });
    }
}

/// Proposal plus its ballots; the unit persisted and locked per proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal: Proposal,
    pub(crate) votes: BTreeMap<MemberId, Vote>,
}

impl ProposalRecord {
    pub(crate) fn new(proposal: Proposal) -> Self {
        Self {
            proposal,
            votes: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(approve: u32, reject: u32, abstain: u32) -> Tally {
        Tally {
            approve,
            reject,
            abstain,
        }
    }

    #[test]
    fn test_supermajority_is_absolute() {
        assert!(MajorityRule::Supermajority.evaluate(&tally(5, 0, 0), 5));
        assert!(MajorityRule::Supermajority.evaluate(&tally(5, 2, 0), 5));
        assert!(!MajorityRule::Supermajority.evaluate(&tally(4, 3, 0), 5));
        assert!(!MajorityRule::Supermajority.evaluate(&tally(4, 0, 3), 5));
    }

    #[test]
    fn test_simple_majority() {
        assert!(MajorityRule::Simple.evaluate(&tally(4, 1, 0), 5));
        // Tie
        assert!(!MajorityRule::Simple.evaluate(&tally(3, 3, 1), 5));
        // More approvals than rejections but not a majority of participants
        assert!(!MajorityRule::Simple.evaluate(&tally(2, 1, 2), 5));
        assert!(MajorityRule::Simple.evaluate(&tally(3, 1, 1), 5));
    }

    #[test]
    fn test_participation_counts_abstentions() {
        assert_eq!(tally(1, 2, 3).participation(), 6);
    }

    #[test]
    fn test_status_lock_sets() {
        assert!(ProposalStatus::Voting.holds_lock());
        assert!(ProposalStatus::Approved.holds_lock());
        assert!(!ProposalStatus::Draft.holds_lock());
        assert!(!ProposalStatus::Executed.holds_lock());
        assert!(ProposalStatus::Withdrawn.is_terminal());
        assert!(!ProposalStatus::Approved.is_terminal());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(ProposalStatus::parse("under-review"), Some(ProposalStatus::UnderReview));
        assert_eq!(VoteChoice::parse("Approve"), Some(VoteChoice::Approve));
        assert_eq!(VoteChoice::parse("maybe"), None);
    }
}
