//! Committee governance over the parameter store

mod engine;
mod locks;
mod roster;
mod types;

pub use engine::{DecisionEngine, TickReport};
pub use roster::{CommitteeMember, Roster};
pub use types::{
    MajorityRule, Proposal, ProposalRecord, ProposalStatus, ProposalSubmission, RejectionReason,
    Resolution, ReviewComment, StatusChange, Tally, Vote, VoteChoice,
};
