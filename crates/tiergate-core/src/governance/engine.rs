//! ============================================================================
//! Decision Engine - Proposal lifecycle, voting and parameter execution
//! ============================================================================
//! Each proposal record sits behind its own mutex, so ballots and closes on
//! one proposal are serialized while different proposals progress in
//! parallel. The parameter-key lock table is the only state shared between
//! proposals and is touched only by submission and resolution.
//!
//! Timers are deadlines stored on the proposal. They are applied lazily by
//! every operation touching a proposal and eagerly by `tick`, so a missed
//! scheduler run never lets a vote land after its window.
//!
//! Mutations are applied to a copy of the record, persisted, and only then
//! committed to memory; a storage failure leaves the previous state intact.
//! ============================================================================

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::locks::ParamLocks;
use super::roster::{CommitteeMember, Roster};
use super::types::{
    Proposal, ProposalRecord, ProposalStatus, ProposalSubmission, RejectionReason, Resolution,
    ReviewComment, Tally, Vote, VoteChoice,
};
use crate::config::GovernanceConfig;
use crate::db::GateDb;
use crate::params::{validate_changes, ParameterStore};
use crate::types::{lock, read, write, Clock, GateError, GateResult, ProposalId, Timestamp};

/// What a scheduler pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub voting_opened: usize,
    pub approved: usize,
    pub rejected: usize,
    pub executed: usize,
    pub drafts_expired: usize,
    /// Approved proposals still waiting for a successful publish
    pub pending_execution: usize,
}

/// Governance state machine over proposals and the committee roster
pub struct DecisionEngine {
    config: GovernanceConfig,
    clock: Arc<dyn Clock>,
    params: Arc<ParameterStore>,
    roster: RwLock<Roster>,
    proposals: DashMap<ProposalId, Arc<Mutex<ProposalRecord>>>,
    locks: Mutex<ParamLocks>,
    next_id: AtomicU64,
    db: Option<Arc<GateDb>>,
}

impl DecisionEngine {
    /// Volatile engine with an empty roster
    pub fn new(config: GovernanceConfig, clock: Arc<dyn Clock>, params: Arc<ParameterStore>) -> Self {
        Self {
            roster: RwLock::new(Roster::new(config.seats)),
            config,
            clock,
            params,
            proposals: DashMap::new(),
            locks: Mutex::new(ParamLocks::default()),
            next_id: AtomicU64::new(1),
            db: None,
        }
    }

    /// Durable engine: loads the roster and every proposal, and rebuilds the
    /// write-locks of proposals still in flight.
    pub fn open(
        config: GovernanceConfig,
        clock: Arc<dyn Clock>,
        params: Arc<ParameterStore>,
        db: Arc<GateDb>,
    ) -> Result<Self> {
        let roster = Roster::from_members(config.seats, db.list_members()?)?;

        let proposals = DashMap::new();
        let mut locks = ParamLocks::default();
        let mut max_id = 0;
        for record in db.list_proposals()? {
            let id = record.proposal.id;
            if record.proposal.status.holds_lock() {
                locks.acquire(id, &record.proposal.target_keys())?;
            }
            max_id = max_id.max(id);
            proposals.insert(id, Arc::new(Mutex::new(record)));
        }

        info!(
            "Decision engine loaded {} members, {} proposals",
            roster.members().len(),
            proposals.len()
        );

        Ok(Self {
            config,
            clock,
            params,
            roster: RwLock::new(roster),
            proposals,
            locks: Mutex::new(locks),
            next_id: AtomicU64::new(max_id + 1),
            db: Some(db),
        })
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    // ========================================================================
    // Roster
    // ========================================================================

    pub fn roster(&self) -> Vec<CommitteeMember> {
        read(&self.roster).members().to_vec()
    }

    /// Seat `member_id` for the given term
    pub fn seat_member(
        &self,
        member_id: &str,
        seat: u8,
        term_start: Timestamp,
        term_end: Timestamp,
    ) -> GateResult<CommitteeMember> {
        let now = self.clock.now();
        let mut roster = write(&self.roster);
        let mut next = roster.clone();
        let changed = next.seat(
            CommitteeMember {
                member_id: member_id.trim().to_string(),
                seat,
                term_start,
                term_end,
                active: true,
            },
            now,
        )?;
        for member in &changed {
            self.persist_member(member)?;
        }
        *roster = next;
        changed
            .into_iter()
            .last()
            .ok_or_else(|| GateError::validation("seat produced no member"))
    }

    pub fn vacate_seat(&self, seat: u8) -> GateResult<CommitteeMember> {
        let mut roster = write(&self.roster);
        let mut next = roster.clone();
        let retired = next.vacate(seat)?;
        self.persist_member(&retired)?;
        *roster = next;
        Ok(retired)
    }

    fn require_eligible(&self, member_id: &str, now: Timestamp) -> GateResult<()> {
        if read(&self.roster).eligible(member_id, now).is_none() {
            return Err(GateError::validation(format!(
                "'{}' is not a seated committee member",
                member_id
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Submission
    // ========================================================================

    fn validate_submission(&self, sub: &ProposalSubmission, now: Timestamp) -> GateResult<()> {
        if sub.title.trim().is_empty() {
            return Err(GateError::validation("proposal title is empty"));
        }
        if sub.proposer.trim().is_empty() {
            return Err(GateError::validation("proposer is not identified"));
        }
        validate_changes(&sub.changes)?;
        // The merged set must be publishable today
        self.params.current_version().apply(&sub.changes, now, None)?;
        Ok(())
    }

    fn new_proposal(&self, sub: ProposalSubmission, now: Timestamp) -> Proposal {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut proposal = Proposal {
            id,
            title: sub.title.trim().to_string(),
            body: sub.body,
            proposer: sub.proposer.trim().to_string(),
            changes: sub.changes,
            majority: sub.majority,
            status: ProposalStatus::Draft,
            created_at: now,
            submitted_at: None,
            review_ends_at: None,
            voting_ends_at: None,
            resolution: None,
            executed_version: None,
            execution_attempts: 0,
            last_execution_error: None,
            comments: Vec::new(),
            history: Vec::new(),
        };
        proposal.transition(ProposalStatus::Draft, now);
        proposal
    }

    fn start_review(&self, proposal: &mut Proposal, now: Timestamp) {
        proposal.submitted_at = Some(now);
        proposal.review_ends_at = Some(now + self.config.review_period_secs);
        proposal.transition(ProposalStatus::Submitted, now);
    }

    /// Store a draft; no locks, no timers
    pub fn draft(&self, sub: ProposalSubmission) -> GateResult<ProposalId> {
        let now = self.clock.now();
        self.validate_submission(&sub, now)?;

        let record = ProposalRecord::new(self.new_proposal(sub, now));
        let id = record.proposal.id;
        self.persist(&record)?;
        self.proposals.insert(id, Arc::new(Mutex::new(record)));

        info!("Drafted proposal #{}", id);
        Ok(id)
    }

    /// Submit a proposal: validate, take the write-locks, start review
    pub fn submit(&self, sub: ProposalSubmission) -> GateResult<ProposalId> {
        let now = self.clock.now();
        self.validate_submission(&sub, now)?;

        let mut proposal = self.new_proposal(sub, now);
        let id = proposal.id;
        let keys = proposal.target_keys();
        self.start_review(&mut proposal, now);
        let record = ProposalRecord::new(proposal);

        // Held until the record is visible so a lock never names a missing proposal
        let mut locks = lock(&self.locks);
        if let Err(e) = locks.acquire(id, &keys) {
            warn!("Proposal submission conflicts: {}", e);
            return Err(e);
        }
        if let Err(e) = self.persist(&record) {
            locks.release(id);
            return Err(e);
        }
        self.proposals.insert(id, Arc::new(Mutex::new(record)));
        drop(locks);

        info!(
            "Submitted proposal #{} targeting {:?}; review ends at {}",
            id,
            keys,
            now + self.config.review_period_secs
        );
        Ok(id)
    }

    /// Submit a previously drafted proposal
    pub fn submit_draft(&self, id: ProposalId, proposer: &str) -> GateResult<()> {
        let now = self.clock.now();
        self.update(id, |engine, next| {
            engine.drive(next, now, false);
            let proposal = &mut next.proposal;
            if proposal.status != ProposalStatus::Draft {
                return Err(GateError::validation(format!(
                    "proposal #{} is {:?}, not a draft",
                    id, proposal.status
                )));
            }
            if proposal.proposer != proposer.trim() {
                return Err(GateError::validation("only the proposer may submit a draft"));
            }
            engine.params.current_version().apply(&proposal.changes, now, None)?;
            lock(&engine.locks).acquire(id, &proposal.target_keys())?;
            engine.start_review(proposal, now);
            Ok(())
        })
    }

    /// Withdraw a proposal before voting opens; releases its locks
    pub fn withdraw(&self, id: ProposalId, requester: &str) -> GateResult<()> {
        let now = self.clock.now();
        self.update(id, |engine, next| {
            engine.drive(next, now, false);
            let proposal = &mut next.proposal;
            if proposal.proposer != requester.trim() {
                return Err(GateError::validation("only the proposer may withdraw"));
            }
            match proposal.status {
                ProposalStatus::Draft | ProposalStatus::Submitted => {
                    proposal.transition(ProposalStatus::Withdrawn, now);
                    info!("Proposal #{} withdrawn", id);
                    Ok(())
                }
                status => Err(GateError::validation(format!(
                    "proposal #{} is {:?} and can no longer be withdrawn",
                    id, status
                ))),
            }
        })
    }

    /// Attach a review comment while the review period is open
    pub fn comment(&self, id: ProposalId, member_id: &str, body: &str) -> GateResult<()> {
        let now = self.clock.now();
        self.require_eligible(member_id, now)?;
        self.update(id, |engine, next| {
            engine.drive(next, now, false);
            match next.proposal.status {
                ProposalStatus::Submitted => {
                    next.proposal.comments.push(ReviewComment {
                        member_id: member_id.to_string(),
                        body: body.to_string(),
                        at: now,
                    });
                    Ok(())
                }
                ProposalStatus::Draft => Err(GateError::validation("proposal is still a draft")),
                _ => Err(GateError::TimeoutExpiry(format!(
                    "review period of proposal #{} has ended",
                    id
                ))),
            }
        })
    }

    // ========================================================================
    // Voting
    // ========================================================================

    /// Cast or overwrite a member's vote while the window is open
    pub fn cast_vote(&self, id: ProposalId, member_id: &str, choice: VoteChoice) -> GateResult<()> {
        let now = self.clock.now();
        self.require_eligible(member_id, now)?;
        self.update(id, |engine, next| {
            engine.drive(next, now, false);
            match next.proposal.status {
                ProposalStatus::Voting => {
                    let previous = next.votes.insert(
                        member_id.to_string(),
                        Vote {
                            proposal_id: id,
                            member_id: member_id.to_string(),
                            choice,
                            cast_at: now,
                        },
                    );
                    if previous.is_some() {
                        debug!("{} changed vote on #{} to {:?}", member_id, id, choice);
                    } else {
                        debug!("{} voted {:?} on #{}", member_id, choice, id);
                    }
                    Ok(())
                }
                ProposalStatus::Approved | ProposalStatus::Rejected | ProposalStatus::Executed => {
                    Err(GateError::TimeoutExpiry(format!(
                        "voting on proposal #{} has closed",
                        id
                    )))
                }
                status => Err(GateError::validation(format!(
                    "proposal #{} is {:?}; voting is not open",
                    id, status
                ))),
            }
        })
    }

    /// Close the voting window now (or report the existing outcome).
    /// Idempotent: later calls return the same terminal status.
    pub fn close_voting(&self, id: ProposalId) -> GateResult<ProposalStatus> {
        let now = self.clock.now();
        let mut fatal = None;
        self.update(id, |engine, next| {
            fatal = engine.drive(next, now, true);
            match next.proposal.status {
                ProposalStatus::Draft | ProposalStatus::Submitted => Err(GateError::validation(
                    format!("voting on proposal #{} has not opened", id),
                )),
                ProposalStatus::Withdrawn | ProposalStatus::Expired => Err(GateError::validation(
                    format!("proposal #{} never reached a vote", id),
                )),
                _ => Ok(()),
            }
        })?;

        if let Some(e) = fatal {
            return Err(e);
        }
        self.status(id)
    }

    /// Advance every proposal's timers and retry pending executions
    pub fn tick(&self) -> GateResult<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();
        let mut first_fatal = None;

        let mut ids: Vec<ProposalId> = self.proposals.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        for id in ids {
            let mut before = ProposalStatus::Draft;
            let mut fatal = None;
            let result = self.update(id, |engine, next| {
                before = next.proposal.status;
                fatal = engine.drive(next, now, false);
                Ok(next.proposal.status)
            });

            let after = match result {
                Ok(()) => self.status(id)?,
                Err(e) => {
                    error!("Tick failed for proposal #{}: {}", id, e);
                    first_fatal.get_or_insert(e);
                    continue;
                }
            };
            if let Some(e) = fatal {
                first_fatal.get_or_insert(e);
            }

            if before == after {
                if after == ProposalStatus::Approved {
                    report.pending_execution += 1;
                }
                continue;
            }
            if matches!(before, ProposalStatus::Submitted | ProposalStatus::UnderReview) {
                report.voting_opened += 1;
            }
            match after {
                ProposalStatus::Approved => {
                    report.approved += 1;
                    report.pending_execution += 1;
                }
                ProposalStatus::Executed => {
                    if before != ProposalStatus::Approved {
                        report.approved += 1;
                    }
                    report.executed += 1;
                }
                ProposalStatus::Rejected => report.rejected += 1,
                ProposalStatus::Expired => report.drafts_expired += 1,
                _ => {}
            }
        }

        if report != TickReport::default() {
            info!("Governance tick: {:?}", report);
        }
        match first_fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn proposal(&self, id: ProposalId) -> Option<Proposal> {
        let record = self.proposals.get(&id).map(|r| r.value().clone())?;
        let guard = lock(&record);
        Some(guard.proposal.clone())
    }

    pub fn status(&self, id: ProposalId) -> GateResult<ProposalStatus> {
        self.proposal(id)
            .map(|p| p.status)
            .ok_or_else(|| unknown_proposal(id))
    }

    /// Proposals in id order, optionally filtered by status
    pub fn proposals(&self, status: Option<ProposalStatus>) -> Vec<Proposal> {
        let records: Vec<_> = self.proposals.iter().map(|r| r.value().clone()).collect();
        let mut proposals: Vec<Proposal> = records
            .iter()
            .map(|r| lock(r).proposal.clone())
            .filter(|p| status.map_or(true, |s| p.status == s))
            .collect();
        proposals.sort_by_key(|p| p.id);
        proposals
    }

    /// Final tally; None while voting is still open
    pub fn tally(&self, id: ProposalId) -> GateResult<Option<Tally>> {
        let proposal = self.proposal(id).ok_or_else(|| unknown_proposal(id))?;
        Ok(proposal.resolution.map(|r| r.tally))
    }

    /// Currently held parameter-key locks
    pub fn locked_keys(&self) -> Vec<(String, ProposalId)> {
        lock(&self.locks).snapshot()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Run `f` on a copy of the record; persist and commit the copy if it
    /// changed and `f` succeeded, then bring the lock table in line.
    fn update<T, F>(&self, id: ProposalId, f: F) -> GateResult<()>
    where
        F: FnOnce(&Self, &mut ProposalRecord) -> GateResult<T>,
    {
        let record = self
            .proposals
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| unknown_proposal(id))?;
        let mut guard = lock(&record);

        let mut next = guard.clone();
        let result = f(self, &mut next);

        let acquired = !guard.proposal.status.holds_lock() && next.proposal.status.holds_lock();
        if next != *guard {
            if let Err(e) = self.persist(&next) {
                if acquired {
                    lock(&self.locks).release(id);
                }
                return Err(e);
            }
            if !next.proposal.status.holds_lock() && guard.proposal.status.holds_lock() {
                let released = lock(&self.locks).release(id);
                debug!("Released {} locks held by #{}", released, id);
            }
            *guard = next;
        } else if acquired {
            lock(&self.locks).release(id);
        }

        result.map(|_| ())
    }

    /// Apply elapsed deadlines (and an explicit close) to the record. Returns
    /// a fatal error from execution, which leaves the proposal Approved.
    fn drive(&self, next: &mut ProposalRecord, now: Timestamp, close_now: bool) -> Option<GateError> {
        let proposal = &mut next.proposal;

        if proposal.status == ProposalStatus::Draft
            && now >= proposal.created_at + self.config.draft_ttl_secs
        {
            info!("Draft #{} expired unsubmitted", proposal.id);
            proposal.transition(ProposalStatus::Expired, now);
        }

        if proposal.status == ProposalStatus::Submitted {
            if let Some(review_end) = proposal.review_ends_at {
                if now >= review_end {
                    proposal.transition(ProposalStatus::UnderReview, review_end);
                    proposal.transition(ProposalStatus::Voting, review_end);
                    proposal.voting_ends_at = Some(review_end + self.config.voting_window_secs);
                    info!(
                        "Voting opened on #{} until {}",
                        proposal.id,
                        review_end + self.config.voting_window_secs
                    );
                }
            }
        }

        if proposal.status == ProposalStatus::Voting {
            let deadline = proposal.voting_ends_at.unwrap_or(now);
            if now >= deadline {
                self.resolve(next, deadline);
            } else if close_now {
                self.resolve(next, now);
            }
        }

        if next.proposal.status == ProposalStatus::Approved {
            return self.execute(next, now);
        }
        None
    }

    fn resolve(&self, next: &mut ProposalRecord, closed_at: Timestamp) {
        let tally = Tally::from_votes(next.votes.values());
        let participation = tally.participation();
        let proposal = &mut next.proposal;

        let (approved, reason) = if participation < self.config.quorum_min {
            (
                false,
                Some(RejectionReason::QuorumFailure {
                    participation,
                    quorum: self.config.quorum_min,
                }),
            )
        } else if proposal
            .majority
            .evaluate(&tally, self.config.supermajority_approvals)
        {
            (true, None)
        } else {
            (false, Some(RejectionReason::MajorityNotReached))
        };

        proposal.resolution = Some(Resolution {
            closed_at,
            tally,
            approved,
            reason,
        });
        let status = if approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        };
        proposal.transition(status, closed_at);

        info!(
            "Proposal #{} {:?}: {} approve / {} reject / {} abstain ({:?})",
            proposal.id, status, tally.approve, tally.reject, tally.abstain, reason
        );
    }

    /// Publish the proposal's changes, retrying lost compare-and-swaps
    fn execute(&self, next: &mut ProposalRecord, now: Timestamp) -> Option<GateError> {
        let proposal = &mut next.proposal;
        let id = proposal.id;

        // Published before a crash or a failed record write
        if let Some(set) = self.params.published_by(id) {
            proposal.executed_version = Some(set.version());
            proposal.last_execution_error = None;
            proposal.transition(ProposalStatus::Executed, now);
            return None;
        }

        let mut last_error = None;
        for attempt in 1..=self.config.max_publish_retries {
            let base = self.params.current_version();
            let candidate = match base.apply(&proposal.changes, now.max(base.effective_at()), Some(id)) {
                Ok(set) => set,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            };
            match self.params.publish(base.version(), candidate) {
                Ok(version) => {
                    proposal.executed_version = Some(version);
                    proposal.last_execution_error = None;
                    proposal.transition(ProposalStatus::Executed, now);
                    info!("Proposal #{} executed as parameter v{}", id, version);
                    return None;
                }
                Err(e @ GateError::ParameterVersionStale { .. }) => {
                    debug!("Publish attempt {} for #{} lost: {}", attempt, id, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        proposal.execution_attempts += 1;
        proposal.last_execution_error = last_error.as_ref().map(|e| e.to_string());
        warn!(
            "Proposal #{} approved but not executed (attempt {}): {:?}",
            id, proposal.execution_attempts, proposal.last_execution_error
        );
        match last_error {
            Some(e @ GateError::StorageUnavailable(_)) => Some(e),
            _ => None,
        }
    }

    fn persist(&self, record: &ProposalRecord) -> GateResult<()> {
        if let Some(db) = &self.db {
            db.store_proposal(record).map_err(|e| {
                error!("Failed to persist proposal #{}: {}", record.proposal.id, e);
                GateError::storage(e)
            })?;
        }
        Ok(())
    }

    fn persist_member(&self, member: &CommitteeMember) -> GateResult<()> {
        if let Some(db) = &self.db {
            db.store_member(member).map_err(|e| {
                error!("Failed to persist member {}: {}", member.member_id, e);
                GateError::storage(e)
            })?;
        }
        Ok(())
    }
}

fn unknown_proposal(id: ProposalId) -> GateError {
    GateError::validation(format!("unknown proposal #{}", id))
}
