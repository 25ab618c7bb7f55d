//! ============================================================================
//! Committee Roster - Seats, terms and voting eligibility
//! ============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{GateError, GateResult, Timestamp};

/// A seated (or formerly seated) committee member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub member_id: String,
    /// 1-based seat number
    pub seat: u8,
    pub term_start: Timestamp,
    pub term_end: Timestamp,
    pub active: bool,
}

impl CommitteeMember {
    /// Active and within term at `now`
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        self.active && self.term_start <= now && now < self.term_end
    }
}

/// Fixed-size committee; retired members stay on record
#[derive(Debug, Clone)]
pub struct Roster {
    seats: u8,
    members: Vec<CommitteeMember>,
}

impl Roster {
    pub fn new(seats: u8) -> Self {
        Self {
            seats,
            members: Vec::new(),
        }
    }

    /// Rebuild from persisted members, checking the seat invariants
    pub fn from_members(seats: u8, members: Vec<CommitteeMember>) -> GateResult<Self> {
        let mut roster = Self::new(seats);
        for member in members {
            if member.active {
                roster.check_can_seat(&member)?;
            }
            roster.members.push(member);
        }
        Ok(roster)
    }

    /// Every member ever seated
    pub fn members(&self) -> &[CommitteeMember] {
        &self.members
    }

    pub fn active_members(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter().filter(|m| m.active)
    }

    pub fn occupant(&self, seat: u8) -> Option<&CommitteeMember> {
        self.members.iter().find(|m| m.active && m.seat == seat)
    }

    /// Member allowed to vote or comment at `now`
    pub fn eligible(&self, member_id: &str, now: Timestamp) -> Option<&CommitteeMember> {
        self.members
            .iter()
            .find(|m| m.member_id == member_id && m.is_eligible(now))
    }

    fn check_can_seat(&self, member: &CommitteeMember) -> GateResult<()> {
        if member.member_id.trim().is_empty() {
            return Err(GateError::validation("member identity is empty"));
        }
        if member.seat == 0 || member.seat > self.seats {
            return Err(GateError::validation(format!(
                "seat {} outside 1..={}",
                member.seat, self.seats
            )));
        }
        if member.term_end <= member.term_start {
            return Err(GateError::validation("term must end after it starts"));
        }
        if let Some(holder) = self.occupant(member.seat) {
            return Err(GateError::validation(format!(
                "seat {} is held by {}",
                member.seat, holder.member_id
            )));
        }
        if let Some(other) = self
            .active_members()
            .find(|m| m.member_id == member.member_id)
        {
            return Err(GateError::validation(format!(
                "{} already holds seat {}",
                member.member_id, other.seat
            )));
        }
        Ok(())
    }

    /// Seat a member. An occupant whose term has ended at `now` is retired
    /// first. Returns every record that changed.
    pub fn seat(&mut self, member: CommitteeMember, now: Timestamp) -> GateResult<Vec<CommitteeMember>> {
        let mut changed = Vec::new();
        if let Some(pos) = self
            .members
            .iter()
            .position(|m| m.active && m.seat == member.seat && m.term_end <= now)
        {
            self.members[pos].active = false;
            info!(
                "Retired {} from seat {} (term ended)",
                self.members[pos].member_id, member.seat
            );
            changed.push(self.members[pos].clone());
        }

        let member = CommitteeMember {
            active: true,
            ..member
        };
        self.check_can_seat(&member)?;
        info!("Seated {} in seat {}", member.member_id, member.seat);
        self.members.push(member.clone());
        changed.push(member);
        Ok(changed)
    }

    /// Retire the occupant of `seat`
    pub fn vacate(&mut self, seat: u8) -> GateResult<CommitteeMember> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.active && m.seat == seat)
            .ok_or_else(|| GateError::validation(format!("seat {} is vacant", seat)))?;
        member.active = false;
        info!("Vacated seat {} ({})", seat, member.member_id);
        Ok(member.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, seat: u8) -> CommitteeMember {
        CommitteeMember {
            member_id: id.to_string(),
            seat,
            term_start: 0,
            term_end: 1_000,
            active: true,
        }
    }

    #[test]
    fn test_seat_and_eligibility() {
        let mut roster = Roster::new(7);
        roster.seat(member("alice", 1), 0).unwrap();
        assert!(roster.eligible("alice", 10).is_some());
        assert!(roster.eligible("alice", 1_000).is_none());
        assert!(roster.eligible("bob", 10).is_none());
    }

    #[test]
    fn test_seat_invariants() {
        let mut roster = Roster::new(7);
        roster.seat(member("alice", 1), 0).unwrap();
        // Occupied seat
        assert!(roster.seat(member("bob", 1), 10).is_err());
        // Same identity in two seats
        assert!(roster.seat(member("alice", 2), 10).is_err());
        // Out of range
        assert!(roster.seat(member("carol", 0), 10).is_err());
        assert!(roster.seat(member("carol", 8), 10).is_err());
        assert_eq!(roster.active_members().count(), 1);
    }

    #[test]
    fn test_expired_term_is_replaced() {
        let mut roster = Roster::new(7);
        roster.seat(member("alice", 3), 0).unwrap();
        let bob = CommitteeMember {
            term_start: 1_000,
            term_end: 2_000,
            ..member("bob", 3)
        };
        let changed = roster.seat(bob, 1_000).unwrap();
        assert_eq!(changed.len(), 2);
        assert!(!changed[0].active);
        assert_eq!(roster.occupant(3).unwrap().member_id, "bob");
        assert_eq!(roster.members().len(), 2);
    }

    #[test]
    fn test_vacate() {
        let mut roster = Roster::new(7);
        roster.seat(member("alice", 1), 0).unwrap();
        let retired = roster.vacate(1).unwrap();
        assert!(!retired.active);
        assert!(roster.vacate(1).is_err());
        roster.seat(member("bob", 1), 10).unwrap();
    }
}
