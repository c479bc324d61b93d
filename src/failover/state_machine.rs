use chrono::{DateTime, Utc};
use statig::prelude::*;
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::claim::{majority, LeaderClaim, NodeId, Role, Term};
use crate::errors::ElectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// No leader heartbeat within the election timeout. `electorate` is the
    /// membership size (self included) the candidacy will need a majority of.
    ElectionTimeout {
        electorate: usize,
        now: DateTime<Utc>,
    },
    VoteRequested {
        claim: LeaderClaim,
    },
    VoteReceived {
        voter: NodeId,
        term: Term,
        granted: bool,
    },
    /// A leader heartbeat carrying its committed claim.
    ClaimObserved {
        claim: LeaderClaim,
    },
    HigherTermSeen {
        term: Term,
    },
    CandidacyExpired,
}

/// Answer to the most recent vote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteDecision {
    pub term: Term,
    pub granted: bool,
}

/// Per-participant election state.
///
/// A participant grants at most one vote per term and never moves its term
/// backwards, which together with a strict-majority quorum leaves at most one
/// leader per term.
#[derive(Debug)]
pub struct ElectionNode {
    pub id: NodeId,
    term: Term,
    voted_for: Option<NodeId>,
    leader: Option<LeaderClaim>,
    role: Role,
    quorum: usize,
    votes: BTreeSet<NodeId>,
    claim: Option<LeaderClaim>,
    last_vote: Option<VoteDecision>,
    last_claim_accepted: bool,
}

impl ElectionNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            term: Term::default(),
            voted_for: None,
            leader: None,
            role: Role::Follower,
            quorum: 1,
            votes: BTreeSet::new(),
            claim: None,
            last_vote: None,
            last_claim_accepted: false,
        }
    }
}

#[state_machine(initial = "State::follower()")]
impl ElectionNode {
    #[state]
    fn follower(&mut self, event: &ElectionEvent) -> Outcome<State> {
        match event {
            ElectionEvent::ElectionTimeout { electorate, now } => {
                self.start_candidacy(*electorate, *now);
                if self.votes.len() >= self.quorum {
                    self.take_leadership();
                    Transition(State::leader())
                } else {
                    Transition(State::candidate())
                }
            }
            ElectionEvent::VoteRequested { claim } => {
                self.consider_vote(claim);
                Handled
            }
            ElectionEvent::ClaimObserved { claim } => {
                self.follow(claim);
                Handled
            }
            ElectionEvent::HigherTermSeen { term } => {
                self.adopt_term(*term);
                Handled
            }
            _ => Handled,
        }
    }

    #[state]
    fn candidate(&mut self, event: &ElectionEvent) -> Outcome<State> {
        match event {
            ElectionEvent::VoteReceived {
                voter,
                term,
                granted,
            } => {
                if *term > self.term {
                    self.step_down(*term);
                    return Transition(State::follower());
                }
                if *term == self.term && *granted {
                    self.votes.insert(voter.clone());
                    if self.votes.len() >= self.quorum {
                        self.take_leadership();
                        return Transition(State::leader());
                    }
                }
                Handled
            }
            ElectionEvent::VoteRequested { claim } => {
                if self.consider_vote(claim) {
                    Transition(State::follower())
                } else {
                    Handled
                }
            }
            ElectionEvent::ClaimObserved { claim } => {
                if claim.term >= self.term && claim.candidate != self.id {
                    self.follow(claim);
                    Transition(State::follower())
                } else {
                    self.last_claim_accepted = false;
                    Handled
                }
            }
            ElectionEvent::HigherTermSeen { term } => {
                if *term > self.term {
                    self.step_down(*term);
                    Transition(State::follower())
                } else {
                    Handled
                }
            }
            ElectionEvent::CandidacyExpired => {
                let split = ElectionError::SplitVote {
                    term: self.term,
                    votes: self.votes.len(),
                    quorum: self.quorum,
                };
                warn!(node_id = %self.id, term = %self.term, error = %split, "Candidacy failed");
                self.role = Role::Follower;
                self.claim = None;
                self.votes.clear();
                Transition(State::follower())
            }
            ElectionEvent::ElectionTimeout { .. } => Handled,
        }
    }

    #[state]
    fn leader(&mut self, event: &ElectionEvent) -> Outcome<State> {
        match event {
            ElectionEvent::VoteRequested { claim } => {
                if self.consider_vote(claim) {
                    Transition(State::follower())
                } else {
                    Handled
                }
            }
            ElectionEvent::ClaimObserved { claim } => {
                if claim.term > self.term {
                    self.step_down(claim.term);
                    self.follow(claim);
                    Transition(State::follower())
                } else {
                    self.last_claim_accepted = false;
                    Handled
                }
            }
            ElectionEvent::HigherTermSeen { term } => {
                if *term > self.term {
                    self.step_down(*term);
                    Transition(State::follower())
                } else {
                    Handled
                }
            }
            _ => Handled,
        }
    }
}

impl ElectionNode {
    pub fn term(&self) -> Term {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader_claim(&self) -> Option<&LeaderClaim> {
        self.leader.as_ref()
    }

    pub fn claim(&self) -> Option<&LeaderClaim> {
        self.claim.as_ref()
    }

    pub fn last_vote(&self) -> Option<VoteDecision> {
        self.last_vote
    }

    pub fn last_claim_accepted(&self) -> bool {
        self.last_claim_accepted
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    fn start_candidacy(&mut self, electorate: usize, now: DateTime<Utc>) {
        self.term = self.term.next();
        self.role = Role::Candidate;
        self.leader = None;
        self.voted_for = Some(self.id.clone());
        self.votes = BTreeSet::from([self.id.clone()]);
        self.quorum = majority(electorate);
        self.claim = Some(LeaderClaim {
            candidate: self.id.clone(),
            term: self.term,
            timestamp: now,
        });
        info!(node_id = %self.id, term = %self.term, quorum = self.quorum, "Starting candidacy");
    }

    fn take_leadership(&mut self) {
        self.role = Role::Leader;
        self.leader = self.claim.clone();
        info!(node_id = %self.id, term = %self.term, votes = self.votes.len(), "Promoted to leader");
    }

    /// Moves to a strictly higher term as a follower with no vote cast.
    /// Returns whether the term changed.
    fn adopt_term(&mut self, term: Term) -> bool {
        if term <= self.term {
            return false;
        }
        self.term = term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.leader = None;
        self.claim = None;
        self.votes.clear();
        true
    }

    fn step_down(&mut self, term: Term) {
        let from = self.term;
        let was = self.role;
        if self.adopt_term(term) {
            let event = ElectionError::StepDown {
                from_term: from,
                to_term: term,
            };
            info!(node_id = %self.id, role = %was, error = %event, "Stepping down");
        }
    }

    /// Records a vote decision for `claim`. Returns `true` if the request
    /// carried a higher term and this participant stepped down.
    fn consider_vote(&mut self, claim: &LeaderClaim) -> bool {
        let stepped_down = if claim.term > self.term {
            self.step_down(claim.term);
            true
        } else {
            false
        };

        let granted = claim.term == self.term
            && self
                .voted_for
                .as_ref()
                .map_or(true, |candidate| candidate == &claim.candidate);
        if granted {
            self.voted_for = Some(claim.candidate.clone());
        }

        self.last_vote = Some(VoteDecision {
            term: self.term,
            granted,
        });
        stepped_down
    }

    fn follow(&mut self, claim: &LeaderClaim) {
        if claim.term < self.term {
            self.last_claim_accepted = false;
            return;
        }
        self.adopt_term(claim.term);
        self.role = Role::Follower;
        self.voted_for.get_or_insert_with(|| claim.candidate.clone());
        if self.leader.as_ref() != Some(claim) {
            info!(node_id = %self.id, leader = %claim.candidate, term = %claim.term, "Following leader");
        }
        self.leader = Some(claim.clone());
        self.last_claim_accepted = true;
    }
}
