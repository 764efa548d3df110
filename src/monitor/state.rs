use serde::Serialize;
use statig::prelude::*;
use std::collections::HashSet;

use crate::external::{ReviewId, TicketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReviewStatus {
    Open,
    SuggestionsPending,
    Merged,
    ClosedUnmerged,
    TimedOut,
}

impl ReviewStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReviewStatus::Merged | ReviewStatus::ClosedUnmerged | ReviewStatus::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewEvent {
    SuggestionsFound { count: usize },
    SuggestionsApplied,
    Merged,
    ClosedUnmerged,
    BudgetExhausted,
}

/// Per-review state owned by one monitor loop
///
/// Only Open and SuggestionsPending may alternate; every terminal state
/// ignores further events.
#[derive(Debug)]
pub struct ReviewLifecycle {
    pub review_id: ReviewId,
    pub linked_ticket: Option<TicketId>,
    pub branch: String,
    pub seen_suggestions: HashSet<u64>,
    status: ReviewStatus,
    ticket_close_requested: bool,
}

impl ReviewLifecycle {
    pub fn new(review_id: ReviewId, linked_ticket: Option<TicketId>, branch: impl Into<String>) -> Self {
        Self {
            review_id,
            linked_ticket,
            branch: branch.into(),
            seen_suggestions: HashSet::new(),
            status: ReviewStatus::Open,
            ticket_close_requested: false,
        }
    }

    pub fn status(&self) -> ReviewStatus {
        self.status
    }

    /// Set only on the transition into Merged
    pub fn ticket_close_requested(&self) -> bool {
        self.ticket_close_requested
    }

    fn enter_merged(&mut self) -> Outcome<State> {
        self.status = ReviewStatus::Merged;
        self.ticket_close_requested = self.linked_ticket.is_some();
        tracing::info!(review = self.review_id, ticket = ?self.linked_ticket, "Review merged");
        Transition(State::merged())
    }

    fn enter_closed_unmerged(&mut self) -> Outcome<State> {
        self.status = ReviewStatus::ClosedUnmerged;
        tracing::info!(review = self.review_id, "Review closed without merge; linked ticket stays open");
        Transition(State::closed_unmerged())
    }

    fn enter_timed_out(&mut self) -> Outcome<State> {
        self.status = ReviewStatus::TimedOut;
        tracing::info!(review = self.review_id, "Monitoring budget exhausted");
        Transition(State::timed_out())
    }
}

#[state_machine(initial = "State::open()")]
impl ReviewLifecycle {
    #[state]
    fn open(&mut self, event: &ReviewEvent) -> Outcome<State> {
        match event {
            ReviewEvent::SuggestionsFound { count } => {
                self.status = ReviewStatus::SuggestionsPending;
                tracing::info!(review = self.review_id, count = %count, "New suggestions found");
                Transition(State::suggestions_pending())
            }
            ReviewEvent::SuggestionsApplied => Handled,
            ReviewEvent::Merged => self.enter_merged(),
            ReviewEvent::ClosedUnmerged => self.enter_closed_unmerged(),
            ReviewEvent::BudgetExhausted => self.enter_timed_out(),
        }
    }

    #[state]
    fn suggestions_pending(&mut self, event: &ReviewEvent) -> Outcome<State> {
        match event {
            ReviewEvent::SuggestionsApplied => {
                self.status = ReviewStatus::Open;
                Transition(State::open())
            }
            ReviewEvent::SuggestionsFound { .. } => Handled,
            ReviewEvent::Merged => self.enter_merged(),
            ReviewEvent::ClosedUnmerged => self.enter_closed_unmerged(),
            ReviewEvent::BudgetExhausted => self.enter_timed_out(),
        }
    }

    #[state]
    fn merged(&mut self, event: &ReviewEvent) -> Outcome<State> {
        tracing::debug!(review = self.review_id, ?event, "Ignoring event in terminal state");
        Handled
    }

    #[state]
    fn closed_unmerged(&mut self, event: &ReviewEvent) -> Outcome<State> {
        tracing::debug!(review = self.review_id, ?event, "Ignoring event in terminal state");
        Handled
    }

    #[state]
    fn timed_out(&mut self, event: &ReviewEvent) -> Outcome<State> {
        tracing::debug!(review = self.review_id, ?event, "Ignoring event in terminal state");
        Handled
    }
}

/// Owned wrapper around the state machine
pub struct ReviewTracker {
    machine: StateMachine<ReviewLifecycle>,
}

impl ReviewTracker {
    pub fn new(review_id: ReviewId, linked_ticket: Option<TicketId>, branch: impl Into<String>) -> Self {
        Self {
            machine: ReviewLifecycle::new(review_id, linked_ticket, branch).state_machine(),
        }
    }

    pub fn handle(&mut self, event: ReviewEvent) -> ReviewStatus {
        self.machine.handle(&event);
        self.status()
    }

    pub fn lifecycle(&self) -> &ReviewLifecycle {
        self.machine.inner()
    }

    pub fn status(&self) -> ReviewStatus {
        self.lifecycle().status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn ticket_close_requested(&self) -> bool {
        self.lifecycle().ticket_close_requested()
    }

    /// Record suggestion ids; returns the ones not seen before
    pub fn mark_seen(&mut self, ids: impl IntoIterator<Item = u64>) -> Vec<u64> {
        // inner_mut is unsafe because it can bypass transitions; only the
        // seen-set is touched here
        let lifecycle = unsafe { self.machine.inner_mut() };
        ids.into_iter().filter(|id| lifecycle.seen_suggestions.insert(*id)).collect()
    }

    pub fn has_seen(&self, id: u64) -> bool {
        self.lifecycle().seen_suggestions.contains(&id)
    }
}
