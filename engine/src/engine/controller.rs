//! Filter/query controller
//!
//! Owns the current filter set and the generation counter that tags every
//! issued query. Beginning a query cancels the one it supersedes; a response
//! carrying an older generation is stale and must be discarded.

use tokio_util::sync::CancellationToken;

use crate::data::types::{QueryFilters, TimeRange};

/// One filter mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterChange {
    TimeRange(TimeRange),
    Source(Option<String>),
    Agent(Option<String>),
    OnlyErrors(bool),
}

/// A query that has been issued
#[derive(Debug, Clone)]
pub struct QueryTicket {
    pub generation: u64,
    pub filters: QueryFilters,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct QueryController {
    filters: QueryFilters,
    generation: u64,
    in_flight: Option<CancellationToken>,
}

impl QueryController {
    pub fn new(filters: QueryFilters) -> Self {
        Self {
            filters,
            generation: 0,
            in_flight: None,
        }
    }

    pub fn filters(&self) -> &QueryFilters {
        &self.filters
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply a mutation. Returns whether the filter set changed.
    pub fn apply(&mut self, change: FilterChange) -> bool {
        let before = self.filters.clone();
        match change {
            FilterChange::TimeRange(range) => self.filters.time_range = range,
            FilterChange::Source(source) => self.filters.source = QueryFilters::normalize(source),
            FilterChange::Agent(agent) => self.filters.agent = QueryFilters::normalize(agent),
            FilterChange::OnlyErrors(only) => self.filters.only_errors = only,
        }
        self.filters != before
    }

    /// Issue a new query, cancelling the in-flight one
    pub fn begin(&mut self, parent: &CancellationToken) -> QueryTicket {
        self.cancel();
        self.generation += 1;
        let token = parent.child_token();
        self.in_flight = Some(token.clone());
        QueryTicket {
            generation: self.generation,
            filters: self.filters.clone(),
            token,
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Cancel the in-flight query, if any
    pub fn cancel(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_supersedes_previous() {
        let root = CancellationToken::new();
        let mut controller = QueryController::default();

        let first = controller.begin(&root);
        let second = controller.begin(&root);

        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert!(!controller.is_current(first.generation));
        assert!(controller.is_current(second.generation));
    }

    #[test]
    fn test_ticket_carries_filters_at_issue_time() {
        let root = CancellationToken::new();
        let mut controller = QueryController::default();
        controller.apply(FilterChange::Source(Some("pos".into())));
        let ticket = controller.begin(&root);
        controller.apply(FilterChange::Source(Some("web".into())));

        assert_eq!(ticket.filters.source.as_deref(), Some("pos"));
        assert_eq!(controller.filters().source.as_deref(), Some("web"));
    }

    #[test]
    fn test_apply_reports_changes() {
        let mut controller = QueryController::default();
        assert!(controller.apply(FilterChange::OnlyErrors(true)));
        assert!(!controller.apply(FilterChange::OnlyErrors(true)));
        assert!(!controller.apply(FilterChange::Agent(Some("   ".into()))));
        assert!(controller.apply(FilterChange::TimeRange(TimeRange::Last7Days)));
    }

    #[test]
    fn test_parent_cancellation_reaches_ticket() {
        let root = CancellationToken::new();
        let mut controller = QueryController::default();
        let ticket = controller.begin(&root);
        root.cancel();
        assert!(ticket.token.is_cancelled());
    }
}
