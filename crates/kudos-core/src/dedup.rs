//! Cross-run deduplication over persisted event identifiers.

use std::collections::HashSet;

use crate::{EventId, RunState};

/// Default bound on persisted identifiers.
pub const DEFAULT_PROCESSED_ID_CAP: usize = 1000;

/// Tracks which events were handled by earlier runs and which are handled now.
///
/// Membership in the persisted list is the only thing preventing a second
/// send when consecutive polling windows overlap.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    persisted: Vec<EventId>,
    persisted_index: HashSet<EventId>,
    fresh: Vec<EventId>,
    fresh_index: HashSet<EventId>,
    cap: usize,
}

impl Deduplicator {
    pub fn new(processed_ids: &[EventId], cap: usize) -> Self {
        let mut persisted = Vec::with_capacity(processed_ids.len());
        let mut persisted_index = HashSet::with_capacity(processed_ids.len());
        for id in processed_ids {
            if persisted_index.insert(id.clone()) {
                persisted.push(id.clone());
            }
        }
        Self {
            persisted,
            persisted_index,
            fresh: Vec::new(),
            fresh_index: HashSet::new(),
            cap: cap.max(1),
        }
    }

    pub fn from_state(state: &RunState, cap: usize) -> Self {
        Self::new(&state.processed_ids, cap)
    }

    pub fn is_new(&self, id: &EventId) -> bool {
        !self.persisted_index.contains(id) && !self.fresh_index.contains(id)
    }

    pub fn mark_processed(&mut self, id: &EventId) {
        if self.is_new(id) {
            self.fresh_index.insert(id.clone());
            self.fresh.push(id.clone());
        }
    }

    /// Identifiers marked during this run, in marking order.
    pub fn newly_processed(&self) -> &[EventId] {
        &self.fresh
    }

    /// Merges this run's identifiers into `state.processed_ids`.
    ///
    /// Over the cap, only the most recent `cap / 2` survive, and never fewer
    /// than the identifiers added by this run.
    pub fn commit(self, state: &mut RunState) {
        let fresh_count = self.fresh.len();
        let mut merged = self.persisted;
        merged.extend(self.fresh);

        if merged.len() > self.cap {
            let keep = (self.cap / 2).max(fresh_count);
            merged = merged.split_off(merged.len() - keep);
        }
        state.processed_ids = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<usize>) -> Vec<EventId> {
        range.map(|i| EventId::new(format!("om_{i}"))).collect()
    }

    #[test]
    fn replaying_events_yields_nothing_new_the_second_time() {
        let events = ids(0..5);
        let mut state = RunState::default();

        let mut first = Deduplicator::from_state(&state, 100);
        let new_first: Vec<_> = events.iter().filter(|id| first.is_new(id)).cloned().collect();
        for id in &new_first {
            first.mark_processed(id);
        }
        first.commit(&mut state);

        let second = Deduplicator::from_state(&state, 100);
        let new_second: Vec<_> = events.iter().filter(|id| second.is_new(id)).collect();
        assert_eq!(new_first, events);
        assert!(new_second.is_empty());
    }

    #[test]
    fn duplicate_within_one_run_is_not_new_after_marking() {
        let mut dedup = Deduplicator::new(&[], 10);
        let id = EventId::new("om_1");
        assert!(dedup.is_new(&id));
        dedup.mark_processed(&id);
        dedup.mark_processed(&id);
        assert!(!dedup.is_new(&id));
        assert_eq!(dedup.newly_processed().len(), 1);
    }

    #[test]
    fn commit_keeps_persisted_size_bounded() {
        let cap = 10;
        let mut state = RunState::default();
        for run in 0..20 {
            let mut dedup = Deduplicator::from_state(&state, cap);
            for id in ids(run * 3..run * 3 + 3) {
                dedup.mark_processed(&id);
            }
            dedup.commit(&mut state);
            assert!(state.processed_ids.len() <= cap, "run {run}");
        }
    }

    #[test]
    fn trimming_retains_the_most_recent_half_and_all_fresh_ids() {
        let mut state = RunState {
            processed_ids: ids(0..10),
            ..RunState::default()
        };
        let mut dedup = Deduplicator::from_state(&state, 10);
        let fresh = ids(10..13);
        for id in &fresh {
            dedup.mark_processed(id);
        }
        dedup.commit(&mut state);

        assert_eq!(state.processed_ids, ids(8..13));
        for id in &fresh {
            assert!(state.processed_ids.contains(id));
        }
    }

    #[test]
    fn duplicated_persisted_entries_collapse_on_load() {
        let mut doubled = ids(0..3);
        doubled.extend(ids(0..3));
        let mut state = RunState::default();
        Deduplicator::new(&doubled, 100).commit(&mut state);
        assert_eq!(state.processed_ids, ids(0..3));
    }
}
