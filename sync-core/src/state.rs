//! Load/save mutual-exclusion state machine for storesync.
//!
//! A persister is either idle, loading content into its store, or saving
//! content out to its medium. A load is refused while a save is in flight
//! and vice versa. Refused requests are dropped, never deferred.
//!
//! The transitions are pure; sync-client holds the state behind a lock and
//! performs the check synchronously before anything is scheduled.

use serde::{Deserialize, Serialize};

/// Which way content is flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Medium → store.
    Load,
    /// Store → medium.
    Save,
}

/// Load/save state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadSaveState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A load's content-apply step is in progress.
    Loading,
    /// A save's medium write is in progress.
    Saving,
}

impl LoadSaveState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Try to begin an operation in the given direction.
    ///
    /// Returns the new state, or `None` if the opposite direction is in
    /// flight and the request must be skipped. Beginning the same direction
    /// twice is allowed.
    pub fn begin(self, direction: Direction) -> Option<Self> {
        match (self, direction) {
            (Self::Saving, Direction::Load) | (Self::Loading, Direction::Save) => None,
            (_, Direction::Load) => Some(Self::Loading),
            (_, Direction::Save) => Some(Self::Saving),
        }
    }

    /// Complete whatever was in flight.
    pub fn finish(self) -> Self {
        Self::Idle
    }

    /// Check if nothing is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if a load is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Check if a save is in flight.
    pub fn is_saving(&self) -> bool {
        matches!(self, Self::Saving)
    }
}

/// Load and save counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersisterStats {
    /// Number of loads begun (scheduled or applied directly).
    pub loads: u64,
    /// Number of saves begun.
    pub saves: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let state = LoadSaveState::new();
        assert!(state.is_idle());
        assert_eq!(state, LoadSaveState::default());
    }

    #[test]
    fn load_from_idle_transitions_to_loading() {
        let state = LoadSaveState::Idle.begin(Direction::Load);
        assert_eq!(state, Some(LoadSaveState::Loading));
    }

    #[test]
    fn save_from_idle_transitions_to_saving() {
        let state = LoadSaveState::Idle.begin(Direction::Save);
        assert_eq!(state, Some(LoadSaveState::Saving));
    }

    #[test]
    fn save_while_loading_is_refused() {
        assert_eq!(LoadSaveState::Loading.begin(Direction::Save), None);
    }

    #[test]
    fn load_while_saving_is_refused() {
        assert_eq!(LoadSaveState::Saving.begin(Direction::Load), None);
    }

    #[test]
    fn same_direction_may_overlap() {
        assert_eq!(
            LoadSaveState::Loading.begin(Direction::Load),
            Some(LoadSaveState::Loading)
        );
        assert_eq!(
            LoadSaveState::Saving.begin(Direction::Save),
            Some(LoadSaveState::Saving)
        );
    }

    #[test]
    fn finish_always_returns_idle() {
        for state in [
            LoadSaveState::Idle,
            LoadSaveState::Loading,
            LoadSaveState::Saving,
        ] {
            assert!(state.finish().is_idle());
        }
    }

    #[test]
    fn full_load_then_save_flow() {
        let state = LoadSaveState::new();

        let state = state.begin(Direction::Load).unwrap();
        assert!(state.is_loading());
        assert!(state.begin(Direction::Save).is_none());

        let state = state.finish();
        let state = state.begin(Direction::Save).unwrap();
        assert!(state.is_saving());
        assert!(state.begin(Direction::Load).is_none());
    }

    #[test]
    fn stats_serialize_as_object() {
        let stats = PersisterStats { loads: 2, saves: 3 };
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"loads":2,"saves":3}"#);
    }
}
