//! State manager for thread-safe state access.
//!
//! The [`StateManager`] wraps [`AppState`] in an `Arc<RwLock>`. Readers
//! never block each other; a poisoned lock is recovered rather than
//! propagated, so a panicking writer cannot take the background loops down
//! with it.

use std::sync::{Arc, PoisonError, RwLock};

use super::model::AppState;
use crate::selection::{SelectionState, Step};
use crate::sequence::SequenceGenerator;
use crate::theory::ScaleLookup;

/// Thread-safe handle to the shared [`AppState`].
#[derive(Clone)]
pub struct StateManager {
    state: Arc<RwLock<AppState>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self::with_state(AppState::new())
    }

    pub fn with_state(state: AppState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Read the state with a closure.
    pub fn with_state_read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AppState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Write to the state with a closure.
    pub fn with_state_write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut AppState) -> R,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Edit the selection and bump the version.
    pub fn edit_selection<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SelectionState) -> R,
    {
        self.with_state_write(|s| {
            let out = f(&mut s.selection);
            s.bump_version();
            out
        })
    }

    /// Get a clone of the current state.
    pub fn snapshot(&self) -> AppState {
        self.with_state_read(|s| s.clone())
    }

    pub fn selection(&self) -> SelectionState {
        self.with_state_read(|s| s.selection.clone())
    }

    pub fn tempo(&self) -> f64 {
        self.with_state_read(|s| s.selection.tempo)
    }

    pub fn subdivision(&self) -> u32 {
        self.with_state_read(|s| s.selection.subdivision)
    }

    pub fn is_running(&self) -> bool {
        self.with_state_read(|s| s.running)
    }

    pub fn set_running(&self, running: bool) {
        self.with_state_write(|s| s.running = running);
    }

    pub fn is_slave(&self) -> bool {
        self.with_state_read(|s| s.selection.slave_mode)
    }

    pub fn version(&self) -> u64 {
        self.with_state_read(|s| s.version)
    }

    /// Regenerate the resolved sequence from the current selection and
    /// store it. Returns the new sequence.
    pub fn regenerate_sequence(&self, scales: &dyn ScaleLookup) -> Vec<Step> {
        let selection = self.selection();
        let sequence = SequenceGenerator::new(scales).generate(&selection);
        self.with_state_write(|s| {
            if s.selection.sequence != sequence {
                s.selection.sequence = sequence.clone();
                s.bump_version();
            }
        });
        sequence
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theory::ScaleLibrary;

    #[test]
    fn test_state_manager_creation() {
        let manager = StateManager::new();
        assert!((manager.tempo() - 120.0).abs() < 0.001);
        assert!(!manager.is_running());
        assert_eq!(manager.snapshot().channel, 1);
    }

    #[test]
    fn test_edit_selection_bumps_version() {
        let manager = StateManager::new();
        manager.edit_selection(|sel| sel.set_tempo(140.0));
        assert!((manager.tempo() - 140.0).abs() < 0.001);
        assert_eq!(manager.version(), 1);
    }

    #[test]
    fn test_state_manager_clone_shares_state() {
        let manager1 = StateManager::new();
        let manager2 = manager1.clone();
        manager1.set_running(true);
        assert!(manager2.is_running());
    }

    #[test]
    fn test_regenerate_sequence() {
        let lib = ScaleLibrary::builtin();
        let manager = StateManager::new();
        manager.edit_selection(|sel| {
            for iv in [0, 4, 7] {
                sel.select(iv, 4);
            }
        });
        let seq = manager.regenerate_sequence(&lib);
        assert_eq!(seq.len(), 3);
        assert_eq!(manager.selection().sequence, seq);
        let version = manager.version();
        // Unchanged content does not bump the version.
        manager.regenerate_sequence(&lib);
        assert_eq!(manager.version(), version);
    }
}
