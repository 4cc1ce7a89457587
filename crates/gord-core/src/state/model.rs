//! State model types.

use serde::{Deserialize, Serialize};

use crate::selection::SelectionState;
use crate::slots::{LoopCount, SlotList};

/// Chain lifecycle flags owned by the controlling layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Slots drive playback instead of the live selection.
    pub linked: bool,
    /// Passes over the active slots before the chain completes.
    pub global_loops: LoopCount,
}

/// Everything the core reads and writes at runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    /// Monotonically increasing version, bumped on audible edits.
    pub version: u64,
    pub selection: SelectionState,
    /// MIDI channel the engine plays on (1..=16).
    pub channel: u8,
    /// Whether the transport has been started.
    pub running: bool,
    pub slots: SlotList,
    pub chain: ChainSettings,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        Self {
            version: 0,
            selection: SelectionState::default(),
            channel: 1,
            running: false,
            slots: SlotList::new(),
            chain: ChainSettings::default(),
        }
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}
