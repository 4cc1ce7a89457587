//! Musical selection state.
//!
//! [`SelectionState`] is everything the sequence generator and the transport
//! read: root, interval/octave grid, mutes, diatonic filter, direction and
//! the transport settings that shape the audible pattern.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::theory::{scale_pitch_classes, PitchClass, ScaleLookup, MAX_INTERVAL, MAX_OCTAVE};

/// Wire value for a rest.
pub const REST: i32 = -1;

pub const MIN_TEMPO: f64 = 1.0;
pub const MAX_TEMPO: f64 = 400.0;
pub const MIN_GATE: f64 = 1.0;
pub const MAX_GATE: f64 = 99.0;

/// One step of a sequence: a MIDI note or a rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Note(u8),
    Rest,
}

impl Step {
    /// Build a step from a raw wire value; anything outside 0..=127 is a rest.
    pub fn from_raw(value: i32) -> Self {
        if (0..=127).contains(&value) {
            Step::Note(value as u8)
        } else {
            Step::Rest
        }
    }

    /// The note, if this step sounds.
    pub fn note(self) -> Option<u8> {
        match self {
            Step::Note(n) => Some(n),
            Step::Rest => None,
        }
    }

    pub fn is_rest(self) -> bool {
        matches!(self, Step::Rest)
    }

    /// Wire encoding: the note number, or [`REST`].
    pub fn to_wire(self) -> i32 {
        match self {
            Step::Note(n) => n as i32,
            Step::Rest => REST,
        }
    }
}

impl From<u8> for Step {
    fn from(note: u8) -> Self {
        Step::Note(note)
    }
}

/// Playback direction applied after generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
    /// Forward, then backward.
    PingPongForward,
    /// Backward, then forward.
    PingPongReverse,
}

impl Direction {
    /// Numeric mode of the direction buttons (0..=3).
    pub fn mode(self) -> u8 {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
            Direction::PingPongForward => 2,
            Direction::PingPongReverse => 3,
        }
    }

    pub fn from_mode(mode: u8) -> Option<Self> {
        match mode {
            0 => Some(Direction::Forward),
            1 => Some(Direction::Reverse),
            2 => Some(Direction::PingPongForward),
            3 => Some(Direction::PingPongReverse),
            _ => None,
        }
    }

    pub fn is_ping_pong(self) -> bool {
        matches!(self, Direction::PingPongForward | Direction::PingPongReverse)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "forward" | "fwd" | "up" => Ok(Direction::Forward),
            "1" | "reverse" | "rev" | "down" => Ok(Direction::Reverse),
            "2" | "ping-pong" | "pingpong" | "ping-pong-forward" | "updown" => {
                Ok(Direction::PingPongForward)
            }
            "3" | "ping-pong-reverse" | "downup" => Ok(Direction::PingPongReverse),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
            Direction::PingPongForward => "ping-pong-forward",
            Direction::PingPongReverse => "ping-pong-reverse",
        };
        f.write_str(name)
    }
}

/// Selection and transport settings read by the generator and the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionState {
    /// Root pitch class; `None` means nothing is selected.
    pub root: Option<PitchClass>,
    /// Selected intervals (0..=12). 0 and 12 are independent entries.
    pub intervals: BTreeSet<u8>,
    /// Chosen octaves (0..=8) per interval.
    pub octaves: BTreeMap<u8, BTreeSet<u8>>,
    /// Intervals that stay selected but do not sound.
    pub muted_intervals: BTreeSet<u8>,
    /// Diatonic filter on/off.
    pub diatonic: bool,
    /// Active scale key for the diatonic filter.
    pub scale_key: Option<String>,
    /// Allowed pitch classes derived from root and scale.
    pub allowed_pitch_classes: BTreeSet<PitchClass>,
    /// Weave interval lists instead of playing them one after another.
    pub alt_sequence: bool,
    pub direction: Direction,
    /// Keep the duplicated junction note of ping-pong modes.
    pub include_turnaround: bool,
    /// Beats per minute.
    pub tempo: f64,
    /// Gate length in percent of a step.
    pub gate_percent: f64,
    /// Steps per reference unit (4 = quarter notes, 16 = sixteenths).
    pub subdivision: u32,
    /// Output transposition in semitones.
    pub transpose: i32,
    /// An external clock drives playback.
    pub slave_mode: bool,
    /// Resolved sequence as last generated (before output mapping).
    pub sequence: Vec<Step>,
}

impl Default for SelectionState {
    fn default() -> Self {
        Self {
            root: Some(0),
            intervals: BTreeSet::new(),
            octaves: BTreeMap::new(),
            muted_intervals: BTreeSet::new(),
            diatonic: false,
            scale_key: None,
            allowed_pitch_classes: BTreeSet::new(),
            alt_sequence: false,
            direction: Direction::Forward,
            include_turnaround: true,
            tempo: 120.0,
            gate_percent: 80.0,
            subdivision: 16,
            transpose: 0,
            slave_mode: false,
            sequence: Vec::new(),
        }
    }
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select `interval` at `octave`, creating the interval if needed.
    pub fn select(&mut self, interval: u8, octave: u8) {
        if interval > MAX_INTERVAL || octave > MAX_OCTAVE {
            return;
        }
        self.intervals.insert(interval);
        self.octaves.entry(interval).or_default().insert(octave);
    }

    /// Toggle a whole interval; removing it also forgets its octaves.
    pub fn toggle_interval(&mut self, interval: u8) {
        if interval > MAX_INTERVAL {
            return;
        }
        if !self.intervals.remove(&interval) {
            self.intervals.insert(interval);
        } else {
            self.octaves.remove(&interval);
            self.muted_intervals.remove(&interval);
        }
    }

    /// Toggle one grid cell. Clearing the last octave deselects the interval.
    pub fn toggle_octave(&mut self, interval: u8, octave: u8) {
        if interval > MAX_INTERVAL || octave > MAX_OCTAVE {
            return;
        }
        let octs = self.octaves.entry(interval).or_default();
        if !octs.remove(&octave) {
            octs.insert(octave);
            self.intervals.insert(interval);
        } else if octs.is_empty() {
            self.octaves.remove(&interval);
            self.intervals.remove(&interval);
        }
    }

    pub fn toggle_mute_interval(&mut self, interval: u8) {
        if !self.muted_intervals.remove(&interval) {
            self.muted_intervals.insert(interval);
        }
    }

    /// Set the root and refresh the allowed pitch classes.
    pub fn set_root(&mut self, root: Option<PitchClass>, scales: &dyn ScaleLookup) {
        self.root = root.map(|r| r % 12);
        self.refresh_allowed(scales);
    }

    /// Select a scale for the diatonic filter. Unknown keys leave the filter
    /// without an allowed set, which behaves as if it were off.
    pub fn set_scale(&mut self, key: Option<&str>, scales: &dyn ScaleLookup) {
        self.scale_key = key.map(str::to_string);
        self.refresh_allowed(scales);
    }

    /// Recompute [`Self::allowed_pitch_classes`] from root and scale key.
    pub fn refresh_allowed(&mut self, scales: &dyn ScaleLookup) {
        self.allowed_pitch_classes = match (self.root, self.scale_key.as_deref()) {
            (Some(root), Some(key)) => scales
                .intervals(key)
                .map(|ivs| scale_pitch_classes(root, ivs))
                .unwrap_or_default(),
            _ => BTreeSet::new(),
        };
    }

    /// Whether the diatonic filter is on and has something to filter with.
    pub fn diatonic_active(&self) -> bool {
        self.diatonic && !self.allowed_pitch_classes.is_empty()
    }

    /// Direction button behaviour: picking a ping-pong mode fresh starts
    /// without turnaround, picking it again toggles turnaround, and plain
    /// forward/reverse always include it.
    pub fn set_direction(&mut self, direction: Direction) {
        if direction.is_ping_pong() {
            if self.direction != direction {
                self.direction = direction;
                self.include_turnaround = false;
            } else {
                self.include_turnaround = !self.include_turnaround;
            }
        } else {
            self.direction = direction;
            self.include_turnaround = true;
        }
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        self.tempo = if bpm.is_finite() {
            bpm.clamp(MIN_TEMPO, MAX_TEMPO)
        } else {
            MIN_TEMPO
        };
    }

    pub fn set_gate(&mut self, percent: f64) {
        self.gate_percent = clamp_gate(percent);
    }

    pub fn set_subdivision(&mut self, subdivision: u32) {
        self.subdivision = subdivision.max(1);
    }

    /// Drop every interval, octave and mute, and the stored sequence.
    pub fn clear(&mut self) {
        self.intervals.clear();
        self.octaves.clear();
        self.muted_intervals.clear();
        self.sequence.clear();
    }

    /// Intervals that sound, ascending.
    pub fn active_intervals(&self) -> impl Iterator<Item = u8> + '_ {
        self.intervals
            .iter()
            .copied()
            .filter(|iv| !self.muted_intervals.contains(iv))
    }

    /// Chosen octaves for an interval, ascending.
    pub fn octaves_for(&self, interval: u8) -> impl Iterator<Item = u8> + '_ {
        self.octaves
            .get(&interval)
            .into_iter()
            .flat_map(|octs| octs.iter().copied())
    }
}

/// Normalise a gate value to percent in 1..=99. Values up to 1.5 are read as
/// fractions.
pub fn clamp_gate(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 45.0;
    }
    let pct = if raw <= 1.5 { raw * 100.0 } else { raw };
    pct.clamp(MIN_GATE, MAX_GATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theory::ScaleLibrary;

    #[test]
    fn test_step_wire_encoding() {
        assert_eq!(Step::Note(60).to_wire(), 60);
        assert_eq!(Step::Rest.to_wire(), REST);
        assert_eq!(Step::from_raw(-1), Step::Rest);
        assert_eq!(Step::from_raw(128), Step::Rest);
        assert_eq!(Step::from_raw(0), Step::Note(0));
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("ping-pong".parse::<Direction>().unwrap(), Direction::PingPongForward);
        assert_eq!("3".parse::<Direction>().unwrap(), Direction::PingPongReverse);
        assert!("sideways".parse::<Direction>().is_err());
        for mode in 0..4 {
            assert_eq!(Direction::from_mode(mode).unwrap().mode(), mode);
        }
    }

    #[test]
    fn test_set_direction_turnaround_rules() {
        let mut sel = SelectionState::new();
        sel.set_direction(Direction::PingPongForward);
        assert!(!sel.include_turnaround);
        sel.set_direction(Direction::PingPongForward);
        assert!(sel.include_turnaround);
        sel.set_direction(Direction::PingPongReverse);
        assert!(!sel.include_turnaround);
        sel.set_direction(Direction::Reverse);
        assert!(sel.include_turnaround);
    }

    #[test]
    fn test_toggle_octave_tracks_interval_membership() {
        let mut sel = SelectionState::new();
        sel.toggle_octave(4, 3);
        assert!(sel.intervals.contains(&4));
        sel.toggle_octave(4, 5);
        sel.toggle_octave(4, 3);
        assert!(sel.intervals.contains(&4));
        sel.toggle_octave(4, 5);
        assert!(!sel.intervals.contains(&4));
        assert!(sel.octaves.get(&4).is_none());
    }

    #[test]
    fn test_unison_and_octave_are_independent() {
        let mut sel = SelectionState::new();
        sel.select(0, 4);
        sel.select(12, 4);
        sel.toggle_interval(12);
        assert!(sel.intervals.contains(&0));
        assert!(!sel.intervals.contains(&12));
    }

    #[test]
    fn test_out_of_range_selection_ignored() {
        let mut sel = SelectionState::new();
        sel.select(13, 4);
        sel.select(3, 9);
        assert!(sel.intervals.is_empty());
    }

    #[test]
    fn test_scale_refresh() {
        let lib = ScaleLibrary::builtin();
        let mut sel = SelectionState::new();
        sel.diatonic = true;
        sel.set_scale(Some("major"), &lib);
        assert!(sel.diatonic_active());
        sel.set_root(Some(2), &lib);
        assert!(sel.allowed_pitch_classes.contains(&6)); // F# in D major
        sel.set_scale(Some("unknown"), &lib);
        assert!(!sel.diatonic_active());
    }

    #[test]
    fn test_clamping() {
        let mut sel = SelectionState::new();
        sel.set_tempo(1000.0);
        assert_eq!(sel.tempo, MAX_TEMPO);
        sel.set_tempo(f64::NAN);
        assert_eq!(sel.tempo, MIN_TEMPO);
        sel.set_gate(0.5);
        assert_eq!(sel.gate_percent, 50.0);
        sel.set_gate(150.0);
        assert_eq!(sel.gate_percent, MAX_GATE);
        sel.set_subdivision(0);
        assert_eq!(sel.subdivision, 1);
    }
}
