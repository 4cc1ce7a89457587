//! Captured chain slots.
//!
//! A [`SlotSnapshot`] is a pattern baked at capture time. The [`SlotList`]
//! holds a fixed number of rows, some of which may be empty or hidden, and
//! derives the [`ActiveSlot`] list the chain runner plays.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::selection::{SelectionState, Step};
use crate::sequence::SequenceGenerator;
use crate::theory::PitchClass;

/// Maximum number of slot rows.
pub const MAX_SLOTS: usize = 16;

/// Rows present in a fresh list.
pub const INITIAL_SLOTS: usize = 8;

const INFINITE_TOKENS: [&str; 4] = ["x", "inf", "∞", "none"];

/// Repeat count: a positive number of loops or forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopCount {
    Finite(u32),
    Infinite,
}

impl Default for LoopCount {
    fn default() -> Self {
        LoopCount::Finite(1)
    }
}

impl LoopCount {
    /// Finite count, clamped to at least one loop.
    pub fn finite(n: u32) -> Self {
        LoopCount::Finite(n.max(1))
    }

    /// Parse a per-slot loop field. An empty field means "loop forever".
    pub fn parse_slot(text: &str) -> Self {
        let t = text.trim();
        if t.is_empty() {
            return LoopCount::Infinite;
        }
        Self::parse_common(t)
    }

    /// Parse the global loop field. An empty field means a single pass.
    pub fn parse_global(text: &str) -> Self {
        let t = text.trim();
        if t.is_empty() {
            return LoopCount::Finite(1);
        }
        Self::parse_common(t)
    }

    fn parse_common(t: &str) -> Self {
        let lower = t.to_lowercase();
        if INFINITE_TOKENS.contains(&lower.as_str()) {
            return LoopCount::Infinite;
        }
        match lower.parse::<i64>() {
            Ok(n) => LoopCount::Finite(n.clamp(1, u32::MAX as i64) as u32),
            Err(_) => LoopCount::Finite(1),
        }
    }

    pub fn is_infinite(self) -> bool {
        matches!(self, LoopCount::Infinite)
    }

    /// Whether `completed` loops satisfy this count.
    pub fn reached(self, completed: u32) -> bool {
        match self {
            LoopCount::Finite(n) => completed >= n,
            LoopCount::Infinite => false,
        }
    }

    /// Wire encoding: the count, or -1 for infinite.
    pub fn to_wire(self) -> i32 {
        match self {
            LoopCount::Finite(n) => n.min(i32::MAX as u32) as i32,
            LoopCount::Infinite => -1,
        }
    }
}

impl fmt::Display for LoopCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopCount::Finite(n) => write!(f, "{}", n),
            LoopCount::Infinite => f.write_str("X"),
        }
    }
}

/// Selection context recorded alongside a capture.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub root: Option<PitchClass>,
    pub scale_key: Option<String>,
    pub tempo: f64,
    pub subdivision: u32,
    pub gate_percent: f64,
}

/// One captured chain pattern.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub name: String,
    pub sequence: Vec<Step>,
    pub loops: LoopCount,
    pub muted: bool,
    pub solo: bool,
    pub hidden: bool,
    pub capture: CaptureInfo,
}

impl SlotSnapshot {
    pub fn new(name: impl Into<String>, sequence: Vec<Step>, loops: LoopCount) -> Self {
        Self {
            name: name.into(),
            sequence,
            loops,
            ..Default::default()
        }
    }

    /// Whether at least one step sounds.
    pub fn has_notes(&self) -> bool {
        self.sequence.iter().any(|s| !s.is_rest())
    }

    pub fn note_count(&self) -> usize {
        self.sequence.iter().filter(|s| !s.is_rest()).count()
    }

    /// Wire encoding of the baked steps.
    pub fn wire_notes(&self) -> Vec<i32> {
        self.sequence.iter().map(|s| s.to_wire()).collect()
    }
}

/// A slot eligible to play, with its position in the slot list.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveSlot {
    pub index: usize,
    pub snapshot: SlotSnapshot,
    pub loops: LoopCount,
}

/// Chain entry as sent to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSlot {
    pub notes: Vec<i32>,
    pub loops: i32,
}

/// Ordered slot rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotList {
    rows: Vec<Option<SlotSnapshot>>,
}

impl Default for SlotList {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotList {
    pub fn new() -> Self {
        Self {
            rows: vec![None; INITIAL_SLOTS],
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SlotSnapshot> {
        self.rows.get(index).and_then(Option::as_ref)
    }

    pub fn rows(&self) -> &[Option<SlotSnapshot>] {
        &self.rows
    }

    /// Append an empty row. Returns false at capacity.
    pub fn add_row(&mut self) -> bool {
        if self.rows.len() >= MAX_SLOTS {
            return false;
        }
        self.rows.push(None);
        true
    }

    /// Put a snapshot into a row, growing the list up to capacity.
    pub fn set(&mut self, index: usize, snapshot: SlotSnapshot) -> bool {
        if index >= MAX_SLOTS {
            return false;
        }
        while self.rows.len() <= index {
            self.rows.push(None);
        }
        self.rows[index] = Some(snapshot);
        true
    }

    /// Capture the pattern audible for `selection` into `index`.
    ///
    /// The sequence is generated fresh, so a stale stored sequence is never
    /// baked. Returns false when the selection produces nothing or the index
    /// is past capacity.
    pub fn capture(
        &mut self,
        index: usize,
        name: impl Into<String>,
        loops: LoopCount,
        selection: &SelectionState,
        generator: &SequenceGenerator<'_>,
    ) -> bool {
        let sequence = generator.generate(selection);
        if sequence.is_empty() {
            return false;
        }
        let mut snapshot = SlotSnapshot::new(name, sequence, loops);
        snapshot.capture = CaptureInfo {
            root: selection.root,
            scale_key: selection.scale_key.clone(),
            tempo: selection.tempo,
            subdivision: selection.subdivision,
            gate_percent: selection.gate_percent,
        };
        self.set(index, snapshot)
    }

    fn edit(&mut self, index: usize, f: impl FnOnce(&mut SlotSnapshot)) -> bool {
        match self.rows.get_mut(index).and_then(Option::as_mut) {
            Some(slot) => {
                f(slot);
                true
            }
            None => false,
        }
    }

    /// Toggle mute; muting clears solo.
    pub fn toggle_mute(&mut self, index: usize) -> bool {
        self.edit(index, |s| {
            s.muted = !s.muted;
            if s.muted {
                s.solo = false;
            }
        })
    }

    /// Toggle solo; soloing clears mute.
    pub fn toggle_solo(&mut self, index: usize) -> bool {
        self.edit(index, |s| {
            s.solo = !s.solo;
            if s.solo {
                s.muted = false;
            }
        })
    }

    pub fn set_loops(&mut self, index: usize, loops: LoopCount) -> bool {
        self.edit(index, |s| s.loops = loops)
    }

    pub fn rename(&mut self, index: usize, name: impl Into<String>) -> bool {
        let name = name.into();
        self.edit(index, |s| s.name = name)
    }

    /// Hide and mute a slot. The snapshot is kept for [`Self::restore`].
    pub fn remove(&mut self, index: usize) -> bool {
        self.edit(index, |s| {
            s.hidden = true;
            s.muted = true;
            s.solo = false;
        })
    }

    /// Undo [`Self::remove`].
    pub fn restore(&mut self, index: usize) -> bool {
        self.edit(index, |s| {
            s.hidden = false;
            s.muted = false;
        })
    }

    /// Reset a row to empty.
    pub fn clear(&mut self, index: usize) -> bool {
        match self.rows.get_mut(index) {
            Some(row) => {
                *row = None;
                true
            }
            None => false,
        }
    }

    pub fn move_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.rows.len() {
            return false;
        }
        self.rows.swap(index, index - 1);
        true
    }

    pub fn move_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.rows.len() {
            return false;
        }
        self.rows.swap(index, index + 1);
        true
    }

    /// Sounding notes across all visible, unmuted slots.
    pub fn total_notes(&self) -> usize {
        self.rows
            .iter()
            .flatten()
            .filter(|s| !s.hidden && !s.muted)
            .map(SlotSnapshot::note_count)
            .sum()
    }

    /// Slots eligible to play, in list order.
    ///
    /// When any visible slot is soloed only soloed slots qualify. Hidden,
    /// muted, empty and all-rest slots never qualify.
    pub fn active_slots(&self) -> Vec<ActiveSlot> {
        let any_solo = self.rows.iter().flatten().any(|s| s.solo && !s.hidden);
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| row.as_ref().map(|s| (index, s)))
            .filter(|(_, s)| !s.hidden && !s.muted && (!any_solo || s.solo))
            .filter(|(_, s)| s.has_notes())
            .map(|(index, s)| ActiveSlot {
                index,
                snapshot: s.clone(),
                loops: s.loops,
            })
            .collect()
    }

    /// Unmapped chain definition for the active slots.
    pub fn chain_slots(&self) -> Vec<ChainSlot> {
        to_chain_slots(&self.active_slots())
    }
}

/// Chain definition for an active list.
pub fn to_chain_slots(active: &[ActiveSlot]) -> Vec<ChainSlot> {
    active
        .iter()
        .map(|a| ChainSlot {
            notes: a.snapshot.wire_notes(),
            loops: a.loops.to_wire(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theory::ScaleLibrary;

    fn snap(notes: &[u8], loops: u32) -> SlotSnapshot {
        SlotSnapshot::new(
            "slot",
            notes.iter().copied().map(Step::from).collect(),
            LoopCount::finite(loops),
        )
    }

    #[test]
    fn test_loop_count_parsing() {
        assert_eq!(LoopCount::parse_slot("3"), LoopCount::Finite(3));
        assert_eq!(LoopCount::parse_slot("0"), LoopCount::Finite(1));
        assert_eq!(LoopCount::parse_slot("-4"), LoopCount::Finite(1));
        assert_eq!(LoopCount::parse_slot("abc"), LoopCount::Finite(1));
        assert_eq!(LoopCount::parse_slot("X"), LoopCount::Infinite);
        assert_eq!(LoopCount::parse_slot("∞"), LoopCount::Infinite);
        assert_eq!(LoopCount::parse_slot(""), LoopCount::Infinite);
        assert_eq!(LoopCount::parse_global(""), LoopCount::Finite(1));
        assert_eq!(LoopCount::parse_global("None"), LoopCount::Infinite);
        assert_eq!(LoopCount::parse_global(" 2 "), LoopCount::Finite(2));
    }

    #[test]
    fn test_loop_count_wire_and_display() {
        assert_eq!(LoopCount::Infinite.to_wire(), -1);
        assert_eq!(LoopCount::finite(0).to_wire(), 1);
        assert_eq!(LoopCount::Infinite.to_string(), "X");
        assert!(LoopCount::Finite(2).reached(2));
        assert!(!LoopCount::Infinite.reached(u32::MAX));
    }

    #[test]
    fn test_active_slots_skip_hidden_muted_and_empty() {
        let mut list = SlotList::new();
        list.set(0, snap(&[60], 1));
        list.set(1, snap(&[62], 1));
        list.set(2, SlotSnapshot::new("rests", vec![Step::Rest, Step::Rest], LoopCount::finite(1)));
        list.set(3, snap(&[64], 2));
        list.toggle_mute(1);
        list.remove(3);
        let active: Vec<usize> = list.active_slots().iter().map(|a| a.index).collect();
        assert_eq!(active, vec![0]);
    }

    #[test]
    fn test_solo_restricts_active_slots() {
        let mut list = SlotList::new();
        list.set(0, snap(&[60], 1));
        list.set(1, snap(&[62], 1));
        list.set(4, snap(&[64], 1));
        list.toggle_solo(1);
        list.toggle_solo(4);
        let active: Vec<usize> = list.active_slots().iter().map(|a| a.index).collect();
        assert_eq!(active, vec![1, 4]);

        // A hidden solo does not silence the others.
        let mut list = SlotList::new();
        list.set(0, snap(&[60], 1));
        list.set(1, snap(&[62], 1));
        list.toggle_solo(1);
        list.remove(1);
        let active: Vec<usize> = list.active_slots().iter().map(|a| a.index).collect();
        assert_eq!(active, vec![0]);
    }

    #[test]
    fn test_mute_and_solo_are_exclusive() {
        let mut list = SlotList::new();
        list.set(0, snap(&[60], 1));
        list.toggle_solo(0);
        list.toggle_mute(0);
        let s = list.get(0).unwrap();
        assert!(s.muted && !s.solo);
        list.toggle_solo(0);
        let s = list.get(0).unwrap();
        assert!(s.solo && !s.muted);
    }

    #[test]
    fn test_remove_and_restore() {
        let mut list = SlotList::new();
        list.set(2, snap(&[60, 64], 1));
        list.remove(2);
        assert!(list.active_slots().is_empty());
        assert_eq!(list.total_notes(), 0);
        list.restore(2);
        assert_eq!(list.active_slots().len(), 1);
        assert_eq!(list.total_notes(), 2);
    }

    #[test]
    fn test_reorder_and_capacity() {
        let mut list = SlotList::new();
        list.set(0, snap(&[60], 1));
        list.set(1, snap(&[62], 1));
        assert!(list.move_down(0));
        assert_eq!(list.get(1).unwrap().sequence, vec![Step::Note(60)]);
        assert!(list.move_up(1));
        assert!(!list.move_up(0));
        while list.add_row() {}
        assert_eq!(list.len(), MAX_SLOTS);
        assert!(!list.set(MAX_SLOTS, snap(&[60], 1)));
        assert!(list.clear(0));
        assert!(list.get(0).is_none());
    }

    #[test]
    fn test_capture_generates_fresh_sequence() {
        let lib = ScaleLibrary::builtin();
        let gen = SequenceGenerator::new(&lib);
        let mut sel = SelectionState::new();
        sel.sequence = vec![Step::Note(1)];
        let mut list = SlotList::new();
        assert!(!list.capture(0, "empty", LoopCount::finite(1), &sel, &gen));

        for iv in [0, 4, 7] {
            sel.select(iv, 4);
        }
        assert!(list.capture(0, "triad", LoopCount::finite(2), &sel, &gen));
        let slot = list.get(0).unwrap();
        assert_eq!(slot.wire_notes(), vec![60, 64, 67]);
        assert_eq!(slot.capture.tempo, 120.0);
        assert_eq!(
            list.chain_slots(),
            vec![ChainSlot {
                notes: vec![60, 64, 67],
                loops: 2
            }]
        );
    }
}
