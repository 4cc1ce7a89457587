//! Sequence generation from selection state.
//!
//! The generator is a pure function of a [`SelectionState`] and a scale
//! table. Two generation modes exist:
//!
//! - **Default** - intervals ascending, each interval's octaves ascending
//! - **Weave** (alt sequence) - one list per interval, interleaved
//!   round-robin with shorter lists wrapping
//!
//! A direction pass (forward, reverse, ping-pong) is applied afterwards.

use std::collections::BTreeSet;

use crate::selection::{Direction, SelectionState, Step};
use crate::theory::{scale_pitch_classes, snap_to_scale, PitchClass, ScaleLookup};

/// MIDI note for a grid cell: `12 * (octave + 1) + (root + interval) mod 12`.
pub fn note_from_grid(root: PitchClass, interval: u8, octave: u8) -> i32 {
    let semitone = (root as i32 + interval as i32).rem_euclid(12);
    12 * (octave as i32 + 1) + semitone
}

/// Diatonic context resolved once per generation.
struct Diatonic<'s> {
    key: &'s str,
    scale_intervals: &'s [u8],
    allowed: BTreeSet<PitchClass>,
}

/// Deterministic selection → sequence transform.
pub struct SequenceGenerator<'a> {
    scales: &'a dyn ScaleLookup,
}

impl<'a> SequenceGenerator<'a> {
    pub fn new(scales: &'a dyn ScaleLookup) -> Self {
        Self { scales }
    }

    /// Final play list: default or weave generation, then direction.
    pub fn generate(&self, sel: &SelectionState) -> Vec<Step> {
        let base = if sel.alt_sequence {
            self.alt_sequence(sel)
        } else {
            self.default_sequence(sel)
        };
        apply_direction(base, sel.direction, sel.include_turnaround)
    }

    /// Intervals ascending (muted ones skipped), each over its octaves.
    pub fn default_sequence(&self, sel: &SelectionState) -> Vec<Step> {
        let Some(root) = sel.root else {
            return Vec::new();
        };
        let diatonic = self.diatonic(sel, root);
        sel.active_intervals()
            .flat_map(|iv| self.interval_notes(sel, root, iv, diatonic.as_ref()))
            .map(step_from_note)
            .collect()
    }

    /// Round-robin weave over per-interval note lists.
    ///
    /// The result has `lists × longest` steps; shorter lists repeat from
    /// their start.
    pub fn alt_sequence(&self, sel: &SelectionState) -> Vec<Step> {
        let Some(root) = sel.root else {
            return Vec::new();
        };
        let diatonic = self.diatonic(sel, root);
        let lists: Vec<Vec<i32>> = sel
            .active_intervals()
            .map(|iv| self.interval_notes(sel, root, iv, diatonic.as_ref()))
            .filter(|notes| !notes.is_empty())
            .collect();

        let longest = lists.iter().map(Vec::len).max().unwrap_or(0);
        let mut woven = Vec::with_capacity(lists.len() * longest);
        for i in 0..longest {
            for list in &lists {
                woven.push(step_from_note(list[i % list.len()]));
            }
        }
        woven
    }

    fn diatonic<'s>(&'s self, sel: &'s SelectionState, root: PitchClass) -> Option<Diatonic<'s>> {
        if !sel.diatonic {
            return None;
        }
        let key = sel.scale_key.as_deref()?;
        let scale_intervals = self.scales.intervals(key)?;
        Some(Diatonic {
            key,
            scale_intervals,
            allowed: scale_pitch_classes(root, scale_intervals),
        })
    }

    /// Notes for one interval across its chosen octaves, ascending.
    fn interval_notes(
        &self,
        sel: &SelectionState,
        root: PitchClass,
        interval: u8,
        diatonic: Option<&Diatonic<'_>>,
    ) -> Vec<i32> {
        let degree = diatonic.and_then(|d| self.scales.interval_to_degree(interval, d.key));
        sel.octaves_for(interval)
            .map(|octave| match (diatonic, degree) {
                (Some(d), Some(deg)) => match d.scale_intervals.get(deg) {
                    Some(mapped) => note_from_grid(root, *mapped, octave),
                    None => note_from_grid(root, interval, octave),
                },
                (Some(d), None) => snap_to_scale(note_from_grid(root, interval, octave), &d.allowed),
                (None, _) => note_from_grid(root, interval, octave),
            })
            .collect()
    }
}

fn step_from_note(note: i32) -> Step {
    Step::from_raw(note)
}

/// Apply a direction to a base sequence.
///
/// Ping-pong modes concatenate both orders. Without turnaround the junction
/// note, which both halves share, is emitted once: `2N - 1` steps instead of
/// `2N`.
pub fn apply_direction(seq: Vec<Step>, direction: Direction, include_turnaround: bool) -> Vec<Step> {
    if seq.is_empty() {
        return seq;
    }
    let reversed: Vec<Step> = seq.iter().rev().copied().collect();
    let skip = usize::from(!include_turnaround);
    match direction {
        Direction::Forward => seq,
        Direction::Reverse => reversed,
        Direction::PingPongForward => seq
            .iter()
            .copied()
            .chain(reversed.into_iter().skip(skip))
            .collect(),
        Direction::PingPongReverse => reversed
            .iter()
            .copied()
            .chain(seq.into_iter().skip(skip))
            .collect(),
    }
}
