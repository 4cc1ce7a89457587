//! Static music theory lookups.
//!
//! This module provides the pitch-class helpers and scale tables the
//! sequence generator and the transport need:
//!
//! - [`ScaleLookup`] - The lookup seam (interval → degree, key → intervals)
//! - [`ScaleLibrary`] - Built-in table, optionally loaded from JSON
//! - [`snap_to_scale`] - Nearest allowed pitch class for a chromatic note

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Pitch class (0 = C … 11 = B).
pub type PitchClass = u8;

/// Sharp spellings indexed by pitch class.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Highest selectable octave on the interval grid.
pub const MAX_OCTAVE: u8 = 8;

/// Highest selectable interval (the octave, tracked apart from the unison).
pub const MAX_INTERVAL: u8 = 12;

/// Largest distance, in semitones, [`snap_to_scale`] will search.
const SNAP_RADIUS: i32 = 3;

/// Parse a note name such as `C`, `c#`, `Db` or `F♯` into a pitch class.
pub fn parse_note_name(name: &str) -> Result<PitchClass> {
    let trimmed = name.trim();
    let mut chars = trimmed.chars();
    let letter = chars
        .next()
        .ok_or_else(|| Error::InvalidNote(name.to_string()))?;
    let base: i32 = match letter.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return Err(Error::InvalidNote(name.to_string())),
    };
    let mut offset = 0;
    for accidental in chars {
        match accidental {
            '#' | '♯' => offset += 1,
            'b' | '♭' => offset -= 1,
            _ => return Err(Error::InvalidNote(name.to_string())),
        }
    }
    Ok((base + offset).rem_euclid(12) as PitchClass)
}

/// Display name for a pitch class.
pub fn note_name(pc: PitchClass) -> &'static str {
    NOTE_NAMES[(pc % 12) as usize]
}

/// Return the nearest in-scale MIDI note.
///
/// Notes already in `allowed` (or an empty `allowed` set) are returned
/// unchanged. Otherwise offsets ±1, ±2, ±3 are tried in that order, upward
/// first, so the smallest distance wins and ties resolve upward. A note with
/// no allowed neighbour inside the radius is returned unchanged.
pub fn snap_to_scale(note: i32, allowed: &BTreeSet<PitchClass>) -> i32 {
    if allowed.is_empty() || allowed.contains(&(note.rem_euclid(12) as PitchClass)) {
        return note;
    }
    for distance in 1..=SNAP_RADIUS {
        for candidate in [note + distance, note - distance] {
            if allowed.contains(&(candidate.rem_euclid(12) as PitchClass)) {
                return candidate;
            }
        }
    }
    note
}

/// Pitch classes of a scale rooted at `root`.
pub fn scale_pitch_classes(root: PitchClass, intervals: &[u8]) -> BTreeSet<PitchClass> {
    intervals
        .iter()
        .map(|iv| ((root as u16 + *iv as u16) % 12) as PitchClass)
        .collect()
}

/// Read-only scale table consulted by the sequence generator.
pub trait ScaleLookup: Send + Sync {
    /// Ordered interval list for a scale key, `None` for unknown keys.
    fn intervals(&self, key: &str) -> Option<&[u8]>;

    /// 0-based degree of `interval` (mod 12) within the scale, `None` when the
    /// interval is chromatic relative to it.
    fn interval_to_degree(&self, interval: u8, key: &str) -> Option<usize> {
        let target = interval % 12;
        self.intervals(key)?
            .iter()
            .position(|iv| iv % 12 == target)
    }
}

/// A resolved scale entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleDef {
    pub display_name: String,
    pub intervals: Vec<u8>,
}

/// Scale table keyed by short identifiers such as `major` or `dorian`.
#[derive(Clone, Debug, Default)]
pub struct ScaleLibrary {
    scales: HashMap<String, ScaleDef>,
}

#[derive(Deserialize)]
struct RawScaleFile {
    #[serde(default)]
    scales: BTreeMap<String, RawScale>,
}

#[derive(Deserialize)]
struct RawScale {
    #[serde(default)]
    intervals: Vec<u8>,
    display_name: Option<String>,
    alias_of: Option<String>,
}

impl ScaleLibrary {
    /// Build the library shipped with gord.
    pub fn builtin() -> Self {
        const BUILTIN: &[(&str, &str, &[u8])] = &[
            ("chromatic", "Chromatic", &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
            ("major", "Major", &[0, 2, 4, 5, 7, 9, 11]),
            ("minor", "Natural Minor", &[0, 2, 3, 5, 7, 8, 10]),
            ("dorian", "Dorian", &[0, 2, 3, 5, 7, 9, 10]),
            ("phrygian", "Phrygian", &[0, 1, 3, 5, 7, 8, 10]),
            ("lydian", "Lydian", &[0, 2, 4, 6, 7, 9, 11]),
            ("mixolydian", "Mixolydian", &[0, 2, 4, 5, 7, 9, 10]),
            ("locrian", "Locrian", &[0, 1, 3, 5, 6, 8, 10]),
            ("harmonic_minor", "Harmonic Minor", &[0, 2, 3, 5, 7, 8, 11]),
            ("melodic_minor", "Melodic Minor", &[0, 2, 3, 5, 7, 9, 11]),
            ("major_pentatonic", "Major Pentatonic", &[0, 2, 4, 7, 9]),
            ("minor_pentatonic", "Minor Pentatonic", &[0, 3, 5, 7, 10]),
            ("blues", "Blues", &[0, 3, 5, 6, 7, 10]),
            ("whole_tone", "Whole Tone", &[0, 2, 4, 6, 8, 10]),
            ("diminished", "Diminished (Half-Whole)", &[0, 1, 3, 4, 6, 7, 9, 10]),
        ];

        let scales = BUILTIN
            .iter()
            .map(|(key, name, intervals)| {
                (
                    key.to_string(),
                    ScaleDef {
                        display_name: name.to_string(),
                        intervals: intervals.to_vec(),
                    },
                )
            })
            .collect();
        Self { scales }
    }

    /// Load a scale table from JSON.
    ///
    /// The expected shape is `{"scales": {key: {"intervals": [...],
    /// "display_name": "...", "alias_of": "other_key"}}}`. Aliases take the
    /// intervals of their target; an alias pointing at a missing key resolves
    /// to an empty scale.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawScaleFile = serde_json::from_str(json)?;
        let scales = raw
            .scales
            .iter()
            .map(|(key, entry)| {
                let target = entry.alias_of.as_deref().unwrap_or(key);
                let base = raw.scales.get(target);
                let intervals = base.map(|b| b.intervals.clone()).unwrap_or_default();
                let display_name = entry
                    .display_name
                    .clone()
                    .or_else(|| base.and_then(|b| b.display_name.clone()))
                    .unwrap_or_else(|| key.clone());
                (
                    key.clone(),
                    ScaleDef {
                        display_name,
                        intervals,
                    },
                )
            })
            .collect();
        Ok(Self { scales })
    }

    /// Look up a scale entry.
    pub fn get(&self, key: &str) -> Option<&ScaleDef> {
        self.scales.get(key)
    }

    /// Number of scales in the library.
    pub fn len(&self) -> usize {
        self.scales.len()
    }

    /// Whether the library holds no scales.
    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    /// Scale keys ordered by length, then display name.
    pub fn keys_by_length(&self) -> Vec<&str> {
        let mut entries: Vec<(&String, &ScaleDef)> = self.scales.iter().collect();
        entries.sort_by(|a, b| {
            a.1.intervals
                .len()
                .cmp(&b.1.intervals.len())
                .then_with(|| a.1.display_name.cmp(&b.1.display_name))
        });
        entries.into_iter().map(|(k, _)| k.as_str()).collect()
    }
}

impl ScaleLookup for ScaleLibrary {
    fn intervals(&self, key: &str) -> Option<&[u8]> {
        self.scales.get(key).map(|s| s.intervals.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c_major() -> BTreeSet<PitchClass> {
        scale_pitch_classes(0, &[0, 2, 4, 5, 7, 9, 11])
    }

    #[test]
    fn test_parse_note_names() {
        assert_eq!(parse_note_name("C").unwrap(), 0);
        assert_eq!(parse_note_name("c#").unwrap(), 1);
        assert_eq!(parse_note_name("Db").unwrap(), 1);
        assert_eq!(parse_note_name("B#").unwrap(), 0);
        assert_eq!(parse_note_name("Cb").unwrap(), 11);
        assert!(parse_note_name("H").is_err());
        assert!(parse_note_name("").is_err());
    }

    #[test]
    fn test_snap_keeps_in_scale_notes() {
        let scale = c_major();
        for note in [60, 62, 64, 65, 67, 69, 71, 72] {
            assert_eq!(snap_to_scale(note, &scale), note);
            // Snapping twice changes nothing.
            assert_eq!(snap_to_scale(snap_to_scale(note, &scale), &scale), note);
        }
    }

    #[test]
    fn test_snap_prefers_upward_on_ties() {
        let scale = c_major();
        // C# is one semitone from both C and D.
        assert_eq!(snap_to_scale(61, &scale), 62);
        // F# lies between F and G.
        assert_eq!(snap_to_scale(66, &scale), 67);
    }

    #[test]
    fn test_snap_smallest_distance_wins() {
        // Only C and E allowed: D# (63) is one below E.
        let allowed: BTreeSet<PitchClass> = [0, 4].into_iter().collect();
        assert_eq!(snap_to_scale(63, &allowed), 64);
        // C# (61) is one above C.
        assert_eq!(snap_to_scale(61, &allowed), 60);
    }

    #[test]
    fn test_snap_out_of_radius_is_unchanged() {
        let allowed: BTreeSet<PitchClass> = [0].into_iter().collect();
        assert_eq!(snap_to_scale(66, &allowed), 66);
        assert_eq!(snap_to_scale(66, &BTreeSet::new()), 66);
    }

    #[test]
    fn test_interval_to_degree() {
        let lib = ScaleLibrary::builtin();
        assert_eq!(lib.interval_to_degree(0, "major"), Some(0));
        assert_eq!(lib.interval_to_degree(7, "major"), Some(4));
        assert_eq!(lib.interval_to_degree(12, "major"), Some(0));
        assert_eq!(lib.interval_to_degree(1, "major"), None);
        assert_eq!(lib.interval_to_degree(0, "nope"), None);
    }

    #[test]
    fn test_from_json_resolves_aliases() {
        let json = r#"{
            "scales": {
                "ionian": {"intervals": [0, 2, 4, 5, 7, 9, 11], "display_name": "Ionian"},
                "major": {"alias_of": "ionian", "display_name": "Major"},
                "broken": {"alias_of": "missing"}
            }
        }"#;
        let lib = ScaleLibrary::from_json(json).unwrap();
        assert_eq!(lib.len(), 3);
        assert_eq!(lib.intervals("major"), lib.intervals("ionian"));
        assert_eq!(lib.get("major").unwrap().display_name, "Major");
        assert_eq!(lib.intervals("broken"), Some(&[][..]));
    }

    #[test]
    fn test_keys_by_length() {
        let lib = ScaleLibrary::builtin();
        let keys = lib.keys_by_length();
        assert_eq!(keys.len(), lib.len());
        assert_eq!(keys.last(), Some(&"chromatic"));
        let first_len = lib.intervals(keys[0]).unwrap().len();
        assert_eq!(first_len, 5);
    }
}
