//! Timing helpers for chain scheduling.
//!
//! - [`step_duration`] / [`loop_duration`] - Musical time to wall time
//! - [`sleep_chunked`] - Cancellable sleep that re-reads its target

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::selection::{MAX_TEMPO, MIN_TEMPO};

/// Upper bound on a single sleep slice.
pub const MAX_SLEEP_CHUNK: Duration = Duration::from_millis(20);

/// Duration of one step: `(60 / tempo) × (4 / subdivision)` seconds.
#[inline]
pub fn step_duration(tempo: f64, subdivision: u32) -> Duration {
    let tempo = if tempo.is_finite() {
        tempo.clamp(MIN_TEMPO, MAX_TEMPO)
    } else {
        MIN_TEMPO
    };
    let subdivision = subdivision.max(1) as f64;
    Duration::from_secs_f64((60.0 / tempo) * (4.0 / subdivision))
}

/// Duration of one pass over `steps` steps.
#[inline]
pub fn loop_duration(steps: usize, tempo: f64, subdivision: u32) -> Duration {
    step_duration(tempo, subdivision).mul_f64(steps as f64)
}

/// Sleep until `target()` has elapsed, in slices of at most `chunk`.
///
/// `target` is re-evaluated every slice so tempo changes apply mid-loop.
/// Returns `false` as soon as `stop` is observed, `true` once the target
/// duration has elapsed.
pub fn sleep_chunked(stop: &AtomicBool, chunk: Duration, mut target: impl FnMut() -> Duration) -> bool {
    let chunk = chunk.min(MAX_SLEEP_CHUNK).max(Duration::from_millis(1));
    let started = Instant::now();
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let elapsed = started.elapsed();
        let total = target();
        if elapsed >= total {
            return true;
        }
        thread::sleep((total - elapsed).min(chunk));
    }
}
