//! Transport mirroring to the real-time engine.
//!
//! [`TransportSync`] is the single authority over what the engine plays. It
//! owns a background mirror thread that compares the current parameters and
//! resolved sequence against what was last sent and pushes only the
//! differences. Explicit commands (start, stop, chain control) push
//! immediately and update the same bookkeeping under the same lock, so a
//! mirror tick can never overwrite them with stale data.
//!
//! Every send is best-effort. Failures are counted and logged, never
//! returned; the next mirror cycle is the retry.
//!
//! # Lanes
//!
//! The engine has a single-sequence lane (`seq`) and a chain lane (`chain`).
//! While chain mode is active the mirror leaves the sequence lane alone.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::chain::{ChainDriver, RunnerControl};
use crate::channel::{ChannelStats, ControlChannel, ControlMessage};
use crate::selection::{clamp_gate, SelectionState, Step, REST};
use crate::slots::{ActiveSlot, ChainSlot};
use crate::state::{AppState, StateManager};
use crate::theory::{snap_to_scale, PitchClass};

/// Transport tuning.
#[derive(Clone, Copy, Debug)]
pub struct TransportOptions {
    /// Mirror loop period.
    pub mirror_interval: Duration,
    /// Delay before restarting playback after a chain is armed.
    pub settle: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            mirror_interval: Duration::from_millis(50),
            settle: Duration::from_millis(20),
        }
    }
}

/// Settings compared to decide whether a parameter push is due.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParameterTuple {
    pub tempo: f64,
    pub subdivision: u32,
    pub gate_percent: f64,
    pub channel: u8,
    pub transpose: i32,
    pub slave_mode: bool,
}

impl ParameterTuple {
    pub fn from_state(state: &AppState) -> Self {
        let sel = &state.selection;
        Self {
            tempo: (sel.tempo * 10_000.0).round() / 10_000.0,
            subdivision: sel.subdivision.max(1),
            gate_percent: (clamp_gate(sel.gate_percent) * 100.0).round() / 100.0,
            channel: state.channel.clamp(1, 16),
            transpose: sel.transpose,
            slave_mode: sel.slave_mode,
        }
    }

    pub fn to_message(self, immediate: bool) -> ControlMessage {
        ControlMessage::Set {
            tempo: self.tempo,
            subdivision: self.subdivision,
            gate: self.gate_percent,
            channel: self.channel,
            transpose: self.transpose,
            slave_mode: self.slave_mode,
            immediate,
        }
    }
}

/// Output mapping: lift one octave, transpose, optionally snap, clamp.
pub fn map_out_note(note: u8, transpose: i32, allowed: Option<&BTreeSet<PitchClass>>) -> i32 {
    let mut out = note as i32 + transpose + 12;
    if let Some(allowed) = allowed {
        out = snap_to_scale(out, allowed);
    }
    out.clamp(0, 127)
}

fn output_allowed(sel: &SelectionState) -> Option<&BTreeSet<PitchClass>> {
    sel.diatonic_active().then_some(&sel.allowed_pitch_classes)
}

/// Wire notes for `steps` under the selection's output mapping.
pub fn map_steps(steps: &[Step], sel: &SelectionState) -> Vec<i32> {
    let allowed = output_allowed(sel);
    steps
        .iter()
        .map(|s| match s {
            Step::Note(n) => map_out_note(*n, sel.transpose, allowed),
            Step::Rest => REST,
        })
        .collect()
}

fn map_wire_notes(notes: &[i32], sel: &SelectionState) -> Vec<i32> {
    let allowed = output_allowed(sel);
    notes
        .iter()
        .map(|n| match u8::try_from(*n) {
            Ok(n) if n <= 127 => map_out_note(n, sel.transpose, allowed),
            _ => REST,
        })
        .collect()
}

fn has_playable(notes: &[i32]) -> bool {
    notes.iter().any(|n| *n != REST)
}

#[derive(Default)]
struct SyncInner {
    last_params: Option<ParameterTuple>,
    last_seq: Option<Vec<i32>>,
    /// Content that was current when the lane was forced silent. The mirror
    /// keeps the lane silent until the content differs.
    held: Option<Vec<i32>>,
    chain_active: bool,
    armed_restart: bool,
    /// Mapped chain and start index, re-sent on start.
    last_chain: Option<(Vec<ChainSlot>, usize)>,
    /// The empty chain that releases the engine's chain lane was not
    /// delivered yet.
    release_pending: bool,
    /// Bumped by every explicit command; deferred work checks it.
    generation: u64,
    runner: Option<RunnerControl>,
}

struct SyncShared {
    state: StateManager,
    channel: Arc<dyn ControlChannel>,
    stats: ChannelStats,
    inner: Mutex<SyncInner>,
    shutdown: AtomicBool,
    settle: Duration,
}

impl SyncShared {
    fn lock(&self) -> MutexGuard<'_, SyncInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one message. Returns whether it left the process.
    fn send(&self, msg: ControlMessage) -> bool {
        let result = self.channel.send(&msg);
        self.stats.record(&result);
        match result {
            Ok(()) => {
                log::debug!("[TRANSPORT] -> {}", msg.kind());
                true
            }
            Err(e) => {
                log::debug!("[TRANSPORT] {} not delivered: {}", msg.kind(), e);
                false
            }
        }
    }

    // Bookkeeping below only records what was delivered, so the mirror
    // retries anything that failed.

    fn silence(&self, inner: &mut SyncInner) {
        if self.send(ControlMessage::silence()) {
            inner.last_seq = Some(vec![REST]);
        }
    }

    /// Current parameters and mapped stored sequence.
    fn read_current(&self) -> (ParameterTuple, Vec<i32>, bool) {
        self.state.with_state_read(|s| {
            (
                ParameterTuple::from_state(s),
                map_steps(&s.selection.sequence, &s.selection),
                s.running,
            )
        })
    }

    fn push_params(&self, inner: &mut SyncInner, params: ParameterTuple, immediate: bool) {
        if self.send(params.to_message(immediate)) {
            inner.last_params = Some(params);
        }
    }

    fn push_seq(&self, inner: &mut SyncInner, notes: Vec<i32>) {
        inner.held = None;
        if self.send(ControlMessage::Seq {
            notes: notes.clone(),
        }) {
            inner.last_seq = Some(notes);
        }
    }

    /// Parameters, plus the sequence unless a chain owns playback.
    fn push_all(&self, inner: &mut SyncInner) {
        let (params, seq, _) = self.read_current();
        self.push_params(inner, params, true);
        if !inner.chain_active {
            self.push_seq(inner, seq);
        }
    }

    /// Force the lane silent and keep it so. The hold stays even if the
    /// silence was not delivered; the mirror re-sends it until it is.
    fn hold_silence(&self, inner: &mut SyncInner) {
        let (_, seq, _) = self.read_current();
        self.silence(inner);
        inner.held = Some(seq);
    }

    fn release_chain(&self, inner: &mut SyncInner) {
        inner.release_pending = !self.send(ControlMessage::Chain {
            slots: Vec::new(),
            index: 0,
        });
    }

    /// One mirror cycle.
    fn mirror_tick(&self) {
        let mut inner = self.lock();
        let (params, seq, running) = self.read_current();

        if inner.last_params != Some(params) {
            log::trace!("[TRANSPORT] mirror: parameters changed");
            self.push_params(&mut inner, params, false);
        }

        if inner.chain_active {
            return;
        }

        if inner.release_pending {
            log::debug!("[TRANSPORT] mirror: retrying chain release");
            self.release_chain(&mut inner);
        }

        if inner.held.as_ref() == Some(&seq) {
            if inner.last_seq.as_deref() != Some(&[REST][..]) {
                log::debug!("[TRANSPORT] mirror: retrying silence");
                self.silence(&mut inner);
            } else {
                log::trace!("[TRANSPORT] mirror: holding silence");
            }
            return;
        }
        inner.held = None;

        if inner.last_seq.as_ref() != Some(&seq) {
            log::trace!("[TRANSPORT] mirror: sequence changed");
            self.push_seq(&mut inner, seq.clone());
        }

        if running && inner.armed_restart && !params.slave_mode && has_playable(&seq) {
            log::info!("[TRANSPORT] Sequence available, restarting");
            if self.send(ControlMessage::Start) {
                inner.armed_restart = false;
            }
        }
    }
}

impl ChainDriver for SyncShared {
    fn tempo(&self) -> f64 {
        self.state.tempo()
    }

    fn subdivision(&self) -> u32 {
        self.state.subdivision()
    }

    fn owns_chain(&self) -> bool {
        self.lock().chain_active
    }

    fn apply_slot(&self, slot: &ActiveSlot) {
        let mut inner = self.lock();
        self.state.with_state_write(|s| {
            s.selection.sequence = slot.snapshot.sequence.clone();
            s.bump_version();
        });
        log::debug!("[TRANSPORT] Applying slot {}", slot.index);
        self.push_all(&mut inner);
    }
}

/// Mirrors transport state to the engine.
///
/// Dropping the transport stops the mirror thread. It does not send `stop`.
pub struct TransportSync {
    shared: Arc<SyncShared>,
    shutdown_tx: Option<Sender<()>>,
    mirror: Option<JoinHandle<()>>,
}

impl TransportSync {
    /// Create the transport, send a silent baseline and start mirroring.
    pub fn new(state: StateManager, channel: Arc<dyn ControlChannel>, options: TransportOptions) -> Self {
        log::info!("[TRANSPORT] Engine channel: {}", channel.describe());
        let shared = Arc::new(SyncShared {
            state,
            channel,
            stats: ChannelStats::new(),
            inner: Mutex::new(SyncInner::default()),
            shutdown: AtomicBool::new(false),
            settle: options.settle,
        });
        {
            let mut inner = shared.lock();
            shared.silence(&mut inner);
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let thread_shared = Arc::clone(&shared);
        let interval = options.mirror_interval;
        let mirror = thread::Builder::new()
            .name("gord-mirror".to_string())
            .spawn(move || mirror_loop(&thread_shared, &shutdown_rx, interval));
        let mirror = match mirror {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("[TRANSPORT] Failed to spawn mirror thread: {}", e);
                None
            }
        };

        Self {
            shared,
            shutdown_tx: Some(shutdown_tx),
            mirror,
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.shared.state
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.is_running()
    }

    pub fn chain_active(&self) -> bool {
        self.shared.lock().chain_active
    }

    /// Datagrams sent and failed so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.shared.stats.sent(), self.shared.stats.failed())
    }

    /// Driver view for a [`crate::chain::ChainRunner`].
    pub fn driver(&self) -> Arc<dyn ChainDriver> {
        self.shared.clone()
    }

    /// Runner to stop together with the transport.
    pub fn attach_runner(&self, runner: RunnerControl) {
        self.shared.lock().runner = Some(runner);
    }

    pub fn detach_runner(&self) {
        self.shared.lock().runner = None;
    }

    /// Start playback. Does nothing if already running.
    pub fn start(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if shared.state.is_running() {
            log::debug!("[TRANSPORT] Start ignored, already running");
            return;
        }
        inner.generation += 1;
        shared.state.set_running(true);
        let (params, seq, _) = shared.read_current();

        if inner.chain_active {
            log::info!("[TRANSPORT] Starting (chain)");
            inner.armed_restart = false;
            shared.push_params(&mut inner, params, true);
            if let Some((slots, index)) = inner.last_chain.clone() {
                shared.send(ControlMessage::Chain { slots, index });
            }
        } else {
            log::info!("[TRANSPORT] Starting");
            inner.armed_restart = !has_playable(&seq);
            shared.send(ControlMessage::Stop);
            shared.silence(&mut inner);
            shared.push_params(&mut inner, params, true);
            shared.push_seq(&mut inner, seq);
        }

        if !params.slave_mode {
            shared.send(ControlMessage::Start);
        }
    }

    /// Stop playback and any attached runner. Chain mode is kept so the
    /// next start resumes the same chain.
    ///
    /// A playing runner counts as running even when the transport itself
    /// was never started (a slaved chain).
    pub fn stop(&self) {
        let runner = {
            let shared = &self.shared;
            let mut inner = shared.lock();
            inner.generation += 1;
            let runner = inner.runner.clone();
            let runner_active = runner.as_ref().is_some_and(RunnerControl::is_running);
            if shared.state.is_running() || runner_active {
                log::info!("[TRANSPORT] Stopping");
                shared.send(ControlMessage::Stop);
                inner.armed_restart = false;
                shared.state.set_running(false);
            } else {
                log::debug!("[TRANSPORT] Stop ignored, not running");
            }
            runner
        };
        if let Some(runner) = runner {
            runner.stop();
        }
    }

    /// Hand playback to a chain starting at `start_index`.
    ///
    /// Notes go through the same output mapping as the sequence lane. When
    /// running as timing master, playback restarts after the settle delay.
    pub fn play_chain(&self, slots: &[ChainSlot], start_index: usize) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.generation += 1;
        let generation = inner.generation;

        shared.send(ControlMessage::Stop);
        inner.chain_active = true;
        inner.release_pending = false;
        inner.armed_restart = false;
        shared.silence(&mut inner);
        shared.push_all(&mut inner);

        let mapped: Vec<ChainSlot> = shared.state.with_state_read(|s| {
            slots
                .iter()
                .map(|slot| ChainSlot {
                    notes: map_wire_notes(&slot.notes, &s.selection),
                    loops: slot.loops,
                })
                .collect()
        });
        log::info!(
            "[TRANSPORT] Chain armed: {} slots from index {}",
            mapped.len(),
            start_index
        );
        inner.last_chain = Some((mapped.clone(), start_index));
        if mapped.is_empty() {
            return;
        }
        shared.send(ControlMessage::Chain {
            slots: mapped,
            index: start_index,
        });

        if shared.state.is_running() && !shared.state.is_slave() {
            drop(inner);
            self.schedule_begin(generation);
        }
    }

    fn schedule_begin(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("gord-begin".to_string())
            .spawn(move || {
                thread::sleep(shared.settle);
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let inner = shared.lock();
                if inner.generation != generation {
                    log::debug!("[TRANSPORT] Deferred start superseded");
                    return;
                }
                if shared.state.is_running() && !shared.state.is_slave() {
                    shared.send(ControlMessage::Start);
                }
            });
        if let Err(e) = spawned {
            log::warn!("[TRANSPORT] Failed to schedule start: {}", e);
        }
    }

    /// Leave chain mode. The sequence lane is forced silent and stays
    /// silent until the selection produces new content.
    pub fn stop_chain(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.generation += 1;
        log::info!("[TRANSPORT] Chain released");
        inner.chain_active = false;
        inner.last_chain = None;
        shared.release_chain(&mut inner);
        shared.hold_silence(&mut inner);
    }

    /// All notes off and an all-rest lane, whatever the mode.
    pub fn panic(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.generation += 1;
        log::info!("[TRANSPORT] Panic");
        shared.send(ControlMessage::Panic);
        shared.hold_silence(&mut inner);
    }

    /// Switch between external and internal clock.
    pub fn set_slave_mode(&self, slave: bool) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.generation += 1;
        shared.state.with_state_write(|s| s.selection.slave_mode = slave);
        log::info!("[TRANSPORT] Slave mode: {}", slave);
        let (params, _, _) = shared.read_current();
        shared.push_params(&mut inner, params, true);
        if !inner.chain_active {
            shared.silence(&mut inner);
        }
        shared.push_all(&mut inner);
    }

    /// Apply a tempo or subdivision change without leftover notes.
    pub fn apply_timing_change(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.generation += 1;
        if !shared.state.is_running() {
            shared.push_all(&mut inner);
            return;
        }
        let master = !shared.state.is_slave();
        if master {
            shared.send(ControlMessage::Stop);
        }
        if !inner.chain_active {
            shared.silence(&mut inner);
        }
        shared.push_all(&mut inner);
        if master {
            shared.send(ControlMessage::Start);
        }
    }

    /// Replace the stored sequence and push it now.
    pub fn set_sequence(&self, steps: &[Step]) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        let notes = shared.state.with_state_write(|s| {
            s.selection.sequence = steps.to_vec();
            s.bump_version();
            map_steps(steps, &s.selection)
        });
        shared.push_seq(&mut inner, notes);
    }

    /// Run one mirror cycle on the calling thread.
    pub fn mirror_now(&self) {
        self.shared.mirror_tick();
    }
}

fn mirror_loop(shared: &SyncShared, shutdown_rx: &Receiver<()>, interval: Duration) {
    log::debug!("[TRANSPORT] Mirror loop started ({:?})", interval);
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => shared.mirror_tick(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("[TRANSPORT] Mirror loop stopped");
}

impl Drop for TransportSync {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shutdown_tx.take();
        if let Some(handle) = self.mirror.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for TransportSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSync")
            .field("running", &self.is_running())
            .field("chain_active", &self.chain_active())
            .finish_non_exhaustive()
    }
}
