//! Background chain scheduler.
//!
//! The [`ChainRunner`] walks the active slots in order, repeating each slot
//! for its loop count and the whole list for the global loop count. It does
//! no audio I/O itself: per loop it either hands the slot to its
//! [`ChainDriver`] or, when the engine already holds the chain, only keeps
//! time and reports progress to its [`ChainListener`].
//!
//! # Threading
//!
//! One worker thread per run. Sleeps are chunked so a stop request is seen
//! within one chunk; [`ChainRunner::stop`] waits at most the configured join
//! timeout and then detaches the worker.
//!
//! The active list is copied at the top of every pass. Edits made through
//! [`ChainRunner::set_slots`] while running apply from the next pass.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::slots::{ActiveSlot, LoopCount, SlotList};
use crate::timing::{loop_duration, sleep_chunked, MAX_SLEEP_CHUNK};

/// Live transport values and slot playback for the runner.
pub trait ChainDriver: Send + Sync {
    fn tempo(&self) -> f64;
    fn subdivision(&self) -> u32;

    /// Whether the engine holds the whole chain already. When true the
    /// runner only keeps time.
    fn owns_chain(&self) -> bool;

    /// Make `slot` the audible pattern.
    fn apply_slot(&self, slot: &ActiveSlot);
}

/// Progress report for one loop boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainTick {
    /// Row in the slot list.
    pub slot_index: usize,
    /// 1-based loop within the slot; 0 on the final inactive tick.
    pub current_loop: u32,
    pub total: LoopCount,
    pub active: bool,
}

/// Receives runner progress. Called on the runner thread.
pub trait ChainListener: Send + Sync {
    fn on_tick(&self, tick: ChainTick);
    fn on_complete(&self);
}

/// Runner tuning.
#[derive(Clone, Copy, Debug)]
pub struct ChainOptions {
    pub global_loops: LoopCount,
    pub sleep_chunk: Duration,
    pub join_timeout: Duration,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            global_loops: LoopCount::Finite(1),
            sleep_chunk: MAX_SLEEP_CHUNK,
            join_timeout: Duration::from_millis(250),
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    thread_id: ThreadId,
    handle: JoinHandle<()>,
}

/// State shared between the runner, its worker and [`RunnerControl`]s.
struct RunnerCore {
    slots: Mutex<Vec<ActiveSlot>>,
    listener: Mutex<Option<Arc<dyn ChainListener>>>,
    /// Slot currently playing and its loop total.
    current: Mutex<Option<(usize, LoopCount)>>,
    worker: Mutex<Option<Worker>>,
    running: AtomicBool,
    global_loops: Mutex<LoopCount>,
    global_counter: AtomicU32,
    sleep_chunk: Duration,
    join_timeout: Duration,
}

impl RunnerCore {
    fn listener(&self) -> Option<Arc<dyn ChainListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, current: Option<(usize, LoopCount)>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = current;
    }

    /// Fire the inactive tick for the slot that was playing, if any.
    fn release_current(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some((slot_index, total)), Some(listener)) = (current, self.listener()) {
            listener.on_tick(ChainTick {
                slot_index,
                current_loop: 0,
                total,
                active: false,
            });
        }
    }

    fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if was_running {
            log::info!("[CHAIN] Stopping");
        }
        self.release_current();

        if worker.thread_id == thread::current().id() {
            // Called from a listener on the worker itself.
            return;
        }
        match worker.done_rx.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "[CHAIN] Worker did not exit within {:?}, detaching",
                    self.join_timeout
                );
            }
        }
    }
}

/// Cloneable stop handle for a [`ChainRunner`].
///
/// Holds no reference to the driver, so a driver may keep one without
/// creating a reference cycle.
#[derive(Clone)]
pub struct RunnerControl {
    core: Arc<RunnerCore>,
}

impl RunnerControl {
    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RunnerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerControl")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Autonomous scheduler over the active slots.
pub struct ChainRunner {
    core: Arc<RunnerCore>,
    driver: Arc<dyn ChainDriver>,
}

impl ChainRunner {
    pub fn new(driver: Arc<dyn ChainDriver>, options: ChainOptions) -> Self {
        Self {
            core: Arc::new(RunnerCore {
                slots: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                current: Mutex::new(None),
                worker: Mutex::new(None),
                running: AtomicBool::new(false),
                global_loops: Mutex::new(options.global_loops),
                global_counter: AtomicU32::new(0),
                sleep_chunk: options.sleep_chunk.min(MAX_SLEEP_CHUNK),
                join_timeout: options.join_timeout,
            }),
            driver,
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn ChainListener>) {
        *self
            .core
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Replace the active list. A running pass keeps its own copy.
    pub fn set_slots(&self, slots: Vec<ActiveSlot>) {
        *self.core.slots.lock().unwrap_or_else(PoisonError::into_inner) = slots;
    }

    /// Recompute the active list from a slot list.
    pub fn rebuild(&self, list: &SlotList) {
        self.set_slots(list.active_slots());
    }

    pub fn slots(&self) -> Vec<ActiveSlot> {
        self.core
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_global_loops(&self, loops: LoopCount) {
        *self
            .core
            .global_loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = loops;
    }

    pub fn global_loops(&self) -> LoopCount {
        *self
            .core
            .global_loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Completed passes since the last start.
    pub fn global_loop_counter(&self) -> u32 {
        self.core.global_counter.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    pub fn control(&self) -> RunnerControl {
        RunnerControl {
            core: Arc::clone(&self.core),
        }
    }

    /// Start a run. Returns whether the runner is running afterwards; with
    /// no active slots nothing starts.
    pub fn start(&self) -> bool {
        if self.is_running() {
            return true;
        }
        if self.slots().is_empty() {
            log::debug!("[CHAIN] Start ignored, no active slots");
            return false;
        }
        // Reap a finished worker from a previous run.
        self.core.stop();

        self.core.global_counter.store(0, Ordering::Release);
        self.core.running.store(true, Ordering::Release);

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(1);
        let core = Arc::clone(&self.core);
        let driver = Arc::clone(&self.driver);
        let thread_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("gord-chain".to_string())
            .spawn(move || {
                run(&core, driver.as_ref(), &thread_stop);
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(handle) => {
                log::info!("[CHAIN] Started (global loops: {})", self.global_loops());
                *self.core.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker {
                    stop,
                    done_rx,
                    thread_id: handle.thread().id(),
                    handle,
                });
                true
            }
            Err(e) => {
                log::warn!("[CHAIN] Failed to spawn worker: {}", e);
                self.core.running.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Stop the run and wait (bounded) for the worker to exit.
    pub fn stop(&self) {
        self.core.stop();
    }
}

impl Drop for ChainRunner {
    fn drop(&mut self) {
        self.core.stop();
    }
}

impl std::fmt::Debug for ChainRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRunner")
            .field("running", &self.is_running())
            .field("global_loop_counter", &self.global_loop_counter())
            .finish_non_exhaustive()
    }
}

/// Worker body.
fn run(core: &RunnerCore, driver: &dyn ChainDriver, stop: &AtomicBool) {
    loop {
        let pass = core.slots.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if pass.is_empty() {
            log::info!("[CHAIN] No active slots left, stopping");
            if !stop.load(Ordering::Acquire) {
                core.running.store(false, Ordering::Release);
                core.release_current();
            }
            return;
        }

        for slot in &pass {
            let steps = slot.snapshot.sequence.len();
            let mut current_loop: u32 = 1;
            loop {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                if current_loop == 1 && !driver.owns_chain() {
                    driver.apply_slot(slot);
                }
                core.set_current(Some((slot.index, slot.loops)));
                if let Some(listener) = core.listener() {
                    listener.on_tick(ChainTick {
                        slot_index: slot.index,
                        current_loop,
                        total: slot.loops,
                        active: true,
                    });
                }
                let finished = sleep_chunked(stop, core.sleep_chunk, || {
                    loop_duration(steps, driver.tempo(), driver.subdivision())
                });
                if !finished {
                    return;
                }
                if slot.loops.reached(current_loop) {
                    break;
                }
                current_loop = current_loop.saturating_add(1);
            }
        }

        let passes = core.global_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let target = *core.global_loops.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!("[CHAIN] Pass {} of {} complete", passes, target);
        if target.reached(passes) {
            if stop.load(Ordering::Acquire) {
                return;
            }
            log::info!("[CHAIN] Complete after {} passes", passes);
            core.running.store(false, Ordering::Release);
            core.release_current();
            if let Some(listener) = core.listener() {
                listener.on_complete();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::Step;
    use crate::slots::SlotSnapshot;
    use crossbeam_channel::{unbounded, Sender};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct FastDriver {
        owns: bool,
        applied: AtomicUsize,
    }

    impl ChainDriver for FastDriver {
        fn tempo(&self) -> f64 {
            400.0
        }
        fn subdivision(&self) -> u32 {
            128
        }
        fn owns_chain(&self) -> bool {
            self.owns
        }
        fn apply_slot(&self, _slot: &ActiveSlot) {
            self.applied.fetch_add(1, Ordering::SeqCst);
        }
    }

    enum Event {
        Tick(ChainTick),
        Complete,
    }

    struct Recorder {
        tx: Sender<Event>,
    }

    impl ChainListener for Recorder {
        fn on_tick(&self, tick: ChainTick) {
            let _ = self.tx.send(Event::Tick(tick));
        }
        fn on_complete(&self) {
            let _ = self.tx.send(Event::Complete);
        }
    }

    fn active(index: usize, notes: &[u8], loops: LoopCount) -> ActiveSlot {
        ActiveSlot {
            index,
            snapshot: SlotSnapshot::new("s", notes.iter().copied().map(Step::from).collect(), loops),
            loops,
        }
    }

    fn runner(owns: bool, global: LoopCount) -> (ChainRunner, Arc<FastDriver>, Receiver<Event>) {
        let driver = Arc::new(FastDriver {
            owns,
            applied: AtomicUsize::new(0),
        });
        let runner = ChainRunner::new(
            driver.clone(),
            ChainOptions {
                global_loops: global,
                ..ChainOptions::default()
            },
        );
        let (tx, rx) = unbounded();
        runner.set_listener(Arc::new(Recorder { tx }));
        (runner, driver, rx)
    }

    /// Collect events until completion or timeout.
    fn drain_until_complete(rx: &Receiver<Event>) -> (Vec<ChainTick>, usize) {
        let mut ticks = Vec::new();
        let mut completes = 0;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            match event {
                Event::Tick(t) => ticks.push(t),
                Event::Complete => {
                    completes += 1;
                    break;
                }
            }
        }
        (ticks, completes)
    }

    #[test]
    fn test_two_slot_chain_completes_once() {
        let (runner, driver, rx) = runner(false, LoopCount::Finite(2));
        runner.set_slots(vec![
            active(0, &[60, 64, 67], LoopCount::Finite(2)),
            active(1, &[62, 65, 69], LoopCount::Finite(1)),
        ]);
        assert!(runner.start());

        let (ticks, completes) = drain_until_complete(&rx);
        assert_eq!(completes, 1);
        let active_ticks: Vec<_> = ticks.iter().filter(|t| t.active).collect();
        assert_eq!(active_ticks.len(), 6);
        let loops: Vec<(usize, u32)> = active_ticks
            .iter()
            .map(|t| (t.slot_index, t.current_loop))
            .collect();
        assert_eq!(loops, vec![(0, 1), (0, 2), (1, 1), (0, 1), (0, 2), (1, 1)]);
        let last = ticks.last().unwrap();
        assert!(!last.active);
        assert_eq!(last.slot_index, 1);

        assert_eq!(runner.global_loop_counter(), 2);
        assert!(!runner.is_running());
        // One apply per slot per pass.
        assert_eq!(driver.applied.load(Ordering::SeqCst), 4);

        // No further callbacks after completion, even on stop.
        runner.stop();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_owned_chain_only_keeps_time() {
        let (runner, driver, rx) = runner(true, LoopCount::Finite(1));
        runner.set_slots(vec![active(3, &[60], LoopCount::Finite(2))]);
        assert!(runner.start());
        let (ticks, completes) = drain_until_complete(&rx);
        assert_eq!(completes, 1);
        assert_eq!(ticks.iter().filter(|t| t.active).count(), 2);
        assert_eq!(driver.applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_without_slots_is_noop() {
        let (runner, _driver, rx) = runner(false, LoopCount::Finite(1));
        assert!(!runner.start());
        assert!(!runner.is_running());
        runner.stop();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_infinite_slot_runs_until_stopped() {
        let (runner, _driver, rx) = runner(true, LoopCount::Finite(1));
        runner.set_slots(vec![active(0, &[60, 62], LoopCount::Infinite)]);
        assert!(runner.start());

        let mut seen = 0;
        while seen < 5 {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(Event::Tick(t)) if t.active => seen += 1,
                Ok(_) => {}
                Err(_) => panic!("runner stalled"),
            }
        }
        assert_eq!(runner.global_loop_counter(), 0);
        assert!(runner.is_running());

        let started = Instant::now();
        runner.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!runner.is_running());

        // Final inactive tick, and never a completion.
        let mut inactive = 0;
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
            match event {
                Event::Tick(t) if !t.active => inactive += 1,
                Event::Tick(_) => {}
                Event::Complete => panic!("infinite slot completed"),
            }
        }
        assert_eq!(inactive, 1);
        assert_eq!(runner.global_loop_counter(), 0);
    }

    #[test]
    fn test_edits_apply_from_next_pass() {
        let (runner, _driver, rx) = runner(true, LoopCount::Finite(2));
        runner.set_slots(vec![
            active(0, &[60, 60, 60, 60], LoopCount::Finite(1)),
            active(1, &[62, 62, 62, 62], LoopCount::Finite(1)),
        ]);
        assert!(runner.start());
        // Wait for the first tick, then drop slot 1 mid-pass.
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Event::Tick(t)) => assert_eq!(t.slot_index, 0),
            _ => panic!("no first tick"),
        }
        runner.set_slots(vec![active(0, &[60, 60, 60, 60], LoopCount::Finite(1))]);

        let (ticks, completes) = drain_until_complete(&rx);
        assert_eq!(completes, 1);
        let order: Vec<usize> = ticks.iter().filter(|t| t.active).map(|t| t.slot_index).collect();
        // Slot 1 still plays in the first pass; the second pass has only slot 0.
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_restart_resets_counter() {
        let (runner, _driver, rx) = runner(true, LoopCount::Finite(1));
        runner.set_slots(vec![active(0, &[60], LoopCount::Finite(1))]);
        assert!(runner.start());
        assert_eq!(drain_until_complete(&rx).1, 1);
        assert_eq!(runner.global_loop_counter(), 1);
        assert!(runner.start());
        assert_eq!(drain_until_complete(&rx).1, 1);
        assert_eq!(runner.global_loop_counter(), 1);
    }

    #[test]
    fn test_stop_from_listener_does_not_deadlock() {
        struct StopOnComplete {
            control: Mutex<Option<RunnerControl>>,
            tx: Sender<()>,
        }
        impl ChainListener for StopOnComplete {
            fn on_tick(&self, _tick: ChainTick) {}
            fn on_complete(&self) {
                if let Some(c) = self.control.lock().unwrap().as_ref() {
                    c.stop();
                }
                let _ = self.tx.send(());
            }
        }

        let (runner, _driver, _rx) = runner(true, LoopCount::Finite(1));
        let (tx, rx) = unbounded();
        let listener = Arc::new(StopOnComplete {
            control: Mutex::new(Some(runner.control())),
            tx,
        });
        runner.set_listener(listener.clone());
        runner.set_slots(vec![active(0, &[60], LoopCount::Finite(1))]);
        assert!(runner.start());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(!runner.is_running());
        listener.control.lock().unwrap().take();
    }
}
