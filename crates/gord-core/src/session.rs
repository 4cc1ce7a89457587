//! Chain session: the controlling side of chain playback.
//!
//! A [`ChainSession`] ties the slot list in the shared state to a
//! [`ChainRunner`] and the [`TransportSync`]. It owns the link lifecycle and
//! routes slot edits:
//!
//! - not linked: edits only rebuild the runner's active list
//! - linked, runner idle: the new chain is armed on the engine right away
//! - linked, runner playing: the new chain goes to a one-slot mailbox and is
//!   armed when the playing slot starts its next first loop, so the audible
//!   pattern never changes mid-loop

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::chain::{ChainListener, ChainOptions, ChainRunner, ChainTick};
use crate::mailbox::Mailbox;
use crate::selection::SelectionState;
use crate::sequence::SequenceGenerator;
use crate::slots::{to_chain_slots, ChainSlot, LoopCount, SlotList};
use crate::theory::ScaleLookup;
use crate::transport::TransportSync;

/// Notifications for the presentation layer. Tick and completion calls
/// arrive on the runner thread.
pub trait ChainObserver: Send + Sync {
    fn on_tick(&self, _tick: ChainTick) {}
    fn on_complete(&self) {}
    /// Slots or link state changed.
    fn on_changed(&self) {}
}

/// A chain definition waiting for a loop boundary.
struct PendingChain {
    slots: Vec<ChainSlot>,
    /// Slot-list row of each chain entry.
    rows: Vec<usize>,
}

struct SessionShared {
    transport: Arc<TransportSync>,
    options: ChainOptions,
    runner: Mutex<Option<ChainRunner>>,
    pending: Mailbox<PendingChain>,
    observer: Mutex<Option<Arc<dyn ChainObserver>>>,
}

impl SessionShared {
    fn observer(&self) -> Option<Arc<dyn ChainObserver>> {
        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_changed(&self) {
        if let Some(observer) = self.observer() {
            observer.on_changed();
        }
    }

    fn current_chain(&self) -> PendingChain {
        let active = self
            .transport
            .state()
            .with_state_read(|s| s.slots.active_slots());
        PendingChain {
            slots: to_chain_slots(&active),
            rows: active.iter().map(|a| a.index).collect(),
        }
    }

    /// Arm a queued chain, continuing at `row` when it is still part of it.
    fn install_pending(&self, row: usize) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let index = pending.rows.iter().position(|r| *r == row).unwrap_or(0);
        log::debug!(
            "[SESSION] Installing queued chain ({} slots) at index {}",
            pending.slots.len(),
            index
        );
        self.transport.play_chain(&pending.slots, index);
    }

    fn handle_complete(&self) {
        if self.transport.state().is_slave() {
            // The host clock keeps running; silence the chain instead.
            log::info!("[SESSION] Chain complete, releasing chain");
            self.transport.stop_chain();
        } else {
            log::info!("[SESSION] Chain complete, stopping transport");
            self.transport.stop();
        }
    }
}

struct SessionListener {
    session: Weak<SessionShared>,
}

impl ChainListener for SessionListener {
    fn on_tick(&self, tick: ChainTick) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if tick.active && tick.current_loop == 1 {
            session.install_pending(tick.slot_index);
        }
        if let Some(observer) = session.observer() {
            observer.on_tick(tick);
        }
    }

    fn on_complete(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.handle_complete();
        if let Some(observer) = session.observer() {
            observer.on_complete();
        }
    }
}

/// Link lifecycle and slot editing on top of a transport.
pub struct ChainSession {
    shared: Arc<SessionShared>,
}

impl ChainSession {
    pub fn new(transport: Arc<TransportSync>, options: ChainOptions) -> Self {
        let shared = Arc::new(SessionShared {
            transport,
            options,
            runner: Mutex::new(None),
            pending: Mailbox::new(),
            observer: Mutex::new(None),
        });
        let session = Self { shared };
        let runner = session.new_runner();
        *session.lock_runner() = Some(runner);
        session
    }

    pub fn set_observer(&self, observer: Arc<dyn ChainObserver>) {
        *self
            .shared
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn transport(&self) -> &TransportSync {
        &self.shared.transport
    }

    fn lock_runner(&self) -> std::sync::MutexGuard<'_, Option<ChainRunner>> {
        self.shared
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn new_runner(&self) -> ChainRunner {
        let global_loops = self
            .shared
            .transport
            .state()
            .with_state_read(|s| s.chain.global_loops);
        let runner = ChainRunner::new(
            self.shared.transport.driver(),
            ChainOptions {
                global_loops,
                ..self.shared.options
            },
        );
        runner.set_listener(Arc::new(SessionListener {
            session: Arc::downgrade(&self.shared),
        }));
        runner.rebuild(&self.slots());
        runner
    }

    /// Copy of the slot list.
    pub fn slots(&self) -> SlotList {
        self.shared.transport.state().with_state_read(|s| s.slots.clone())
    }

    pub fn is_linked(&self) -> bool {
        self.shared.transport.state().with_state_read(|s| s.chain.linked)
    }

    pub fn is_runner_active(&self) -> bool {
        self.lock_runner().as_ref().is_some_and(ChainRunner::is_running)
    }

    /// Completed passes and the global target.
    pub fn global_progress(&self) -> (u32, LoopCount) {
        match self.lock_runner().as_ref() {
            Some(runner) => (runner.global_loop_counter(), runner.global_loops()),
            None => (0, self.shared.transport.state().with_state_read(|s| s.chain.global_loops)),
        }
    }

    /// Let the slots drive playback.
    pub fn link(&self) {
        let state = self.shared.transport.state();
        let already = state.with_state_write(|s| std::mem::replace(&mut s.chain.linked, true));
        if already {
            return;
        }
        log::info!("[SESSION] Linked");

        let old = self.lock_runner().take();
        if let Some(old) = old {
            old.stop();
        }
        let runner = self.new_runner();
        self.shared.transport.attach_runner(runner.control());
        self.shared.pending.take();

        let chain = self.shared.current_chain();
        let start_runner = !chain.slots.is_empty() && (state.is_running() || state.is_slave());
        if !chain.slots.is_empty() {
            self.shared.transport.play_chain(&chain.slots, 0);
        }
        *self.lock_runner() = Some(runner);
        if start_runner {
            if let Some(runner) = self.lock_runner().as_ref() {
                runner.start();
            }
        }
        self.shared.notify_changed();
    }

    /// Return playback to the live selection.
    pub fn unlink(&self) {
        let state = self.shared.transport.state();
        let was_linked = state.with_state_write(|s| std::mem::replace(&mut s.chain.linked, false));
        if !was_linked {
            return;
        }
        log::info!("[SESSION] Unlinked");
        self.shared.transport.stop_chain();
        self.shared.transport.detach_runner();
        self.shared.pending.take();

        let old = self.lock_runner().take();
        if let Some(old) = old {
            old.stop();
        }
        let runner = self.new_runner();
        *self.lock_runner() = Some(runner);
        self.shared.notify_changed();
    }

    /// Start the transport, and the runner when linked.
    pub fn start(&self) {
        self.shared.transport.start();
        if self.is_linked() {
            if let Some(runner) = self.lock_runner().as_ref() {
                runner.start();
            }
        }
    }

    /// Stop the transport (which stops an attached runner).
    pub fn stop(&self) {
        self.shared.transport.stop();
    }

    pub fn set_global_loops(&self, loops: LoopCount) {
        self.shared
            .transport
            .state()
            .with_state_write(|s| s.chain.global_loops = loops);
        if let Some(runner) = self.lock_runner().as_ref() {
            // A live run keeps its target.
            if !runner.is_running() {
                runner.set_global_loops(loops);
            }
        }
        self.shared.notify_changed();
    }

    /// Apply an edit to the slot list and propagate it.
    pub fn edit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SlotList) -> R,
    {
        let out = self.shared.transport.state().with_state_write(|s| {
            let out = f(&mut s.slots);
            s.bump_version();
            out
        });
        self.refresh();
        out
    }

    fn refresh(&self) {
        self.shared.notify_changed();

        let running = {
            let guard = self.lock_runner();
            match guard.as_ref() {
                Some(runner) => {
                    runner.rebuild(&self.slots());
                    runner.is_running()
                }
                None => false,
            }
        };
        if !self.is_linked() {
            return;
        }

        let chain = self.shared.current_chain();
        if running {
            log::debug!("[SESSION] Chain edit queued for the next loop boundary");
            self.shared.pending.post(chain);
        } else {
            self.shared.transport.play_chain(&chain.slots, 0);
        }
    }

    /// Capture the current selection into a row.
    pub fn capture(
        &self,
        index: usize,
        name: &str,
        loops: LoopCount,
        scales: &dyn ScaleLookup,
    ) -> bool {
        let selection: SelectionState = self.shared.transport.state().selection();
        let generator = SequenceGenerator::new(scales);
        self.edit(|slots| slots.capture(index, name, loops, &selection, &generator))
    }

    pub fn toggle_mute(&self, index: usize) -> bool {
        self.edit(|slots| slots.toggle_mute(index))
    }

    pub fn toggle_solo(&self, index: usize) -> bool {
        self.edit(|slots| slots.toggle_solo(index))
    }

    pub fn set_loops(&self, index: usize, loops: LoopCount) -> bool {
        self.edit(|slots| slots.set_loops(index, loops))
    }

    pub fn rename(&self, index: usize, name: &str) -> bool {
        self.edit(|slots| slots.rename(index, name))
    }

    pub fn move_up(&self, index: usize) -> bool {
        self.edit(|slots| slots.move_up(index))
    }

    pub fn move_down(&self, index: usize) -> bool {
        self.edit(|slots| slots.move_down(index))
    }

    pub fn remove(&self, index: usize) -> bool {
        self.edit(|slots| slots.remove(index))
    }

    pub fn restore(&self, index: usize) -> bool {
        self.edit(|slots| slots.restore(index))
    }

    pub fn clear_slot(&self, index: usize) -> bool {
        self.edit(|slots| slots.clear(index))
    }

    pub fn add_row(&self) -> bool {
        self.edit(SlotList::add_row)
    }
}

impl Drop for ChainSession {
    fn drop(&mut self) {
        self.shared.transport.detach_runner();
    }
}
