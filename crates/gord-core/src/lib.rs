//! Gord Core - Sequence generation, chain scheduling and transport mirroring
//! for the gord arpeggiator.
//!
//! This crate provides the playback core:
//!
//! - **Theory** - Pitch classes, note names and scale lookup
//! - **Selection** - Root, intervals, octaves and transport settings
//! - **Sequence** - Deterministic note sequences from a selection
//! - **Slots** - Captured patterns and the active-slot rule
//! - **Chain** - Background scheduler over the active slots
//! - **Transport** - Debounced mirror of the state to the playback engine
//! - **Session** - Link lifecycle and loop-boundary edits
//! - **Channel** - Fire-and-forget control messages to the engine
//!
//! # Architecture
//!
//! All mutable state lives in one [`AppState`] behind a [`StateManager`].
//! The [`TransportSync`] mirror thread and the [`ChainRunner`] scheduler
//! thread both read it on every tick, so edits from the controlling side
//! reach the engine within one tick. Explicit transport commands push
//! immediately; the mirror only pushes what changed.

pub mod chain;
pub mod channel;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod selection;
pub mod sequence;
pub mod session;
pub mod slots;
pub mod state;
pub mod theory;
pub mod timing;
pub mod transport;

pub use chain::{ChainDriver, ChainListener, ChainOptions, ChainRunner, ChainTick, RunnerControl};
pub use channel::{ChannelError, ControlChannel, ControlMessage, DatagramChannel, RecordingChannel};
pub use config::Config;
pub use error::{Error, Result};
pub use mailbox::Mailbox;
pub use selection::{Direction, SelectionState, Step};
pub use sequence::SequenceGenerator;
pub use session::{ChainObserver, ChainSession};
pub use slots::{ActiveSlot, ChainSlot, LoopCount, SlotList, SlotSnapshot};
pub use state::{AppState, StateManager};
pub use theory::{ScaleLibrary, ScaleLookup};
pub use transport::{TransportOptions, TransportSync};
