//! Shared application state.
//!
//! - [`AppState`] - Selection, transport flags and captured slots
//! - [`StateManager`] - Thread-safe handle shared by the transport, the
//!   chain runner and the controlling layer
//!
//! Background threads re-read the fields they need on every tick, so a
//! write from the controlling side becomes visible within one tick.

mod manager;
mod model;

pub use manager::StateManager;
pub use model::{AppState, ChainSettings};
