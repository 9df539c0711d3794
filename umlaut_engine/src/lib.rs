//! umlaut_engine - the event interposer behind the umlaut daemon.
//!
//! Grabs physical keyboards exclusively, runs every key event through a
//! compose state machine, and writes the outcome (pass-through, replay, or
//! synthesized output) to a single virtual keyboard device.

#[macro_use]
pub mod macros;

pub mod compose;
pub mod config;
pub mod device;
pub mod event_loop;
pub mod keycodes;
pub mod output;
pub mod paths;

pub use crate::compose::ComposeMachine;
pub use crate::config::Config;
pub use crate::event_loop::EventLoop;
