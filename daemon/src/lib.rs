//! voiceturn: a wake-word driven voice turn controller
//!
//! Listens for a wake phrase, records the utterance that follows, hands it
//! off as a command and speaks the reply. The speech engines sit behind
//! the traits in [`engines`]; [`bridge`] implements them over the IPC
//! socket served by [`ipc`].

pub mod assistant;
pub mod bridge;
pub mod config;
pub mod engines;
pub mod events;
pub mod ipc;
pub mod lifecycle;
pub mod state;
mod timers;
pub mod wake;

#[cfg(test)]
mod testing;

pub use assistant::{Assistant, AssistantError, SpeakError};
pub use config::{AssistantConfig, Config, Timeouts};
pub use events::{Event, EventKind, EventStream};
pub use state::VoiceState;
