//! Voice turn state machine
//!
//! Six states: ListeningForWake, Activating, Recording, Processing, Muted
//! and Speaking. See [`StateMachine`] for the transitions.

mod machine;

pub use machine::VoiceState;
pub(crate) use machine::{Channels, Input, StateMachine};
