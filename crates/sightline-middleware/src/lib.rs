//! `sightline-middleware` – The Nervous System
//!
//! Moves messages between the sampling loops, the speaker and anyone
//! listening in, without caring what the messages mean.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`speech`] – [`SpeechArbitrator`][speech::SpeechArbitrator]: the single
//!   owner of the audio device; serialises announcements into one spoken
//!   stream with High-priority preemption.

pub mod bus;
pub mod speech;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use speech::{ArbitratorConfig, SpeechArbitrator};
