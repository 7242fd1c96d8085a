//! Conversation history.
//!
//! The decision loop's only durable state is its transcript, kept as a JSON
//! file inside the job workspace so it survives a worker restart and ends up
//! in the downloadable archive.

mod transcript;

pub use transcript::{Transcript, prune};
