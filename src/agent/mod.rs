//! The in-sandbox agent.
//!
//! A [`DecisionLoop`] asks the model for one capability call at a time,
//! runs it, and records the observation in the transcript until the model
//! calls `finish_task`, the retry budget runs out, or the job is cancelled.

pub mod decision_loop;
mod prompt;

pub use decision_loop::{DecisionLoop, LoopOutcome, LoopSettings, corrective_message};
pub use prompt::system_prompt;
