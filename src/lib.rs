//! agentbox: runs natural-language tasks inside sandboxed containers.
//!
//! The crate has two halves that share one binary:
//!
//! - the **orchestrator** (`agentbox serve`) accepts tasks over HTTP, starts
//!   one sandbox per task, reports status and serves each finished
//!   workspace as a `.tar.gz` download;
//! - the **worker** (`agentbox worker`) runs inside the sandbox and drives
//!   the task with an LLM decision loop over a small set of capabilities.

pub mod agent;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod orchestrator;
pub mod sandbox;
pub mod tools;
pub mod util;
pub mod worker;
