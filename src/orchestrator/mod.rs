//! Orchestrator: accepts tasks, runs each in its own sandbox, reports status
//! and hands out the resulting workspace.
//!
//! ```text
//!   POST /schedule ──► JobManager::schedule ──► PortAllocator + SandboxProvisioner
//!   GET /status    ──► JobManager::status   ──► reconciler ──► Archiver (once)
//!   GET /downloads ──► static archives
//! ```

pub mod api;
pub mod archive;
pub mod job_manager;
pub mod ports;
pub mod reconciler;
pub mod registry;

pub use api::{OrchestratorApi, OrchestratorState};
pub use archive::Archiver;
pub use job_manager::{JobManager, ScheduledJob};
pub use ports::PortAllocator;
pub use registry::{JobRecord, JobRegistry, JobStatus};
