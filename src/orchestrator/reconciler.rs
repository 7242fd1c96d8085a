//! Maps observed sandbox state onto job status.
//!
//! The runtime reports how a container ended; the worker's exit code says how
//! the task ended. A clean exit (code 0) and a reaped container whose code is
//! unknown both count as `Exited`. Any non-zero code means the decision loop
//! gave up, was cancelled or crashed, and the job is `Failed`.

use crate::orchestrator::registry::JobStatus;
use crate::sandbox::SandboxState;

/// Status a job should have after observing its sandbox in `state`.
///
/// Only a `Running` job is affected by what its sandbox does; every other
/// status is already settled.
pub fn observe(current: JobStatus, state: SandboxState) -> JobStatus {
    if current != JobStatus::Running {
        return current;
    }
    match state {
        SandboxState::Running => JobStatus::Running,
        SandboxState::NotFound => JobStatus::Exited,
        SandboxState::Exited { exit_code } => match exit_code {
            None | Some(0) => JobStatus::Exited,
            Some(_) => JobStatus::Failed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_stays_running() {
        assert_eq!(
            observe(JobStatus::Running, SandboxState::Running),
            JobStatus::Running
        );
    }

    #[test]
    fn test_reaped_sandbox_counts_as_exited() {
        assert_eq!(
            observe(JobStatus::Running, SandboxState::NotFound),
            JobStatus::Exited
        );
        assert_eq!(
            observe(JobStatus::Running, SandboxState::Exited { exit_code: None }),
            JobStatus::Exited
        );
    }

    #[test]
    fn test_exit_code_decides_outcome() {
        assert_eq!(
            observe(
                JobStatus::Running,
                SandboxState::Exited { exit_code: Some(0) }
            ),
            JobStatus::Exited
        );
        for code in [1, 2, 130, 137] {
            assert_eq!(
                observe(
                    JobStatus::Running,
                    SandboxState::Exited {
                        exit_code: Some(code)
                    }
                ),
                JobStatus::Failed,
                "exit code {code}"
            );
        }
    }

    #[test]
    fn test_settled_status_ignores_sandbox() {
        for status in [JobStatus::Exited, JobStatus::Archived, JobStatus::Failed] {
            assert_eq!(observe(status, SandboxState::Running), status);
            assert_eq!(observe(status, SandboxState::NotFound), status);
        }
    }
}
