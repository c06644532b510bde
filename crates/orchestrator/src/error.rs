use thiserror::Error;
use uuid::Uuid;

use crate::stage::StageKind;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Command '{command}' failed during {stage} with {}", describe_exit(.code))]
    StageFailure {
        stage: StageKind,
        command: String,
        code: Option<i32>,
    },

    #[error("Failed to start '{command}' during {stage}: {source}")]
    Spawn {
        stage: StageKind,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Build cancelled during {stage}")]
    CancellationRequested { stage: StageKind },

    #[error("Failed to restore ownership to {account}: {reason}")]
    OwnershipRestoreFailure { account: String, reason: String },

    #[error("Failed to restore backup: {0}")]
    BackupRestoreFailure(String),

    #[error("A build is already running: {0}")]
    Conflict(Uuid),

    #[error("Session error: {0}")]
    Session(#[from] opsdash_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Create a stage failure error.
    pub fn stage_failed(stage: StageKind, command: impl Into<String>, code: Option<i32>) -> Self {
        Self::StageFailure {
            stage,
            command: command.into(),
            code,
        }
    }

    /// Whether this error ends the run as a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancellationRequested { .. })
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (killed by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_display() {
        let err = BuildError::stage_failed(StageKind::Configure, "cmake -S . -B build", Some(1));
        let msg = err.to_string();
        assert!(msg.contains("cmake -S . -B build"));
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("configure"));
    }

    #[test]
    fn test_stage_failure_without_code() {
        let err = BuildError::stage_failed(StageKind::Compile, "cmake --build build", None);
        assert!(err.to_string().contains("killed by signal"));
    }

    #[test]
    fn test_is_cancellation() {
        let cancelled = BuildError::CancellationRequested {
            stage: StageKind::Compile,
        };
        assert!(cancelled.is_cancellation());
        assert!(!BuildError::Conflict(Uuid::new_v4()).is_cancellation());
    }
}
