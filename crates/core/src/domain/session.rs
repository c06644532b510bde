use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    /// Runs the real toolchain pipeline
    #[default]
    Real,
    /// Runs the scripted stand-in pipeline
    Mock,
}

impl BuildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Mock => "mock",
        }
    }

    pub fn from_mock_flag(mock: bool) -> Self {
        if mock {
            Self::Mock
        } else {
            Self::Real
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

/// One end-to-end run of the build pipeline.
///
/// A session moves `Idle -> Running -> {Succeeded, Failed, Aborted}` and is
/// immutable once terminal. A new build always gets a new session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BuildSession {
    pub id: Uuid,
    pub kind: BuildKind,
    pub state: BuildState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Where the pre-run output directory was moved before the build touched it
    #[schema(value_type = Option<String>)]
    pub backup_path: Option<PathBuf>,
    /// Where partial output was moved after a failed run
    #[schema(value_type = Option<String>)]
    pub failed_path: Option<PathBuf>,
    /// Failure recovery already ran inside the pipeline
    #[serde(default)]
    pub recovered: bool,
    pub result: Option<bool>,
}

impl BuildSession {
    pub fn new(kind: BuildKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: BuildState::default(),
            started_at: Utc::now(),
            finished_at: None,
            backup_path: None,
            failed_path: None,
            recovered: false,
            result: None,
        }
    }

    /// Unix timestamp used to name this session's backup slot.
    pub fn timestamp(&self) -> i64 {
        self.started_at.timestamp()
    }

    pub fn is_running(&self) -> bool {
        self.state == BuildState::Running
    }

    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.state != BuildState::Idle {
            return Err(CoreError::InvalidStateTransition {
                from: self.state,
                to: BuildState::Running,
            });
        }
        self.state = BuildState::Running;
        self.started_at = Utc::now();
        Ok(())
    }

    pub fn record_backup(&mut self, path: PathBuf) {
        self.backup_path = Some(path);
    }

    pub fn record_failed(&mut self, path: PathBuf) {
        self.failed_path = Some(path);
    }

    pub fn record_recovery(&mut self) {
        self.recovered = true;
    }

    /// Moves the session to its terminal state. The result is set exactly once.
    pub fn finish(&mut self, state: BuildState) -> Result<(), CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::AlreadyFinished(self.id));
        }
        if !state.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        self.result = Some(state == BuildState::Succeeded);
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
