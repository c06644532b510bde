//! Single-flight entry point for starting, aborting and inspecting builds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use events::BuildStream;
use opsdash_core::{BuildKind, BuildSession, BuildState};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancellationController;
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::mock::MockPipeline;
use crate::pipeline::BuildPipeline;
use crate::recovery::RecoveryManager;
use crate::resources::{ActiveBuild, SessionSlot};
use crate::sequencer::StageSequencer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum AbortStatus {
    /// No build was running
    NotRunning,
    /// Stop was already requested for the running build
    AlreadyAborting,
    /// The build was stopped and cleanup attempted
    Aborted,
    /// The build succeeded, or failed and recovered itself, before the stop
    /// took effect
    AlreadyFinished,
}

/// Response of an abort request. Cleanup problems land in `warning`; they
/// never turn the abort itself into an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AbortOutcome {
    pub status: AbortStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Backup slot moved back into the output location
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>))]
    pub backup_restored: Option<PathBuf>,
}

impl AbortOutcome {
    fn not_running() -> Self {
        Self {
            status: AbortStatus::NotRunning,
            message: "No build in progress".to_string(),
            session_id: None,
            warning: None,
            backup_restored: None,
        }
    }

    fn with_status(status: AbortStatus, session_id: Uuid, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
            session_id: Some(session_id),
            warning: None,
            backup_restored: None,
        }
    }

    fn aborted(session_id: Uuid, warnings: Vec<String>, backup_restored: Option<PathBuf>) -> Self {
        Self {
            warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
            backup_restored,
            ..Self::with_status(AbortStatus::Aborted, session_id, "Build aborted")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ActiveSummary {
    pub session_id: Uuid,
    pub kind: BuildKind,
    pub started_at: DateTime<Utc>,
    /// Stop has been requested but the worker has not exited yet
    pub aborting: bool,
}

impl From<&ActiveBuild> for ActiveSummary {
    fn from(active: &ActiveBuild) -> Self {
        Self {
            session_id: active.session_id,
            kind: active.kind,
            started_at: active.started_at,
            aborting: active.cancel.is_stop_requested(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BuildStatus {
    pub running: bool,
    pub active: Option<ActiveSummary>,
    /// Most recent finished session since the process started
    pub last: Option<BuildSession>,
}

struct Inner {
    slot: Arc<SessionSlot>,
    real: Arc<dyn BuildPipeline>,
    mock: Arc<dyn BuildPipeline>,
    recovery: RecoveryManager,
    settle_timeout: Duration,
}

/// Allows at most one running build across real and mock sessions.
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<Inner>,
}

impl SessionGuard {
    pub fn new(
        real: Arc<dyn BuildPipeline>,
        mock: Arc<dyn BuildPipeline>,
        recovery: RecoveryManager,
        settle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: SessionSlot::new(),
                real,
                mock,
                recovery,
                settle_timeout,
            }),
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        let sequencer = StageSequencer::from_config(config);
        let recovery = sequencer.recovery().clone();
        Self::new(
            Arc::new(sequencer),
            Arc::new(MockPipeline::new(config.mock_step_delay())),
            recovery,
            config.abort_settle_timeout(),
        )
    }

    fn pipeline_for(&self, kind: BuildKind) -> Arc<dyn BuildPipeline> {
        match kind {
            BuildKind::Real => Arc::clone(&self.inner.real),
            BuildKind::Mock => Arc::clone(&self.inner.mock),
        }
    }

    /// Start a new session and return its output stream.
    ///
    /// Fails with [`BuildError::Conflict`] without side effects when a
    /// session is already running. Must be called inside a tokio runtime.
    pub fn start(&self, kind: BuildKind) -> Result<BuildStream> {
        let mut session = BuildSession::new(kind);
        session.start()?;

        let cancel = CancellationController::new();
        let slot = self
            .inner
            .slot
            .try_claim(&session, cancel.clone())
            .map_err(|running| {
                info!(running = %running, "Build start rejected, another build is running");
                BuildError::Conflict(running)
            })?;

        let session_id = session.id;
        info!(session_id = %session_id, kind = kind.as_str(), "Starting build session");

        let pipeline = self.pipeline_for(kind);
        let (sender, stream) = events::channel();
        let worker_cancel = cancel.clone();

        tokio::spawn(async move {
            let success = pipeline.run(&mut session, &worker_cancel, &sender).await;

            // A run that already recovered from a failure stays failed even
            // if a stop arrived meanwhile, so abort does not clean up again
            let state = if success {
                BuildState::Succeeded
            } else if worker_cancel.is_stop_requested() && !session.recovered {
                BuildState::Aborted
            } else {
                BuildState::Failed
            };
            if let Err(e) = session.finish(state) {
                warn!(session_id = %session.id, error = %e, "Failed to finish session");
            }
            info!(
                session_id = %session.id,
                state = state.as_str(),
                lines = sender.line_count(),
                "Build session finished"
            );

            // Free the slot before the caller sees the terminal message
            slot.release(session);
            sender.finish(success);
        });

        let guard = self.clone();
        Ok(stream.on_disconnect(move || guard.handle_disconnect(session_id, cancel)))
    }

    /// Consumer went away before the terminal message.
    fn handle_disconnect(&self, session_id: Uuid, cancel: CancellationController) {
        warn!(session_id = %session_id, "Build stream disconnected, aborting build");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let guard = self.clone();
                handle.spawn(async move {
                    let outcome = guard.abort_session(session_id).await;
                    info!(session_id = %session_id, status = ?outcome.status, "Disconnect cleanup done");
                });
            }
            Err(_) => {
                cancel.request_stop();
            }
        }
    }

    /// Stop the running build and put the output directory back in order.
    pub async fn abort(&self) -> AbortOutcome {
        match self.inner.slot.active() {
            Some(active) => self.abort_active(active).await,
            None => AbortOutcome::not_running(),
        }
    }

    /// Abort only if `session_id` is still the running session.
    pub async fn abort_session(&self, session_id: Uuid) -> AbortOutcome {
        match self.inner.slot.active() {
            Some(active) if active.session_id == session_id => self.abort_active(active).await,
            _ => AbortOutcome::not_running(),
        }
    }

    async fn abort_active(&self, active: ActiveBuild) -> AbortOutcome {
        let session_id = active.session_id;
        if !active.cancel.request_stop() {
            return AbortOutcome::with_status(
                AbortStatus::AlreadyAborting,
                session_id,
                "Build is already being aborted",
            );
        }
        info!(session_id = %session_id, kind = active.kind.as_str(), "Abort requested");

        let settle = self.inner.settle_timeout;
        if !wait_for_worker(active.done.clone(), settle).await {
            warn!(
                session_id = %session_id,
                timeout = ?settle,
                "Build worker did not stop in time"
            );
            let mut warning = format!("Build did not stop within {:?}", settle);

            // The running stage may still write into the output directory
            if active.kind == BuildKind::Real {
                warning.push_str("; cleanup deferred until it exits");
                let guard = self.clone();
                let done = active.done;
                let not_before = active.started_at.timestamp();
                tokio::spawn(async move {
                    worker_exit(done).await;
                    let outcome = guard.cleanup_after_stop(session_id, not_before).await;
                    info!(
                        session_id = %session_id,
                        status = ?outcome.status,
                        warning = ?outcome.warning,
                        "Deferred abort cleanup done"
                    );
                });
            }
            return AbortOutcome::aborted(session_id, vec![warning], None);
        }

        if active.kind == BuildKind::Mock {
            return AbortOutcome::aborted(session_id, Vec::new(), None);
        }

        self.cleanup_after_stop(session_id, active.started_at.timestamp())
            .await
    }

    /// Ownership and backup restore once the worker of `session_id` has exited.
    ///
    /// Only backups taken by this session (`not_before` is its start
    /// timestamp) are restored.
    async fn cleanup_after_stop(&self, session_id: Uuid, not_before: i64) -> AbortOutcome {
        let last = self.inner.slot.last().filter(|last| last.id == session_id);
        match last {
            Some(last) if last.state == BuildState::Succeeded => {
                return AbortOutcome::with_status(
                    AbortStatus::AlreadyFinished,
                    session_id,
                    "Build finished before it could be aborted",
                );
            }
            Some(last) if last.recovered => {
                return AbortOutcome::with_status(
                    AbortStatus::AlreadyFinished,
                    session_id,
                    "Build failed and was recovered before it could be aborted",
                );
            }
            _ => {}
        }

        let mut warnings = Vec::new();
        let recovery = &self.inner.recovery;
        if let Err(e) = recovery.restore_ownership(None).await {
            warn!(session_id = %session_id, error = %e, "Ownership restore failed during abort");
            warnings.push(e.to_string());
        }

        let backup_restored = match recovery.restore_latest_backup(not_before).await {
            Ok(Some(restored)) => {
                info!(
                    session_id = %session_id,
                    backup = %restored.backup.display(),
                    "Restored backup after abort"
                );
                Some(restored.backup)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Backup restore failed during abort");
                warnings.push(e.to_string());
                None
            }
        };

        AbortOutcome::aborted(session_id, warnings, backup_restored)
    }

    pub fn status(&self) -> BuildStatus {
        let active = self.inner.slot.active().as_ref().map(ActiveSummary::from);
        BuildStatus {
            running: active.is_some(),
            active,
            last: self.inner.slot.last(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.slot.active().is_some()
    }
}

/// Resolves once the worker has released its slot.
async fn worker_exit(mut done: watch::Receiver<bool>) {
    // A dropped sender also means the worker is gone
    let _ = done.wait_for(|released| *released).await;
}

/// Returns `false` if the worker is still running after `timeout`.
async fn wait_for_worker(done: watch::Receiver<bool>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, worker_exit(done)).await.is_ok()
}
