//! Runs the fixed stage pipeline for a real build.
//!
//! Stages run strictly in order and the first failure or observed stop
//! halts the run. Full recovery runs only after a failure; recovery after
//! a cancellation belongs to the abort path.

use async_trait::async_trait;
use events::OutputSender;
use opsdash_core::{BuildKind, BuildSession};
use tracing::{error, info, warn};

use crate::cancel::CancellationController;
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::layout::BuildLayout;
use crate::pipeline::BuildPipeline;
use crate::process::{CommandSpec, ProcessRunner};
use crate::recovery::RecoveryManager;
use crate::stage::{BuildPlan, RecoveryPolicy, StageKind};

pub struct StageSequencer {
    plan: BuildPlan,
    recovery: RecoveryManager,
}

impl StageSequencer {
    pub fn new(plan: BuildPlan, layout: BuildLayout) -> Self {
        let recovery = RecoveryManager::new(
            layout,
            plan.restore_ownership.clone(),
            plan.owner_account.clone(),
        );
        Self { plan, recovery }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(BuildPlan::from_config(config), BuildLayout::from_config(config))
    }

    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    async fn run_stages(
        &self,
        session: &mut BuildSession,
        cancel: &CancellationController,
        out: &OutputSender,
    ) -> Result<()> {
        for stage in StageKind::PIPELINE {
            if cancel.is_stop_requested() {
                return Err(BuildError::CancellationRequested { stage });
            }

            info!(session_id = %session.id, stage = %stage, "Running stage");
            if let Err(e) = self.run_stage(stage, session, cancel, out).await {
                match stage.recovery_policy() {
                    RecoveryPolicy::Full => return Err(e),
                    RecoveryPolicy::WarnOnly => {
                        warn!(session_id = %session.id, stage = %stage, error = %e, "Stage failed, continuing");
                        out.line(self.warning_for(stage));
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: StageKind,
        session: &mut BuildSession,
        cancel: &CancellationController,
        out: &OutputSender,
    ) -> Result<()> {
        let plan = &self.plan;
        match stage {
            StageKind::TransferOwnership => {
                out.line(format!(
                    "Changing repository ownership to {}...",
                    plan.build_account
                ));
                stream_command(stage, &plan.transfer_ownership, cancel, out).await
            }
            StageKind::BackupOutput => {
                if let Some(backup) = self.recovery.backup_output(session.timestamp()).await? {
                    out.line(format!("Backed up existing build to {}", backup.display()));
                    session.record_backup(backup);
                }
                Ok(())
            }
            StageKind::SyncSource => {
                out.line("Pulling latest changes...");
                stream_command(stage, &plan.sync_source, cancel, out).await
            }
            StageKind::Configure => {
                out.line("Configuring build...");
                let compiler_dir = ProcessRunner::capture(stage, &plan.toolchain.compiler_dir).await?;
                let runtime_path = ProcessRunner::capture(stage, &plan.toolchain.runtime_path).await?;
                let toolchain = plan.toolchain.resolve(&compiler_dir, &runtime_path);
                info!(compiler = %toolchain.compiler, runtime = %toolchain.runtime_path, "Discovered toolchain");

                stream_command(stage, &plan.configure_with(&toolchain), cancel, out).await
            }
            StageKind::Compile => {
                out.line("Starting build...");
                stream_command(stage, &plan.compile, cancel, out).await?;
                out.line("Build completed successfully!");
                Ok(())
            }
            StageKind::RestoreOwnership => {
                out.line(format!(
                    "Restoring repository ownership to {}...",
                    plan.owner_account
                ));
                self.recovery.restore_ownership(Some(out)).await
            }
        }
    }

    fn warning_for(&self, stage: StageKind) -> String {
        match stage {
            StageKind::RestoreOwnership => format!(
                "Warning: Failed to restore ownership to {}",
                self.plan.owner_account
            ),
            other => format!("Warning: {} failed", other),
        }
    }
}

#[async_trait]
impl BuildPipeline for StageSequencer {
    fn kind(&self) -> BuildKind {
        BuildKind::Real
    }

    async fn run(
        &self,
        session: &mut BuildSession,
        cancel: &CancellationController,
        out: &OutputSender,
    ) -> bool {
        match self.run_stages(session, cancel, out).await {
            Ok(()) => {
                info!(session_id = %session.id, "Build pipeline completed");
                true
            }
            // A failure while stopping is the stop taking effect
            Err(e) if e.is_cancellation() || cancel.is_stop_requested() => {
                info!(session_id = %session.id, error = %e, "Build pipeline cancelled");
                out.line("Build aborted by user");
                false
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Build pipeline failed");
                out.line(format!("Build failed with error: {}", e));

                let report = self.recovery.recover(session.timestamp(), out).await;
                session.record_recovery();
                if let Some(failed) = report.failed_path {
                    session.record_failed(failed);
                }
                false
            }
        }
    }
}

/// Run one stage command, forwarding its merged output line by line.
///
/// Cancellable stages register their child with the controller while
/// output is flowing.
async fn stream_command(
    stage: StageKind,
    spec: &CommandSpec,
    cancel: &CancellationController,
    out: &OutputSender,
) -> Result<()> {
    let mut process = ProcessRunner::execute(stage, spec)?;

    if stage.is_cancellable() {
        cancel.attach(process.handle());
    }
    while let Some(line) = process.next_line().await {
        out.line(line);
    }
    if stage.is_cancellable() {
        cancel.detach();
    }

    process.wait().await
}
