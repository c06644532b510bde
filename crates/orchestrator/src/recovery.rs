//! Directory backup/restore and ownership handling around failed runs.
//!
//! Nothing in here escapes as a hard error during recovery: every failed
//! step becomes a warning line on the build stream.

use std::path::PathBuf;

use events::OutputSender;
use tokio::fs;
use tracing::{info, warn};

use crate::error::{BuildError, Result};
use crate::layout::BuildLayout;
use crate::process::{CommandSpec, ProcessRunner};
use crate::stage::StageKind;

/// What a full recovery managed to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Failed slot the partial output was moved to
    pub failed_path: Option<PathBuf>,
    /// Backup slot moved back into the output location
    pub restored_backup: Option<PathBuf>,
    pub ownership_restored: bool,
    pub warnings: Vec<String>,
}

/// Result of restoring the most recent backup outside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRestore {
    pub backup: PathBuf,
    /// Where partial output occupying the output location was moved first
    pub relocated: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    layout: BuildLayout,
    restore_ownership: CommandSpec,
    owner_account: String,
}

impl RecoveryManager {
    pub fn new(
        layout: BuildLayout,
        restore_ownership: CommandSpec,
        owner_account: impl Into<String>,
    ) -> Self {
        Self {
            layout,
            restore_ownership,
            owner_account: owner_account.into(),
        }
    }

    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    pub fn owner_account(&self) -> &str {
        &self.owner_account
    }

    /// Move an existing output directory to the backup slot for `timestamp`.
    pub async fn backup_output(&self, timestamp: i64) -> Result<Option<PathBuf>> {
        let output = self.layout.output_dir();
        if !fs::try_exists(&output).await? {
            return Ok(None);
        }

        let backup = self.layout.backup_slot(timestamp);
        fs::rename(&output, &backup).await?;
        info!(backup = %backup.display(), "Backed up existing output directory");
        Ok(Some(backup))
    }

    /// Move the output directory, if present, to the first free failed slot.
    pub async fn relocate_failed_output(&self) -> Result<Option<PathBuf>> {
        let output = self.layout.output_dir();
        if !fs::try_exists(&output).await? {
            return Ok(None);
        }

        let failed = self.layout.next_failed_slot().await?;
        fs::rename(&output, &failed).await?;
        info!(failed = %failed.display(), "Relocated failed output directory");
        Ok(Some(failed))
    }

    /// Move the backup slot for `timestamp` back into the output location.
    pub async fn restore_backup(&self, timestamp: i64) -> Result<Option<PathBuf>> {
        let backup = self.layout.backup_slot(timestamp);
        if !fs::try_exists(&backup).await? {
            return Ok(None);
        }

        fs::rename(&backup, self.layout.output_dir())
            .await
            .map_err(|e| {
                BuildError::BackupRestoreFailure(format!("{}: {}", backup.display(), e))
            })?;
        info!(backup = %backup.display(), "Restored backup");
        Ok(Some(backup))
    }

    /// Restore the newest backup slot taken at or after `not_before`,
    /// relocating partial output first.
    ///
    /// Older slots belong to earlier runs and are left alone, as is the
    /// output directory when no slot qualifies.
    pub async fn restore_latest_backup(&self, not_before: i64) -> Result<Option<BackupRestore>> {
        let Some(backup) = self.layout.latest_backup(not_before).await? else {
            return Ok(None);
        };

        let relocated = self
            .relocate_failed_output()
            .await
            .map_err(|e| BuildError::BackupRestoreFailure(e.to_string()))?;

        fs::rename(&backup, self.layout.output_dir())
            .await
            .map_err(|e| {
                BuildError::BackupRestoreFailure(format!("{}: {}", backup.display(), e))
            })?;
        info!(backup = %backup.display(), "Restored latest backup");

        Ok(Some(BackupRestore { backup, relocated }))
    }

    /// Hand the repository back to the owning account.
    ///
    /// Command output goes to `out` when given.
    pub async fn restore_ownership(&self, out: Option<&OutputSender>) -> Result<()> {
        let failure = |reason: String| BuildError::OwnershipRestoreFailure {
            account: self.owner_account.clone(),
            reason,
        };

        let mut process = ProcessRunner::execute(StageKind::RestoreOwnership, &self.restore_ownership)
            .map_err(|e| failure(e.to_string()))?;
        while let Some(line) = process.next_line().await {
            if let Some(out) = out {
                out.line(line);
            }
        }
        process.wait().await.map_err(|e| failure(e.to_string()))
    }

    /// Full recovery after a stage failure.
    pub async fn recover(&self, timestamp: i64, out: &OutputSender) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let warn_line = |report: &mut RecoveryReport, message: String| {
            warn!(warning = %message, "Recovery step failed");
            out.line(message.clone());
            report.warnings.push(message);
        };

        match self.relocate_failed_output().await {
            Ok(Some(failed)) => {
                out.line(format!("Moved failed build to {}", failed.display()));
                report.failed_path = Some(failed);
            }
            Ok(None) => {}
            Err(e) => warn_line(
                &mut report,
                format!("Warning: Failed to move failed build: {}", e),
            ),
        }

        match self.restore_backup(timestamp).await {
            Ok(Some(backup)) => {
                out.line(format!("Restored backup from {}", backup.display()));
                report.restored_backup = Some(backup);
            }
            Ok(None) => {}
            Err(e) => warn_line(&mut report, format!("Warning: {}", e)),
        }

        out.line(format!(
            "Restoring repository ownership to {}...",
            self.owner_account
        ));
        match self.restore_ownership(Some(out)).await {
            Ok(()) => report.ownership_restored = true,
            Err(e) => {
                warn!(error = %e, "Ownership restore failed during recovery");
                warn_line(
                    &mut report,
                    format!("Warning: Failed to restore ownership to {}", self.owner_account),
                );
            }
        }

        report
    }
}
