//! The fixed build pipeline: stage tags, their recovery policy, and the
//! concrete commands each one runs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::BuildConfig;
use crate::process::CommandSpec;

/// What the sequencer does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Relocate partial output, restore the backup, restore ownership
    Full,
    /// Report a warning line; the run keeps its outcome
    WarnOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    TransferOwnership,
    BackupOutput,
    SyncSource,
    Configure,
    Compile,
    RestoreOwnership,
}

impl StageKind {
    /// Stages in execution order
    pub const PIPELINE: [StageKind; 6] = [
        StageKind::TransferOwnership,
        StageKind::BackupOutput,
        StageKind::SyncSource,
        StageKind::Configure,
        StageKind::Compile,
        StageKind::RestoreOwnership,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransferOwnership => "transfer_ownership",
            Self::BackupOutput => "backup_output",
            Self::SyncSource => "sync_source",
            Self::Configure => "configure",
            Self::Compile => "compile",
            Self::RestoreOwnership => "restore_ownership",
        }
    }

    /// Only compilation may be interrupted mid-command.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Compile)
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        match self {
            Self::RestoreOwnership => RecoveryPolicy::WarnOnly,
            Self::TransferOwnership
            | Self::BackupOutput
            | Self::SyncSource
            | Self::Configure
            | Self::Compile => RecoveryPolicy::Full,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queries run before configure to locate the compiler toolchain.
#[derive(Debug, Clone)]
pub struct ToolchainQueries {
    pub compiler_dir: CommandSpec,
    pub runtime_path: CommandSpec,
    pub compiler_name: String,
    pub compiler_define: String,
    pub runtime_define: String,
}

/// Values discovered by [`ToolchainQueries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub compiler: String,
    pub runtime_path: String,
}

impl ToolchainQueries {
    pub fn resolve(&self, compiler_dir: &str, runtime_path: &str) -> Toolchain {
        Toolchain {
            compiler: format!("{}/{}", compiler_dir.trim_end_matches('/'), self.compiler_name),
            runtime_path: runtime_path.to_string(),
        }
    }

    /// Configure arguments carrying the discovered toolchain
    pub fn defines(&self, toolchain: &Toolchain) -> [String; 2] {
        [
            format!("-D{}={}", self.compiler_define, toolchain.compiler),
            format!("-D{}={}", self.runtime_define, toolchain.runtime_path),
        ]
    }
}

/// Concrete commands for every stage of one pipeline.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub build_account: String,
    pub owner_account: String,
    pub transfer_ownership: CommandSpec,
    pub restore_ownership: CommandSpec,
    pub sync_source: CommandSpec,
    pub toolchain: ToolchainQueries,
    /// Configure up to the build directory; defines and flags are appended
    pub configure: CommandSpec,
    /// Fixed target flags passed after the toolchain defines
    pub target_flags: Vec<String>,
    pub compile: CommandSpec,
}

impl BuildPlan {
    pub fn from_config(config: &BuildConfig) -> Self {
        let repo = config.repo_path.as_path();
        let repo_str = repo.display().to_string();

        let chown = |account: &str| {
            privileged(config.use_sudo, None)
                .arg("chown")
                .arg("-R")
                .arg(format!("{}:{}", account, config.group))
                .arg(repo_str.clone())
        };

        let as_owner = || privileged(config.use_sudo, Some(config.owner_account.as_str()));

        let query = |argv: &[String]| {
            CommandSpec::from_argv(argv)
                .unwrap_or_else(|| CommandSpec::new("true"))
                .current_dir(repo)
        };

        Self {
            build_account: config.build_account.clone(),
            owner_account: config.owner_account.clone(),
            transfer_ownership: chown(&config.build_account),
            restore_ownership: chown(&config.owner_account),
            sync_source: as_owner().args(["git", "pull"]).current_dir(repo),
            toolchain: ToolchainQueries {
                compiler_dir: query(config.toolchain.compiler_query.as_slice()),
                runtime_path: query(config.toolchain.runtime_query.as_slice()),
                compiler_name: config.toolchain.compiler_name.clone(),
                compiler_define: config.toolchain.compiler_define.clone(),
                runtime_define: config.toolchain.runtime_define.clone(),
            },
            configure: as_owner()
                .args(["cmake", "-S", ".", "-B"])
                .arg(config.build_dir.clone())
                .current_dir(repo),
            target_flags: config.configure_flags.clone(),
            compile: as_owner()
                .args(["cmake", "--build"])
                .arg(config.build_dir.clone())
                .arg("--config")
                .arg(config.build_config.clone())
                .args(["--", "-j"])
                .arg(config.parallelism.to_string())
                .current_dir(repo),
        }
    }

    /// Configure command for the discovered toolchain
    pub fn configure_with(&self, toolchain: &Toolchain) -> CommandSpec {
        self.configure
            .clone()
            .args(self.toolchain.defines(toolchain))
            .args(self.target_flags.iter().cloned())
    }
}

/// `sudo [-u account]` when privileged, otherwise an empty prefix.
fn privileged(use_sudo: bool, run_as: Option<&str>) -> PrivilegedPrefix {
    PrivilegedPrefix {
        use_sudo,
        run_as: run_as.map(str::to_string),
    }
}

struct PrivilegedPrefix {
    use_sudo: bool,
    run_as: Option<String>,
}

impl PrivilegedPrefix {
    fn arg(self, program_or_arg: impl Into<String>) -> CommandSpec {
        self.args([program_or_arg.into()])
    }

    fn args<I, S>(self, argv: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::<String>::into);
        if self.use_sudo {
            let spec = CommandSpec::new("sudo");
            let spec = match self.run_as {
                Some(account) => spec.arg("-u").arg(account),
                None => spec,
            };
            spec.args(argv)
        } else {
            let program = argv.next().unwrap_or_else(|| "true".to_string());
            CommandSpec::new(program).args(argv)
        }
    }
}
