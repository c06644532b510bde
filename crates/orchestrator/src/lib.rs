pub mod cancel;
pub mod config;
pub mod error;
pub mod layout;
pub mod mock;
pub mod pipeline;
pub mod process;
pub mod recovery;
pub mod resources;
pub mod sequencer;
pub mod session_guard;
pub mod stage;

pub use cancel::CancellationController;
pub use config::{BuildConfig, ToolchainConfig};
pub use error::{BuildError, Result};
pub use layout::BuildLayout;
pub use mock::MockPipeline;
pub use pipeline::BuildPipeline;
pub use process::{CommandSpec, ProcessHandle, ProcessRunner, RunningProcess};
pub use recovery::{BackupRestore, RecoveryManager, RecoveryReport};
pub use sequencer::StageSequencer;
pub use session_guard::{AbortOutcome, AbortStatus, ActiveSummary, BuildStatus, SessionGuard};
pub use stage::{BuildPlan, RecoveryPolicy, StageKind};
