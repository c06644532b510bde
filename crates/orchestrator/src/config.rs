use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the build pipeline, read from the `[build]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Repository root containing the output directory
    pub repo_path: PathBuf,
    /// Name of the primary output directory under `repo_path`
    pub build_dir: String,
    /// Account that owns the repository while a build runs
    pub build_account: String,
    /// Account that normally owns the repository and runs git/cmake
    pub owner_account: String,
    pub group: String,
    /// Prefix privileged commands with `sudo`
    pub use_sudo: bool,
    pub parallelism: u32,
    /// CMake build configuration (`--config`)
    pub build_config: String,
    /// Fixed target flags passed to the configure step
    pub configure_flags: Vec<String>,
    /// Delay between mock pipeline steps
    pub mock_step_delay_ms: u64,
    /// How long abort waits for the worker before cleaning up
    pub abort_settle_timeout_secs: u64,
    pub toolchain: ToolchainConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("/home/llama.cpp/repo"),
            build_dir: "build-wmma".to_string(),
            build_account: "server-dashboard".to_string(),
            owner_account: "llama.cpp".to_string(),
            group: "users".to_string(),
            use_sudo: true,
            parallelism: 16,
            build_config: "Release".to_string(),
            configure_flags: vec![
                "-DGGML_HIP=ON".to_string(),
                "-DGPU_TARGETS=gfx1100".to_string(),
                "-DGGML_HIP_ROCWMMA_FATTN=ON".to_string(),
                "-DCMAKE_CXX_FLAGS=-I/opt/rocm/include/rocwmma".to_string(),
            ],
            mock_step_delay_ms: 2000,
            abort_settle_timeout_secs: 15,
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            ..Default::default()
        }
    }

    pub fn with_build_dir(mut self, build_dir: impl Into<String>) -> Self {
        self.build_dir = build_dir.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_mock_step_delay(mut self, delay: Duration) -> Self {
        self.mock_step_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_abort_settle_timeout(mut self, timeout: Duration) -> Self {
        self.abort_settle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn mock_step_delay(&self) -> Duration {
        Duration::from_millis(self.mock_step_delay_ms)
    }

    pub fn abort_settle_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_settle_timeout_secs)
    }
}

/// Auxiliary queries that locate the compiler toolchain before configure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Prints the directory holding the compiler binary
    pub compiler_query: Vec<String>,
    /// Prints the toolchain runtime root
    pub runtime_query: Vec<String>,
    /// Compiler binary name appended to the queried directory
    pub compiler_name: String,
    /// Configure define receiving the compiler path
    pub compiler_define: String,
    /// Configure define receiving the runtime root
    pub runtime_define: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            compiler_query: vec!["hipconfig".to_string(), "-l".to_string()],
            runtime_query: vec!["hipconfig".to_string(), "-R".to_string()],
            compiler_name: "clang".to_string(),
            compiler_define: "HIPCXX".to_string(),
            runtime_define: "HIP_PATH".to_string(),
        }
    }
}
