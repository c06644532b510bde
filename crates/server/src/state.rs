use crate::config::DashboardConfig;
use orchestrator::SessionGuard;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub builds: SessionGuard,
    pub config: Arc<DashboardConfig>,
    pub app_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(config: DashboardConfig) -> Self {
        let builds = SessionGuard::from_config(&config.build);
        Self {
            builds,
            config: Arc::new(config),
            app_dir: None,
        }
    }

    pub fn with_app_dir(mut self, app_dir: PathBuf) -> Self {
        self.app_dir = Some(app_dir);
        self
    }
}
