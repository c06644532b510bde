use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::process::ProcessHandle;

#[derive(Default)]
struct Inner {
    stop: AtomicBool,
    active: Mutex<Option<ProcessHandle>>,
}

/// Stop flag shared between the request side and the build worker, plus the
/// handle of the cancellable child currently running (if any).
#[derive(Clone, Default)]
pub struct CancellationController {
    inner: Arc<Inner>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stop flag and terminate the attached child, if any.
    ///
    /// Returns `true` only for the call that actually set the flag.
    pub fn request_stop(&self) -> bool {
        let first = !self.inner.stop.swap(true, Ordering::SeqCst);

        let active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = active.as_ref() {
            debug!("Stop requested, terminating active child");
            handle.terminate();
        }

        first
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Register the running cancellable child. If stop was already
    /// requested, the child is terminated right away.
    pub fn attach(&self, handle: ProcessHandle) {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_stop_requested() {
            handle.terminate();
        }
        *active = Some(handle);
    }

    pub fn detach(&self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn has_active_child(&self) -> bool {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl std::fmt::Debug for CancellationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationController")
            .field("stop_requested", &self.is_stop_requested())
            .field("has_active_child", &self.has_active_child())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandSpec, ProcessRunner};
    use crate::stage::StageKind;
    use std::time::Duration;

    #[test]
    fn test_initial_state() {
        let cancel = CancellationController::new();
        assert!(!cancel.is_stop_requested());
        assert!(!cancel.has_active_child());
    }

    #[test]
    fn test_request_stop_reports_first_call() {
        let cancel = CancellationController::new();
        assert!(cancel.request_stop());
        assert!(!cancel.request_stop());
        assert!(cancel.is_stop_requested());
    }

    #[test]
    fn test_clones_share_flag() {
        let cancel = CancellationController::new();
        let other = cancel.clone();

        other.request_stop();
        assert!(cancel.is_stop_requested());
    }

    #[tokio::test]
    async fn test_request_stop_terminates_attached_child() {
        let cancel = CancellationController::new();
        let spec = CommandSpec::shell("exec sleep 30");
        let process = ProcessRunner::execute(StageKind::Compile, &spec).unwrap();

        cancel.attach(process.handle());
        assert!(cancel.has_active_child());
        cancel.request_stop();

        let result = tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn test_attach_after_stop_terminates_immediately() {
        let cancel = CancellationController::new();
        cancel.request_stop();

        let spec = CommandSpec::shell("exec sleep 30");
        let process = ProcessRunner::execute(StageKind::Compile, &spec).unwrap();
        let handle = process.handle();
        cancel.attach(handle.clone());

        assert!(handle.is_terminated());
        let result = tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn test_detach_clears_child() {
        let cancel = CancellationController::new();
        let spec = CommandSpec::new("true");
        let process = ProcessRunner::execute(StageKind::Compile, &spec).unwrap();

        cancel.attach(process.handle());
        cancel.detach();
        assert!(!cancel.has_active_child());

        cancel.request_stop();
        assert!(process.wait().await.is_ok());
    }
}
