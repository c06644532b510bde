//! Scripted stand-in for the real pipeline. Never touches the filesystem.

use std::time::Duration;

use async_trait::async_trait;
use events::OutputSender;
use opsdash_core::{BuildKind, BuildSession};
use tracing::info;

use crate::cancel::CancellationController;
use crate::pipeline::BuildPipeline;

pub const MOCK_STEPS: [&str; 10] = [
    "Starting mock build process...",
    "Initializing build environment...",
    "Downloading dependencies...",
    "Compiling core components (10%)...",
    "Compiling core components (25%)...",
    "Compiling core components (50%)...",
    "Compiling core components (75%)...",
    "Linking binaries...",
    "Running tests...",
    "Build completed successfully!",
];

pub struct MockPipeline {
    step_delay: Duration,
}

impl MockPipeline {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for MockPipeline {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl BuildPipeline for MockPipeline {
    fn kind(&self) -> BuildKind {
        BuildKind::Mock
    }

    async fn run(
        &self,
        session: &mut BuildSession,
        cancel: &CancellationController,
        out: &OutputSender,
    ) -> bool {
        for (i, step) in MOCK_STEPS.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.step_delay).await;
            }
            if cancel.is_stop_requested() {
                info!(session_id = %session.id, step = i, "Mock build aborted");
                out.line("Build aborted by user");
                return false;
            }
            out.line(*step);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::BuildMessage;

    fn session() -> BuildSession {
        let mut session = BuildSession::new(BuildKind::Mock);
        session.start().unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_uninterrupted_run_emits_every_step() {
        let pipeline = MockPipeline::default();
        let cancel = CancellationController::new();
        let (sender, stream) = events::channel();

        let success = pipeline.run(&mut session(), &cancel, &sender).await;
        sender.finish(success);
        let messages = stream.collect_all().await;

        assert!(success);
        assert_eq!(messages.len(), MOCK_STEPS.len() + 1);
        for (msg, step) in messages.iter().zip(MOCK_STEPS) {
            assert_eq!(msg.text(), Some(step));
        }
        assert_eq!(messages.last(), Some(&BuildMessage::completed(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_after_first_step() {
        let pipeline = MockPipeline::default();
        let cancel = CancellationController::new();
        let (sender, mut stream) = events::channel();

        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            let success = pipeline.run(&mut session(), &worker_cancel, &sender).await;
            sender.finish(success);
        });

        let first = stream.recv().await.unwrap();
        assert_eq!(first.text(), Some(MOCK_STEPS[0]));
        cancel.request_stop();

        let rest = stream.collect_all().await;
        worker.await.unwrap();

        assert_eq!(
            rest,
            vec![
                BuildMessage::output("Build aborted by user"),
                BuildMessage::completed(false),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let pipeline = MockPipeline::new(Duration::ZERO);
        let cancel = CancellationController::new();
        cancel.request_stop();
        let (sender, stream) = events::channel();

        let success = pipeline.run(&mut session(), &cancel, &sender).await;
        sender.finish(success);

        assert!(!success);
        assert_eq!(
            stream.collect_all().await,
            vec![
                BuildMessage::output("Build aborted by user"),
                BuildMessage::completed(false),
            ]
        );
    }

    #[test]
    fn test_kind() {
        assert_eq!(MockPipeline::default().kind(), BuildKind::Mock);
    }
}
