use async_trait::async_trait;
use events::OutputSender;
use opsdash_core::{BuildKind, BuildSession};

use crate::cancel::CancellationController;

/// Body of a build session, run inside the worker task.
///
/// Implementations stream lines through `out` and report the outcome; the
/// terminal message is sent by the caller.
#[async_trait]
pub trait BuildPipeline: Send + Sync {
    /// Which session kind this pipeline serves
    fn kind(&self) -> BuildKind;

    /// Run to completion, failure or cancellation. Returns `true` on success.
    async fn run(
        &self,
        session: &mut BuildSession,
        cancel: &CancellationController,
        out: &OutputSender,
    ) -> bool;
}
