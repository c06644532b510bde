use thiserror::Error;
use uuid::Uuid;

use crate::domain::session::BuildState;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid build state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: BuildState, to: BuildState },

    #[error("Build session already finished: {0}")]
    AlreadyFinished(Uuid),
}
