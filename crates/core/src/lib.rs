pub mod domain;
pub mod error;

pub use domain::session::{BuildKind, BuildSession, BuildState};
pub use error::CoreError;
