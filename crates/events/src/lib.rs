//! Output broker for build sessions
//!
//! This crate carries streamed build output and the terminal outcome from the
//! worker task running a pipeline to the caller consuming the stream.

mod broker;
mod types;

pub use broker::{channel, BuildStream, OutputSender};
pub use types::*;
