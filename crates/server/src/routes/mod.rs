pub mod build;
mod config;
mod health;

pub use config::*;
pub use health::*;
