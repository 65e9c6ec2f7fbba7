//! Node configuration and the error taxonomy shared by every layer.

pub mod config;
pub mod errors;

pub use config::*;
pub use errors::*;
