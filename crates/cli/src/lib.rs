//! Command-line front end for the hearth inference runtime.

pub mod cli;
pub mod logging;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "hearth";
