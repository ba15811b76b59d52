pub mod glob;
pub mod graceful_shutdown;

pub use glob::glob_match;
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
