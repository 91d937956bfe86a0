//! Async runtime management
//!
//! Dual Tokio runtimes for network I/O and chunk processing, plus the
//! shutdown broadcast shared by background loops.

pub mod executor;
pub mod shutdown;

pub use executor::{AnalyzerRuntime, RuntimeConfig};
pub use shutdown::ShutdownSignal;
