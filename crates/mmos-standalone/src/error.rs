//! Standalone error types.

use mmos_core::{KernelError, error::LayoutError};
use thiserror::Error;

/// Errors from the standalone console.
#[derive(Debug, Error)]
pub enum StandaloneError {
    /// Kernel refused an operation
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// Layout could not be written
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    /// Script could not be read or output written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown command or bad argument
    #[error("cannot parse command: {0}")]
    Parse(String),

    /// Device inbound queue full
    #[error("device is not accepting packets")]
    Busy,
}
