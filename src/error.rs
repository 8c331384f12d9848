//! Error types for rttihook.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during image parsing, RTTI scanning and hooking.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not an executable image: signature mismatch at offset 0x{0:X}")]
    NotAnImage(usize),

    #[error("PE headers truncated: need {expected} bytes, image is {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("section '{0}' not found")]
    MissingSection(&'static str),

    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("executable allocation of {size} bytes failed")]
    AllocFailed { size: usize },

    #[error("failed to change protection of {size} bytes at 0x{addr:X}")]
    ProtectFailed { addr: usize, size: usize },

    #[error("virtual function table pointer is null")]
    NullVft,

    #[cfg(target_os = "windows")]
    #[error("windows API error: {0}")]
    WindowsApi(#[from] windows::core::Error),
}
