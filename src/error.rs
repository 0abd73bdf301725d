//! Structured error types for the VeriTag engine.
//!
//! Every public library function returns [`Result<T>`] carrying a
//! domain-specific [`VeritagError`].  Mutating registry operations reject the
//! whole call with one of these variants before any state is touched.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the VeriTag library.
#[derive(Error, Debug)]
pub enum VeritagError {
    /// Caller failed a role check (not the administrator / not an issuer).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Zero, empty, malformed, or over-limit argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Duplicate batch id.
    #[error("batch {0} already registered")]
    AlreadyExists(u64),

    /// Unknown batch on a mutating path.
    #[error("batch {0} not registered")]
    NotFound(u64),

    /// Paired-array call with mismatched lengths.
    #[error("array length mismatch: {items} identifiers vs {batches} batch ids")]
    ArrayLengthMismatch { items: usize, batches: usize },

    /// Mutating call while the circuit breaker is engaged.
    #[error("system paused")]
    SystemPaused,

    /// Invalid state transition (e.g. pausing an already-paused registry).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Direct database errors (auto-converted via `?` in the registry module).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("config: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific domain.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, VeritagError>;

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Extension trait that adds domain-specific context to any `Result<T, E>`.
///
/// Usage mirrors `anyhow::Context` but tags the error with the originating
/// subsystem so that callers can categorise failures.
///
/// ```ignore
/// std::fs::read(path).ctx_store("read events export")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_config(self, msg: &str) -> Result<T>;
    fn ctx_store(self, msg: &str) -> Result<T>;
    fn ctx_export(self, msg: &str) -> Result<T>;
    fn ctx_input(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| VeritagError::Config(format!("{msg}: {e}")))
    }
    fn ctx_store(self, msg: &str) -> Result<T> {
        self.map_err(|e| VeritagError::Other(format!("store: {msg}: {e}")))
    }
    fn ctx_export(self, msg: &str) -> Result<T> {
        self.map_err(|e| VeritagError::Other(format!("export: {msg}: {e}")))
    }
    fn ctx_input(self, msg: &str) -> Result<T> {
        self.map_err(|e| VeritagError::InvalidInput(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_store(self, msg: &str) -> Result<T>;
    fn required_input(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_store(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| VeritagError::Other(format!("store: {msg}")))
    }
    fn required_input(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| VeritagError::InvalidInput(msg.to_string()))
    }
}
