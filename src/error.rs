use std::io;
use thiserror::Error;

pub type Result<T> = ::std::result::Result<T, PsxError>;

#[derive(Error, Debug)]
pub enum PsxError {
    #[error("Input output error: {0}")]
    IoError(#[from] io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Save state error during {operation}: {reason}")]
    SaveStateError { operation: String, reason: String },
    #[error("Save state version {version} is not supported (supported: {min}..={max})")]
    UnsupportedSaveStateVersion { version: u32, min: u32, max: u32 },
    #[error("Not a CPU save state (bad magic)")]
    BadSaveStateMagic,
    #[error("Save state checksum mismatch: expected {expected:#010x} got {got:#010x}")]
    SaveStateChecksum { expected: u32, got: u32 },
    #[error("A breakpoint already exists at {0:#010x}")]
    DuplicateBreakpoint(u32),
    #[error("No breakpoint at {0:#010x}")]
    NoSuchBreakpoint(u32),
    #[error("Not inside a function, no return found after {0:#010x}")]
    NotInFunction(u32),
    #[error("Execution must be paused for this request")]
    NotPaused,
    #[error("Fastmem mapping unavailable: {0}")]
    FastmemUnavailable(String),
    #[error("Code generation failed: {0}")]
    CodeGen(String),
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Host I/O around the core (config files, save state files)
    Io,
    Configuration,
    /// Recovered locally by falling back to a slower engine or strategy
    EngineCapability,
    SaveStateIncompatibility,
    DebuggerMisuse,
}

impl PsxError {
    /// Get error category for logging/metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            PsxError::IoError(_) => ErrorCategory::Io,
            PsxError::ConfigError(_) => ErrorCategory::Configuration,
            PsxError::SaveStateError { .. }
            | PsxError::UnsupportedSaveStateVersion { .. }
            | PsxError::BadSaveStateMagic
            | PsxError::SaveStateChecksum { .. } => ErrorCategory::SaveStateIncompatibility,
            PsxError::DuplicateBreakpoint(_)
            | PsxError::NoSuchBreakpoint(_)
            | PsxError::NotInFunction(_)
            | PsxError::NotPaused => ErrorCategory::DebuggerMisuse,
            PsxError::FastmemUnavailable(_) | PsxError::CodeGen(_) => {
                ErrorCategory::EngineCapability
            }
        }
    }

    /// True if the session can carry on unchanged after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::SaveStateIncompatibility)
    }

    pub(crate) fn save_state(operation: &str, reason: impl ToString) -> Self {
        PsxError::SaveStateError {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}
