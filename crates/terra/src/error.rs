//! Error types for terra

// This warning is a false positive from thiserror macro expansion
#![allow(unused_assignments)]

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::config::Backend;

/// Result type alias for terra operations
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for a build or serve invocation that failed
pub const EXIT_FAILED: u8 = 1;
/// Exit code when no port could be bound for the dev server
pub const EXIT_PORT_EXHAUSTED: u8 = 2;
/// Exit code when the invocation was interrupted (128 + SIGINT)
pub const EXIT_INTERRUPTED: u8 = 130;

/// Failure categories surfaced at the invocation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The external toolchain exited non-zero
    Compiler,
    /// No explicit file was given and the conventional entry file is missing
    MissingEntryFile,
    /// No free port within the retry window
    PortExhausted,
    /// A required compiler, archiver or installed library is missing
    ToolchainUnavailable,
    /// The invocation was cancelled from the terminal
    Interrupted,
    /// Anything else (I/O, configuration, bad arguments)
    Other,
}

/// Main error type for terra
#[derive(Debug, Error, Diagnostic)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[help]
        help: String,
    },

    /// Project error
    #[error("Project error: {message}")]
    Project {
        message: String,
        #[help]
        help: String,
    },

    /// Cache error
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[help]
        help: String,
    },

    /// Dev server error
    #[error("Server error: {message}")]
    Server {
        message: String,
        #[help]
        help: String,
    },

    /// The external compiler or archiver exited non-zero
    #[error("{operation} failed")]
    #[diagnostic(help("Fix the errors reported by the compiler above and run again"))]
    Compiler {
        /// What was being built (e.g. "web support library")
        operation: String,
        /// Captured compiler output, verbatim
        diagnostics: String,
    },

    /// A required external tool is not installed
    #[error("{tool} is required for {backend} builds but was not found")]
    ToolchainUnavailable {
        tool: String,
        backend: Backend,
        #[help]
        help: String,
    },

    /// The conventional entry file of the project does not exist
    #[error("No entry file found at {path}")]
    #[diagnostic(help("Create lib/main.cpp with your Fern code, or pass a source file explicitly"))]
    MissingEntryFile { path: Utf8PathBuf },

    /// An explicitly requested source file does not exist
    #[error("File not found: {path}")]
    SourceNotFound { path: Utf8PathBuf },

    /// An explicitly requested source file is not C++
    #[error("Unsupported file type: {path}")]
    #[diagnostic(help("Supported types: .cpp, .cxx, .cc"))]
    UnsupportedSource { path: Utf8PathBuf },

    /// Every port in the retry window was taken
    #[error("No free port between {first} and {last}")]
    #[diagnostic(help("Stop the process holding these ports or choose another one with --port"))]
    PortExhausted { first: u16, last: u16 },

    /// Cancelled by the user
    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a project error
    pub fn project(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Project {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a cache error
    pub fn cache(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a dev server error
    pub fn server(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a compiler error carrying the tool's output
    pub fn compiler(operation: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::Compiler {
            operation: operation.into(),
            diagnostics: diagnostics.into(),
        }
    }

    /// Create a missing toolchain error
    pub fn toolchain_unavailable(
        tool: impl Into<String>,
        backend: Backend,
        help: impl Into<String>,
    ) -> Self {
        Self::ToolchainUnavailable {
            tool: tool.into(),
            backend,
            help: help.into(),
        }
    }

    /// Failure category of this error
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Compiler { .. } => FailureKind::Compiler,
            Self::MissingEntryFile { .. } => FailureKind::MissingEntryFile,
            Self::PortExhausted { .. } => FailureKind::PortExhausted,
            Self::ToolchainUnavailable { .. } => FailureKind::ToolchainUnavailable,
            Self::Interrupted => FailureKind::Interrupted,
            _ => FailureKind::Other,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            FailureKind::PortExhausted => EXIT_PORT_EXHAUSTED,
            FailureKind::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_FAILED,
        }
    }

    /// Raw compiler output, if this error came from the toolchain
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Compiler { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let failed = Error::compiler("project build", "main.cpp:1:1: error");
        let ports = Error::PortExhausted {
            first: 8000,
            last: 8009,
        };

        assert_eq!(failed.exit_code(), EXIT_FAILED);
        assert_eq!(ports.exit_code(), EXIT_PORT_EXHAUSTED);
        assert_ne!(failed.exit_code(), ports.exit_code());
        assert_eq!(Error::Interrupted.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_compiler_diagnostics_kept_verbatim() {
        let text = "main.cpp:3:5: error: expected ';' before '}' token\n    3 |   int x\n";
        let err = Error::compiler("project build", text);

        assert_eq!(err.kind(), FailureKind::Compiler);
        assert_eq!(err.diagnostics(), Some(text));
    }

    #[test]
    fn test_io_error_is_other() {
        let err: Error = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), FailureKind::Other);
        assert!(err.diagnostics().is_none());
    }
}
