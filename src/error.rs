//! Crate-wide error taxonomy.
//!
//! One enum, `OrchestratorError`, carries every recoverable and terminal failure kind
//! the agent loop, the tool execution engine, and the scan controller can produce. It is
//! inspected (not just displayed) at the event boundary, so variants carry a stable
//! `kind()` string and a `recoverable()` flag rather than leaving that policy to callers.

use std::fmt;

/// Subcategories of a failed call to an LLM provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Network,
    Quota,
    InvalidCredential,
    Malformed,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Quota => "quota",
            ProviderErrorKind::InvalidCredential => "invalid_credential",
            ProviderErrorKind::Malformed => "malformed",
        };
        write!(f, "{}", s)
    }
}

/// Subcategories of a failed tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolErrorKind {
    NotInstalled,
    TimedOut,
    NonZeroExit,
    OutputLimitExceeded,
    ParseFailed,
    Cancelled,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::NotInstalled => "not_installed",
            ToolErrorKind::TimedOut => "timed_out",
            ToolErrorKind::NonZeroExit => "non_zero_exit",
            ToolErrorKind::OutputLimitExceeded => "output_limit_exceeded",
            ToolErrorKind::ParseFailed => "parse_failed",
            ToolErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// The full error taxonomy shared by every component in the crate.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    InvalidTarget(String),
    ValidationError(String),
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },
    Tool {
        kind: ToolErrorKind,
        message: String,
    },
    BudgetExceeded(String),
    StorageError(String),
    StreamOverflow(String),
}

impl OrchestratorError {
    /// Stable, machine-readable kind identifier used in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidTarget(_) => "InvalidTarget",
            OrchestratorError::ValidationError(_) => "ValidationError",
            OrchestratorError::Provider { .. } => "ProviderError",
            OrchestratorError::Tool { .. } => "ToolError",
            OrchestratorError::BudgetExceeded(_) => "BudgetExceeded",
            OrchestratorError::StorageError(_) => "StorageError",
            OrchestratorError::StreamOverflow(_) => "StreamOverflow",
        }
    }

    /// Whether the agent loop may recover locally (emit and continue) or must
    /// terminate the scan as `failed`.
    pub fn recoverable(&self) -> bool {
        match self {
            OrchestratorError::ValidationError(_) => true,
            OrchestratorError::Provider { kind, .. } => matches!(kind, ProviderErrorKind::Malformed),
            OrchestratorError::Tool { kind, .. } => {
                matches!(kind, ToolErrorKind::ParseFailed | ToolErrorKind::NonZeroExit)
            }
            OrchestratorError::InvalidTarget(_) => false,
            OrchestratorError::BudgetExceeded(_) => false,
            OrchestratorError::StorageError(_) => false,
            OrchestratorError::StreamOverflow(_) => false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        OrchestratorError::ValidationError(message.into())
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        OrchestratorError::InvalidTarget(message.into())
    }

    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        OrchestratorError::Provider {
            kind,
            message: message.into(),
        }
    }

    pub fn tool(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        OrchestratorError::Tool {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::InvalidTarget(msg) => write!(f, "invalid target: {}", msg),
            OrchestratorError::ValidationError(msg) => write!(f, "validation error: {}", msg),
            OrchestratorError::Provider { kind, message } => {
                write!(f, "provider error ({}): {}", kind, message)
            }
            OrchestratorError::Tool { kind, message } => {
                write!(f, "tool error ({}): {}", kind, message)
            }
            OrchestratorError::BudgetExceeded(msg) => write!(f, "budget exceeded: {}", msg),
            OrchestratorError::StorageError(msg) => write!(f, "storage error: {}", msg),
            OrchestratorError::StreamOverflow(msg) => write!(f, "stream overflow: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Provider {
            kind: ProviderErrorKind::Malformed,
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Tool {
            kind: ToolErrorKind::NotInstalled,
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_recoverable() {
        let e = OrchestratorError::validation("missing field target");
        assert_eq!(e.kind(), "ValidationError");
        assert!(e.recoverable());
    }

    #[test]
    fn invalid_credential_is_not_recoverable() {
        let e = OrchestratorError::provider(ProviderErrorKind::InvalidCredential, "bad key");
        assert_eq!(e.kind(), "ProviderError");
        assert!(!e.recoverable());
    }

    #[test]
    fn non_zero_exit_is_recoverable_but_not_installed_is_not() {
        let recoverable = OrchestratorError::tool(ToolErrorKind::NonZeroExit, "exit 1");
        let terminal = OrchestratorError::tool(ToolErrorKind::NotInstalled, "no binary");
        assert!(recoverable.recoverable());
        assert!(!terminal.recoverable());
    }

    #[test]
    fn display_includes_kind_context() {
        let e = OrchestratorError::invalid_target("loopback address rejected");
        let s = e.to_string();
        assert!(s.contains("invalid target"));
        assert!(s.contains("loopback"));
    }
}
