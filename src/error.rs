//! Error taxonomy shared by every layer of the crate.
//!
//! Composition and validation failures surface as [`HarnessError::Config`]
//! before anything is created. Backend failures, lifecycle misuse, cancellation
//! and failed subprocesses each have their own variant so callers can decide
//! what to report without parsing messages.

/// Errors produced while composing, provisioning, or driving a harness.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Malformed request, reference, path, or quantity.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource creation or removal failed in the backend.
    #[error("Backend error: {message}")]
    Backend {
        /// Backend's description of the failure
        message: String,
        /// The backend reported the target resource as missing
        not_found: bool,
    },

    /// An operation was invoked outside its valid lifecycle state.
    #[error("Invalid state: cannot {operation} while harness is {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the harness was in
        state: String,
    },

    /// The execution context was cancelled or timed out.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A subprocess exited unsuccessfully.
    #[error("command `{command}` exited with {}\n{output}", exit_label(.exit_code))]
    Process {
        /// Rendered command line
        command: String,
        /// Exit code, if the process exited normally
        exit_code: Option<i64>,
        /// Combined stdout and stderr captured during the run
        output: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i64>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

impl HarnessError {
    /// Shorthand for a [`HarnessError::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Shorthand for a [`HarnessError::Backend`] error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            not_found: false,
        }
    }

    /// A [`HarnessError::Backend`] error for a resource that does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            not_found: true,
        }
    }

    /// Whether this error is a cancellation or timeout.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether the backend reported the target resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Backend { not_found: true, .. })
    }

    /// Captured subprocess output, if this error carries any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Process { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[cfg(feature = "containers")]
impl From<bollard::errors::Error> for HarnessError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::not_found(message),
            e => Self::backend(e.to_string()),
        }
    }
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_carries_output() {
        let err = HarnessError::Process {
            command: "terraform apply".to_string(),
            exit_code: Some(1),
            output: "Error: invalid provider\n".to_string(),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("terraform apply"));
        assert!(rendered.contains("exit code 1"));
        assert!(rendered.contains("invalid provider"));
        assert_eq!(err.output(), Some("Error: invalid provider\n"));
    }

    #[test]
    fn test_not_found_is_structured() {
        assert!(HarnessError::not_found("get foo: no such volume").is_not_found());
        // Wording alone never marks a resource as gone.
        assert!(!HarnessError::backend("credential helper not found: no such file").is_not_found());
        assert!(!HarnessError::config("not found").is_not_found());
    }

    #[cfg(feature = "containers")]
    #[test]
    fn test_engine_404_is_not_found() {
        let missing = HarnessError::from(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such volume: scratch".to_string(),
        });
        assert!(missing.is_not_found());
        assert_eq!(missing.to_string(), "Backend error: no such volume: scratch");

        let conflict = HarnessError::from(bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "volume is in use: no such thing as free".to_string(),
        });
        assert!(!conflict.is_not_found());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = HarnessError::InvalidState {
            operation: "exec",
            state: "uninitialized".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state: cannot exec while harness is uninitialized"
        );
    }
}
