//! Error types for charon
//!
//! All modules use `CharonResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for charon operations
pub type CharonResult<T> = Result<T, CharonError>;

/// All errors that can occur in charon
#[derive(Error, Debug)]
pub enum CharonError {
    // Environment errors
    #[error("cannot determine the user cache directory")]
    CacheDirUnavailable,

    #[error("setting up process environment: {context}")]
    Environment {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Agent errors
    #[error("acquiring agent lock file (agent already running?): {0}")]
    LockHeld(std::io::Error),

    #[error("dialing agent socket: deadline exceeded")]
    DialTimeout,

    #[error("agent response: {status} {message}")]
    AgentResponse { status: String, message: String },

    #[error("abstract socket addresses are only supported on Linux: {0}")]
    AbstractSocketUnsupported(String),

    // Configuration errors
    #[error("invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("unknown helper: {0}")]
    UnknownHelper(String),

    // Credential errors
    #[error("no credentials found for {uri}: {reason}")]
    CredentialsUnavailable { uri: String, reason: String },

    #[error("GitHub CLI not authenticated. Run: gh auth login")]
    GithubNotAuthenticated,

    #[error("gcloud not authenticated. Run: gcloud auth login")]
    GcloudNotAuthenticated,

    #[error("secret lookup for binding {binding:?} failed: {reason}")]
    Lookup { binding: String, reason: String },

    #[error("unsupported URI {uri}: {reason}")]
    UnsupportedUri { uri: String, reason: String },

    #[error("token exchange with {endpoint} failed: {reason}")]
    TokenExchange { endpoint: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl CharonError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::GithubNotAuthenticated => Some("Run: gh auth login"),
            Self::GcloudNotAuthenticated => Some("Run: gcloud auth login"),
            Self::DialTimeout => {
                Some("The agent did not come up in time. Retry, or set CHARON_STANDALONE=1")
            }
            Self::CredentialsUnavailable { .. } => {
                Some("Run: charon setup-uri <uri> for setup instructions")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CharonError::DialTimeout;
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn error_hint() {
        let err = CharonError::GithubNotAuthenticated;
        assert_eq!(err.hint(), Some("Run: gh auth login"));
        assert!(CharonError::Internal("x".into()).hint().is_none());
    }

    #[test]
    fn io_helper_keeps_context() {
        let err = CharonError::io(
            "reading pid file",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("reading pid file"));
    }
}
