//! Transport error types and connection failure classification.

use std::fmt;

use thiserror::Error;

/// Longest command prefix kept in [`TransportError::CommandFailed`].
pub const COMMAND_DISPLAY_LIMIT: usize = 64;

/// Connection-class failures that are worth retrying.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionErrorKind {
    /// The remote end refused the credentials or the key.
    PermissionDenied,
    /// Nothing listens on the target port yet.
    Refused,
    /// The peer reset the connection.
    Reset,
    /// No route to the host.
    Unreachable,
    /// The peer closed the session unexpectedly.
    Disconnected,
    /// Authentication was rejected.
    AuthFailure,
    /// The attempt timed out.
    Timeout,
}

impl ConnectionErrorKind {
    /// Classifies a client error message, returning `None` for failures that
    /// retrying will not fix.
    #[must_use]
    pub fn classify(message: &str) -> Option<Self> {
        let lower = message.to_ascii_lowercase();
        let patterns: [(&str, Self); 13] = [
            ("permission denied", Self::PermissionDenied),
            ("connection refused", Self::Refused),
            ("refused", Self::Refused),
            ("connection reset", Self::Reset),
            ("reset by peer", Self::Reset),
            ("no route to host", Self::Unreachable),
            ("network is unreachable", Self::Unreachable),
            ("host is unreachable", Self::Unreachable),
            ("connection closed", Self::Disconnected),
            ("broken pipe", Self::Disconnected),
            ("authentication failed", Self::AuthFailure),
            ("timed out", Self::Timeout),
            ("timeout", Self::Timeout),
        ];
        patterns
            .into_iter()
            .find(|(pattern, _)| lower.contains(pattern))
            .map(|(_, kind)| kind)
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PermissionDenied => "permission denied",
            Self::Refused => "connection refused",
            Self::Reset => "connection reset",
            Self::Unreachable => "host unreachable",
            Self::Disconnected => "disconnected",
            Self::AuthFailure => "authentication failure",
            Self::Timeout => "timed out",
        };
        f.write_str(text)
    }
}

/// Errors raised by transports and connections.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// A transient connection-class failure.
    #[error("{kind} while connecting to {endpoint}: {message}")]
    Connection {
        /// Failure classification.
        kind: ConnectionErrorKind,
        /// Endpoint being contacted.
        endpoint: String,
        /// Client error text.
        message: String,
    },
    /// A remote command finished unsuccessfully.
    #[error("command exited with status {status_text}: {command}")]
    CommandFailed {
        /// Remote exit status, absent when the command was terminated.
        exit_code: Option<i32>,
        /// Human readable exit status.
        status_text: String,
        /// Command text, truncated for display.
        command: String,
    },
    /// A file upload did not complete.
    #[error("file transfer failed: {message}")]
    Transfer {
        /// Reason the transfer failed.
        message: String,
    },
    /// Transport options or connection state are unusable.
    #[error("invalid transport configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },
    /// The remote end answered with something that could not be understood.
    #[error("unexpected response from {endpoint}: {message}")]
    Protocol {
        /// Endpoint that produced the response.
        endpoint: String,
        /// Description of the problem.
        message: String,
    },
    /// A session method was called out of order.
    #[error("{0}")]
    Usage(String),
    /// A local helper program could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Local file access failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path being accessed.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// The protocol has no equivalent for the requested operation.
    #[error("{transport} does not support {operation}")]
    Unsupported {
        /// Transport name.
        transport: String,
        /// Operation that was requested.
        operation: String,
    },
}

impl TransportError {
    /// Builds a [`TransportError::CommandFailed`] with the command truncated
    /// for display.
    #[must_use]
    pub fn command_failed(exit_code: Option<i32>, command: &str) -> Self {
        let status_text = exit_code.map_or_else(|| "unknown".to_owned(), |code| code.to_string());
        Self::CommandFailed {
            exit_code,
            status_text,
            command: truncate_command(command),
        }
    }

    /// Returns `true` for connection-class failures that may succeed when
    /// retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

fn truncate_command(command: &str) -> String {
    let trimmed = command.trim();
    if trimmed.chars().count() <= COMMAND_DISPLAY_LIMIT {
        return trimmed.to_owned();
    }
    let mut short: String = trimmed.chars().take(COMMAND_DISPLAY_LIMIT).collect();
    short.push_str("...");
    short
}
