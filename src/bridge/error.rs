//! Error kinds surfaced by the bridge core.
//!
//! Agent-facing tool handlers serialise these into a `{kind, message}`
//! payload. `invalid_state_transition` is a programming fault and is
//! never surfaced raw: the tools layer logs it and reports a generic
//! `server_error` instead.
//!
//! The connect path additionally classifies raw error text as
//! retryable (transient network conditions) or permanent
//! (authentication failures, protocol errors). Authentication failures
//! are never retried to avoid locking out accounts.

use serde_json::json;
use thiserror::Error;

use super::record::CommandStatus;

/// Errors produced by the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No remote session is open.
    #[error("no open session; use terminal_connect first")]
    NotConnected,

    /// A command is already in flight on the single session.
    #[error("a command is already in flight: {0}")]
    Busy(String),

    /// The command id does not name a retained record.
    #[error("unknown command id: {0}")]
    UnknownCommandId(String),

    /// A state-machine edge that the registry forbids. Programming
    /// fault; mapped to `server_error` before reaching the agent.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: CommandStatus,
        to: CommandStatus,
    },

    /// The synchronous wait window elapsed. The command may still be
    /// running and remains retrievable by id.
    #[error("synchronous wait elapsed; command may still be running")]
    Timeout,

    /// The remote channel failed; the session has been torn down.
    #[error("transport error: {0}")]
    Transport(String),

    /// Catch-all for internal faults.
    #[error("{0}")]
    Server(String),
}

impl BridgeError {
    /// Stable machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::NotConnected => "not_connected",
            BridgeError::Busy(_) => "busy",
            BridgeError::UnknownCommandId(_) => "unknown_command_id",
            BridgeError::InvalidStateTransition { .. } => "invalid_state_transition",
            BridgeError::Timeout => "timeout",
            BridgeError::Transport(_) => "transport_error",
            BridgeError::Server(_) => "server_error",
        }
    }

    /// Structured error payload for the agent: `{"kind", "message"}`.
    ///
    /// Programming faults are downgraded to `server_error` here; the
    /// caller is expected to have logged the original.
    pub fn to_payload(&self) -> String {
        let (kind, message) = match self {
            BridgeError::InvalidStateTransition { .. } => {
                ("server_error", "internal error".to_string())
            }
            other => (other.kind(), other.to_string()),
        };
        json!({ "kind": kind, "message": message }).to_string()
    }
}

/// Permanent failure patterns on the connect path.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "publickey",
    "no authentication",
    "all authentication methods failed",
];

/// Transient failure patterns worth a retry.
const TRANSIENT_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Classify a connect-path error as retryable or permanent.
///
/// Authentication patterns win over transient patterns when both are
/// present. Unknown errors default to retryable unless they look like
/// an SSH protocol fault.
pub(crate) fn is_retryable_connect_error(error: &str) -> bool {
    let lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if TRANSIENT_ERRORS.iter().any(|p| lower.contains(p)) {
        return true;
    }

    !lower.contains("ssh") || lower.contains("timeout") || lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod kinds {
        use super::*;

        #[test]
        fn test_kind_strings_are_stable() {
            assert_eq!(BridgeError::NotConnected.kind(), "not_connected");
            assert_eq!(BridgeError::Busy("id".into()).kind(), "busy");
            assert_eq!(
                BridgeError::UnknownCommandId("id".into()).kind(),
                "unknown_command_id"
            );
            assert_eq!(BridgeError::Timeout.kind(), "timeout");
            assert_eq!(
                BridgeError::Transport("gone".into()).kind(),
                "transport_error"
            );
        }

        #[test]
        fn test_payload_is_json_with_kind_and_message() {
            let payload = BridgeError::NotConnected.to_payload();
            let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(value["kind"], "not_connected");
            assert!(value["message"].as_str().unwrap().contains("no open session"));
        }

        #[test]
        fn test_invalid_transition_is_masked_as_server_error() {
            let err = BridgeError::InvalidStateTransition {
                from: CommandStatus::Completed,
                to: CommandStatus::Running,
            };
            let value: serde_json::Value = serde_json::from_str(&err.to_payload()).unwrap();
            assert_eq!(value["kind"], "server_error");
            assert!(!value["message"].as_str().unwrap().contains("transition"));
        }
    }

    mod retry_classification {
        use super::*;

        #[test]
        fn test_auth_failures_are_permanent() {
            assert!(!is_retryable_connect_error("Authentication failed"));
            assert!(!is_retryable_connect_error("Permission denied (publickey)"));
        }

        #[test]
        fn test_network_failures_are_transient() {
            assert!(is_retryable_connect_error("Connection refused"));
            assert!(is_retryable_connect_error("connection timed out after 30s"));
            assert!(is_retryable_connect_error("No route to host"));
        }

        #[test]
        fn test_auth_wins_over_transient() {
            assert!(!is_retryable_connect_error(
                "timeout during authentication failed"
            ));
        }

        #[test]
        fn test_ssh_protocol_errors_are_permanent() {
            assert!(!is_retryable_connect_error("SSH version mismatch"));
            assert!(is_retryable_connect_error("SSH connection timeout"));
        }

        #[test]
        fn test_unknown_errors_default_to_retryable() {
            assert!(is_retryable_connect_error("something odd happened"));
        }
    }
}
