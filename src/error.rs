//! Kernel error taxonomy.
//!
//! Every refusal the kernel produces carries a coarse wire code plus the
//! machine-readable reason tokens that triggered it (`policy:tool_denied`,
//! `capability_missing:fs:read:workspace`, ...). Reason tokens are stable —
//! callers and tests match on them.

use serde::Serialize;

/// Coarse error code reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or protocol-violating request.
    InvalidRequest,
    /// Downstream failure or exhausted resource.
    Unavailable,
    /// Target node has no live session.
    NotConnected,
    /// Kernel denied the action.
    NotAllowed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::NotAllowed => "NOT_ALLOWED",
        }
    }
}

/// A kernel-level refusal or failure.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The gate, the limiter, or the approval layer refused the action.
    #[error("{code:?}: {reasons:?}")]
    Denied {
        code: ErrorCode,
        /// Stable machine-readable tokens, most specific first.
        reasons: Vec<String>,
        /// Break-glass env var that would unlock the operation, if any.
        break_glass: Option<&'static str>,
    },

    /// Caller-side shape error (`invalid:*` tokens).
    #[error("invalid request: {reasons:?}")]
    Invalid { reasons: Vec<String> },

    /// Target node is not connected.
    #[error("node '{node_id}' is not connected")]
    NodeNotConnected { node_id: String },

    /// Rate limit, tripwire block, concurrency cap, or slot exhaustion.
    #[error("resource exhausted: {reason}")]
    Resource { reason: String },

    /// A decision without a valid integrity stamp, or a kernel-wrapped tool
    /// passed through the dispatcher twice. Fatal for the invocation.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Ledger or downstream I/O failure before the tool ran.
    #[error("unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl KernelError {
    /// Build a `NOT_ALLOWED` denial from reason tokens.
    pub fn denied(reasons: Vec<String>) -> Self {
        KernelError::Denied {
            code: ErrorCode::NotAllowed,
            reasons,
            break_glass: None,
        }
    }

    /// A denial that names the env var that would unlock it.
    pub fn denied_with_break_glass(reasons: Vec<String>, env: &'static str) -> Self {
        KernelError::Denied {
            code: ErrorCode::NotAllowed,
            reasons,
            break_glass: Some(env),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        KernelError::Invalid {
            reasons: vec![reason.into()],
        }
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        KernelError::Resource {
            reason: reason.into(),
        }
    }

    /// The wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::Denied { code, .. } => *code,
            KernelError::Invalid { .. } => ErrorCode::InvalidRequest,
            KernelError::NodeNotConnected { .. } => ErrorCode::NotConnected,
            KernelError::Resource { .. } => ErrorCode::Unavailable,
            KernelError::Integrity(_) => ErrorCode::InvalidRequest,
            KernelError::Unavailable(_) => ErrorCode::Unavailable,
        }
    }

    /// All reason tokens carried by this error.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            KernelError::Denied { reasons, .. } | KernelError::Invalid { reasons } => {
                reasons.clone()
            }
            KernelError::NodeNotConnected { node_id } => {
                vec![format!("node_not_connected:{node_id}")]
            }
            KernelError::Resource { reason } => vec![reason.clone()],
            KernelError::Integrity(msg) => vec![format!("integrity:{msg}")],
            KernelError::Unavailable(e) => vec![e.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_carries_code_and_reasons() {
        let err = KernelError::denied(vec!["policy:tool_denied".into()]);
        assert_eq!(err.code(), ErrorCode::NotAllowed);
        assert_eq!(err.reasons(), vec!["policy:tool_denied".to_string()]);
    }

    #[test]
    fn break_glass_is_surfaced() {
        let err = KernelError::denied_with_break_glass(
            vec!["node_command_disabled:system.run".into()],
            "WARDEN_ALLOW_NODE_EXEC",
        );
        match err {
            KernelError::Denied { break_glass, .. } => {
                assert_eq!(break_glass, Some("WARDEN_ALLOW_NODE_EXEC"))
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn resource_maps_to_unavailable() {
        assert_eq!(
            KernelError::resource("RATE_LIMITED").code(),
            ErrorCode::Unavailable
        );
    }
}
