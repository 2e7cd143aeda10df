use thiserror::Error;
use uuid::Uuid;

use crate::model::RoleStatus;

/// Comprehensive error type for the authorization engine.
///
/// `Deny` is a normal `Decision` outcome, never an error. Only genuinely
/// exceptional conditions (invalid input, missing entities, storage faults)
/// travel through this type.
#[derive(Debug, Error)]
pub enum AuthzError {
    // Role graph validation errors
    #[error("cycle detected: role {role_id} is already an ancestor of {parent_id}")]
    CycleDetected { role_id: String, parent_id: String },
    #[error("role hierarchy depth {depth} exceeds configured maximum {max}")]
    MaxDepthExceeded { depth: u32, max: u32 },
    #[error("role already exists: {role_id}")]
    RoleAlreadyExists { role_id: String },
    #[error("role {role_id} is a system role and cannot be modified")]
    SystemRoleImmutable { role_id: String },
    #[error("role {role_id} is {status:?} and cannot be edited")]
    RoleNotEditable { role_id: String, status: RoleStatus },
    #[error("invalid role status transition: {from:?} -> {to:?}")]
    InvalidStatusTransition { from: RoleStatus, to: RoleStatus },

    // Assignment validation errors
    #[error("role {role_id} is archived and cannot accept new assignments")]
    ArchivedRole { role_id: String },
    #[error("invalid validity window: valid_until precedes valid_from")]
    InvalidValidityWindow,
    #[error("malformed scope: {reason}")]
    MalformedScope { reason: String },

    // Not-found errors
    #[error("role not found: {role_id}")]
    RoleNotFound { role_id: String },
    #[error("assignment not found: {assignment_id}")]
    AssignmentNotFound { assignment_id: Uuid },

    // Conflict errors
    #[error("user {user_id} already holds an active assignment of role {role_id} in that scope")]
    DuplicateAssignment { user_id: String, role_id: String },

    // Resolution errors (converted to Deny decisions, never surfaced to
    // checkPermission callers)
    #[error("permission resolution timed out after {timeout_ms}ms")]
    ResolutionTimeout { timeout_ms: u64 },

    // Audit backend errors
    #[error("audit storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("serialization failed")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl AuthzError {
    /// Whether this error is a caller-input validation failure, as opposed
    /// to an internal or infrastructure fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::MaxDepthExceeded { .. }
                | Self::RoleAlreadyExists { .. }
                | Self::SystemRoleImmutable { .. }
                | Self::RoleNotEditable { .. }
                | Self::InvalidStatusTransition { .. }
                | Self::ArchivedRole { .. }
                | Self::InvalidValidityWindow
                | Self::MalformedScope { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_classification() {
        let err = AuthzError::CycleDetected {
            role_id: "a".into(),
            parent_id: "b".into(),
        };
        assert!(err.is_validation());

        let err = AuthzError::StorageUnavailable {
            reason: "backend down".into(),
        };
        assert!(!err.is_validation());
    }

    #[test]
    fn error_messages_carry_context() {
        let err = AuthzError::MaxDepthExceeded { depth: 12, max: 10 };
        assert!(err.to_string().contains("12"));
        assert!(err.to_string().contains("10"));
    }
}
