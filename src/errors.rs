use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Reason reported alongside an [`Error::AdjustmentRejected`].
///
/// The reason string is part of the protocol with the optimizer service and
/// must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    SchedulingFailed,
    Unstable,
    Timeout,
    ProgressionFailure,
    ReplicaFailure,
    UnreadyDuringSettlement,
    /// A cluster condition type passed through verbatim (e.g. "Degraded").
    Other(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::SchedulingFailed => write!(f, "scheduling-failed"),
            RejectionReason::Unstable => write!(f, "unstable"),
            RejectionReason::Timeout => write!(f, "timeout"),
            RejectionReason::ProgressionFailure => write!(f, "ProgressionFailure"),
            RejectionReason::ReplicaFailure => write!(f, "ReplicaFailure"),
            RejectionReason::UnreadyDuringSettlement => write!(f, "unready_during_settlement"),
            RejectionReason::Other(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// User input is malformed. Fatal.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The cluster refused an adjustment or could not converge on it.
    /// Recoverable according to the configured failure mode.
    #[error("adjustment rejected ({reason}): {message}")]
    AdjustmentRejected {
        reason: RejectionReason,
        message: String,
    },

    /// An internal invariant was broken. Fatal.
    #[error("adjustment failure: {0}")]
    AdjustmentFailure(String),

    /// Operation not available on this controller variant. Fatal.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A wait exceeded its deadline.
    #[error("timed out after {timeout:?} waiting for {condition}")]
    Timeout { condition: String, timeout: Duration },

    /// A controller is in a state the agent cannot reason about
    /// (e.g. no owning replica set could be located).
    #[error("controller error: {0}")]
    Controller(String),

    #[error("canary pod creation failed: {0}")]
    CanaryCreation(String),

    /// Underlying Kubernetes client error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),
}

impl Error {
    pub fn rejected(reason: RejectionReason, message: impl Into<String>) -> Self {
        Error::AdjustmentRejected {
            reason,
            message: message.into(),
        }
    }

    /// Whether this error is a 404 from the cluster API. A missing resource
    /// during refresh or delete is frequently an expected outcome rather
    /// than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeApi(kube::Error::Api(ae)) if ae.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reasons_render_protocol_strings() {
        assert_eq!(RejectionReason::SchedulingFailed.to_string(), "scheduling-failed");
        assert_eq!(RejectionReason::Unstable.to_string(), "unstable");
        assert_eq!(RejectionReason::Timeout.to_string(), "timeout");
        assert_eq!(RejectionReason::ProgressionFailure.to_string(), "ProgressionFailure");
        assert_eq!(RejectionReason::ReplicaFailure.to_string(), "ReplicaFailure");
        assert_eq!(
            RejectionReason::UnreadyDuringSettlement.to_string(),
            "unready_during_settlement"
        );
        assert_eq!(RejectionReason::Other("Degraded".into()).to_string(), "Degraded");
    }

    #[test]
    fn not_found_detection() {
        let err = Error::KubeApi(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "pods \"web-canary\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));
        assert!(err.is_not_found());

        let err = Error::Configuration("no kubeconfig".into());
        assert!(!err.is_not_found());
    }
}
