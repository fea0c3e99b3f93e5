//! Hub Errors
//!
//! Failures surfaced by [`crate::hub::ChatHub`] operations.

use thiserror::Error;

use crate::backend::BackendError;
use crate::delivery::DeliveryError;
use crate::store::StoreError;

/// Errors from hub operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The completion backend failed or produced a malformed stream
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The conversation store could not take the write
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The backend kept requesting tool calls past the configured cap
    #[error("Tool-call loop exceeded {limit} rounds")]
    ToolLoopExceeded {
        /// Configured round cap
        limit: u32,
    },

    /// The client connection closed mid-call
    #[error("Call cancelled: client disconnected")]
    Cancelled,
}

impl HubError {
    /// Whether the failure came from the backend
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Whether the call stopped because the client went away
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<DeliveryError> for HubError {
    fn from(_: DeliveryError) -> Self {
        Self::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ConnectionId;

    #[test]
    fn test_delivery_failure_is_cancellation() {
        let err: HubError = DeliveryError::Disconnected(ConnectionId::from_raw("c")).into();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            HubError::ToolLoopExceeded { limit: 8 }.to_string(),
            "Tool-call loop exceeded 8 rounds"
        );
        let err: HubError = BackendError::Malformed("no finish".to_string()).into();
        assert!(err.is_backend());
        assert_eq!(err.to_string(), "Malformed backend stream: no finish");
    }
}
