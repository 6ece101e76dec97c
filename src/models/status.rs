//! Order Status Vocabulary
//!
//! The upstream reports order lifecycle states in its own vocabulary; audit
//! rows and API responses use a smaller internal one. The mapping lives here
//! so it is applied identically everywhere.

use serde::{Deserialize, Serialize};

/// Order status as reported by the upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamOrderStatus {
    /// In transit to the exchange.
    PendingSubmit,
    /// Queued for a future session.
    PreSubmitted,
    /// Accepted by the exchange.
    Submitted,
    /// Partially filled.
    PartFilled,
    /// Completely filled.
    Filled,
    /// Cancelled.
    Cancelled,
    /// Rejected by the exchange.
    Failed,
    /// Expired or otherwise deactivated.
    Inactive,
}

impl UpstreamOrderStatus {
    /// Map to the internal status vocabulary.
    #[must_use]
    pub const fn internal(self) -> InternalOrderStatus {
        match self {
            Self::PendingSubmit | Self::PreSubmitted | Self::Submitted => {
                InternalOrderStatus::Submitted
            }
            Self::PartFilled => InternalOrderStatus::PartialFilled,
            Self::Filled => InternalOrderStatus::Filled,
            Self::Cancelled | Self::Inactive => InternalOrderStatus::Cancelled,
            Self::Failed => InternalOrderStatus::Failed,
        }
    }

    /// Whether the upstream will never change this status again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Inactive | Self::Failed
        )
    }

    /// Upstream wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingSubmit => "PendingSubmit",
            Self::PreSubmitted => "PreSubmitted",
            Self::Submitted => "Submitted",
            Self::PartFilled => "PartFilled",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
            Self::Inactive => "Inactive",
        }
    }
}

/// Order status recorded on audit rows and returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalOrderStatus {
    /// Accepted for execution, fills pending.
    Submitted,
    /// Some quantity filled.
    PartialFilled,
    /// Fully filled.
    Filled,
    /// Cancelled or expired.
    Cancelled,
    /// Rejected or errored.
    Failed,
}

impl InternalOrderStatus {
    /// Whether no further transitions are expected.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Failed)
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::PartialFilled => "partial_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InternalOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_states_map_to_submitted() {
        assert_eq!(
            UpstreamOrderStatus::PendingSubmit.internal(),
            InternalOrderStatus::Submitted
        );
        assert_eq!(
            UpstreamOrderStatus::PreSubmitted.internal(),
            InternalOrderStatus::Submitted
        );
        assert_eq!(
            UpstreamOrderStatus::Submitted.internal(),
            InternalOrderStatus::Submitted
        );
    }

    #[test]
    fn inactive_maps_to_cancelled() {
        assert_eq!(
            UpstreamOrderStatus::Inactive.internal(),
            InternalOrderStatus::Cancelled
        );
    }

    #[test]
    fn terminal_sets_agree() {
        for status in [
            UpstreamOrderStatus::Filled,
            UpstreamOrderStatus::Cancelled,
            UpstreamOrderStatus::Inactive,
            UpstreamOrderStatus::Failed,
        ] {
            assert!(status.is_terminal());
            assert!(status.internal().is_terminal());
        }
        assert!(!UpstreamOrderStatus::PartFilled.is_terminal());
        assert!(!InternalOrderStatus::PartialFilled.is_terminal());
    }

    #[test]
    fn internal_wire_names() {
        assert_eq!(
            InternalOrderStatus::PartialFilled.as_str(),
            "partial_filled"
        );
        let json = serde_json::to_value(InternalOrderStatus::PartialFilled).unwrap();
        assert_eq!(json, "partial_filled");
    }
}
