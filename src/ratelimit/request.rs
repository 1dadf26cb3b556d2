//! Rate limit request and response types.

use serde::{Deserialize, Serialize};

use crate::error::RatelimitError;

/// Consistency trade-off used when counting a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Count locally, propagate asynchronously.
    #[default]
    Fast,
    /// Count at the key's authoritative store before answering.
    Consistent,
}

/// A request to admit `cost` units for an identifier within a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatelimitRequest {
    /// Workspace the namespace belongs to
    pub workspace_id: String,
    /// Namespace name, unique within the workspace
    pub namespace: String,
    /// The entity being limited
    pub identifier: String,
    /// Limit to apply when no override exists
    pub limit: u64,
    /// Window duration in milliseconds when no override exists
    pub duration: u64,
    /// Units consumed by this request
    pub cost: u64,
    /// Requested consistency, or the configured default when absent
    pub consistency: Option<Consistency>,
}

impl RatelimitRequest {
    /// Create a request with cost 1 and the default consistency.
    pub fn new(
        workspace_id: impl Into<String>,
        namespace: impl Into<String>,
        identifier: impl Into<String>,
        limit: u64,
        duration: u64,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            namespace: namespace.into(),
            identifier: identifier.into(),
            limit,
            duration,
            cost: 1,
            consistency: None,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Check the request can be acted on.
    pub fn validate(&self) -> Result<(), RatelimitError> {
        if self.namespace.is_empty() {
            return Err(RatelimitError::InvalidRequest(
                "namespace is required".to_string(),
            ));
        }
        if self.identifier.is_empty() {
            return Err(RatelimitError::InvalidRequest(
                "identifier is required".to_string(),
            ));
        }
        if self.limit == 0 {
            return Err(RatelimitError::InvalidRequest(
                "limit must be greater than zero".to_string(),
            ));
        }
        if self.duration == 0 {
            return Err(RatelimitError::InvalidRequest(
                "duration must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Counter scope for this request's namespace.
    pub fn namespace_scope(&self) -> String {
        format!("{}:{}", self.workspace_id, self.namespace)
    }
}

/// The admission decision for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitResponse {
    /// Effective limit (the override's when one applied)
    pub limit: u64,
    /// Usage in the active window including this request
    pub current: u64,
    /// Units left in the active window
    pub remaining: u64,
    /// Epoch milliseconds at which the active window ends
    pub reset: u64,
    /// Whether the request is admitted
    pub pass: bool,
    /// Set when the decision was made without consulting counter state
    pub degraded: bool,
}

impl RatelimitResponse {
    pub fn new(limit: u64, current: u64, reset: u64, pass: bool) -> Self {
        Self {
            limit,
            current,
            remaining: limit.saturating_sub(current),
            reset,
            pass,
            degraded: false,
        }
    }
}
