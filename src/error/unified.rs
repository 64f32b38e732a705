//! Unified error classification.

use serde::{Deserialize, Serialize};

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Permission,
    RateLimit,
    Server,
    Provider,
    Storage,
    Configuration,
    Serialization,
    ToolExecution,
    Canceled,
    Unknown,
}

/// HTTP statuses a provider may answer with that are worth retrying.
///
/// 529 is the "overloaded" status some providers use in addition to 503.
pub const RETRYABLE_STATUSES: [u16; 6] = [429, 500, 502, 503, 504, 529];

/// Whether a provider status code is transient.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}
