use crate::progress::DecryptionStatusView;
use crate::storage::types::JobId;

use serde::Serialize;

/// Answer to `initiateDecryption`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecryptionDecision {
    /// A new run was scheduled (first submission, or a retry after failure).
    Accepted {
        run_id: JobId,
        status: DecryptionStatusView,
    },
    /// A run is already in flight; the caller observes it instead of starting another.
    Attached { status: DecryptionStatusView },
    Rejected { reason: String },
}

impl DecryptionDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DecryptionDecision::Accepted { .. })
    }
}
