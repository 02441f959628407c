/// Failure taxonomy of the delivery-and-recovery pipeline.
///
/// Only `TransientStorageFault` is a real failure from the client's point of
/// view; the other two resolve without client action.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The dedup token was already committed. Resolved as success.
    #[error("duplicate submission")]
    DuplicateSubmission,

    /// Ingestion or recovery read failed for a reason unrelated to uniqueness.
    #[error("transient storage fault: {0}")]
    TransientStorageFault(String),

    /// Cross-instance fan-out could not reach other instances.
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),
}

impl DeliveryError {
    /// Whether the client should retry (submission) or reconnect (recovery).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorageFault(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::DuplicateSubmission => "duplicate_submission",
            Self::TransientStorageFault(_) => "transient_storage_fault",
            Self::RelayUnavailable(_) => "relay_unavailable",
        }
    }
}
