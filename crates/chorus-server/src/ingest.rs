//! Idempotent ingestion: persist a submission once per dedup key.

use std::sync::Arc;
use std::time::Instant;

use chorus_core::{DedupScope, DeliveryError, Message, Submission};
use chorus_store::{LogStore, StoreError};
use chorus_telemetry::names;
use metrics::{counter, histogram};
use tracing::{debug, instrument, warn};

/// Result of one ingestion attempt.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Newly committed. The caller broadcasts it.
    Accepted(Message),
    /// The dedup key was already committed. Acknowledge, never re-broadcast.
    Duplicate,
    /// Not committed; the client retries with the same token.
    Rejected(DeliveryError),
}

pub struct IngestionGate {
    store: Arc<dyn LogStore>,
    scope: DedupScope,
}

impl IngestionGate {
    pub fn new(store: Arc<dyn LogStore>, scope: DedupScope) -> Self {
        Self { store, scope }
    }

    #[instrument(skip_all, fields(has_token = submission.token().is_some()))]
    pub async fn ingest(&self, submission: Submission) -> IngestOutcome {
        let start = Instant::now();
        let store = Arc::clone(&self.store);
        let scope = self.scope;
        let result = tokio::task::spawn_blocking(move || store.append(&submission, scope)).await;
        histogram!(names::CHAT_INGEST_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(message)) => {
                counter!(names::CHAT_ACCEPTED_TOTAL).increment(1);
                debug!(sequence = %message.sequence, "submission accepted");
                IngestOutcome::Accepted(message)
            }
            Ok(Err(StoreError::Duplicate(_))) => {
                counter!(names::CHAT_DUPLICATE_TOTAL).increment(1);
                debug!("duplicate submission");
                IngestOutcome::Duplicate
            }
            Ok(Err(e)) => {
                counter!(names::CHAT_INGEST_FAILURES_TOTAL).increment(1);
                warn!(error = %e, "ingest failed");
                IngestOutcome::Rejected(DeliveryError::TransientStorageFault(e.to_string()))
            }
            Err(e) => {
                counter!(names::CHAT_INGEST_FAILURES_TOTAL).increment(1);
                warn!(error = %e, "ingest task failed");
                IngestOutcome::Rejected(DeliveryError::TransientStorageFault(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use chorus_core::Sequence;
    use chorus_store::{Database, SqliteLog};
    use mockall::mock;

    use super::*;

    mock! {
        pub Store {}
        impl LogStore for Store {
            fn append(&self, submission: &Submission, scope: DedupScope) -> Result<Message, StoreError>;
            fn read_page_after(&self, after: Sequence, limit: u32) -> Result<Vec<Message>, StoreError>;
            fn head(&self) -> Result<Sequence, StoreError>;
        }
    }

    fn gate() -> IngestionGate {
        let store = SqliteLog::new(Database::in_memory().unwrap());
        IngestionGate::new(Arc::new(store), DedupScope::Global)
    }

    #[tokio::test]
    async fn distinct_tokens_accepted_in_order() {
        let gate = gate();
        let a = gate.ingest(Submission::new("a").with_token("t1")).await;
        let b = gate.ingest(Submission::new("b").with_token("t2")).await;
        assert_matches!(a, IngestOutcome::Accepted(m) if m.sequence == Sequence(1));
        assert_matches!(b, IngestOutcome::Accepted(m) if m.sequence == Sequence(2));
    }

    #[tokio::test]
    async fn repeated_token_is_duplicate() {
        let gate = gate();
        assert_matches!(
            gate.ingest(Submission::new("hello").with_token("tok-1")).await,
            IngestOutcome::Accepted(_)
        );
        assert_matches!(
            gate.ingest(Submission::new("hello").with_token("tok-1")).await,
            IngestOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn empty_token_always_accepted() {
        let gate = gate();
        for i in 1..=3 {
            let outcome = gate.ingest(Submission::new("same").with_token("")).await;
            assert_matches!(outcome, IngestOutcome::Accepted(m) if m.sequence == Sequence(i));
        }
    }

    #[tokio::test]
    async fn concurrent_same_token_accepts_once() {
        let gate = Arc::new(gate());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.ingest(Submission::new("race").with_token("tok")).await
                })
            })
            .collect();
        let mut accepted = 0;
        let mut duplicate = 0;
        for h in handles {
            match h.await.unwrap() {
                IngestOutcome::Accepted(_) => accepted += 1,
                IngestOutcome::Duplicate => duplicate += 1,
                IngestOutcome::Rejected(e) => panic!("unexpected rejection: {e}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(duplicate, 9);
    }

    #[tokio::test]
    async fn storage_fault_is_rejected_as_transient() {
        let mut store = MockStore::new();
        store
            .expect_append()
            .returning(|_, _| Err(StoreError::Database("disk I/O error".into())));
        let gate = IngestionGate::new(Arc::new(store), DedupScope::Global);

        let outcome = gate.ingest(Submission::new("x").with_token("t")).await;
        assert_matches!(
            outcome,
            IngestOutcome::Rejected(DeliveryError::TransientStorageFault(msg)) if msg.contains("disk I/O")
        );
    }

    #[tokio::test]
    async fn scope_is_passed_to_store() {
        let mut store = MockStore::new();
        store
            .expect_append()
            .withf(|sub, scope| sub.content == "x" && *scope == DedupScope::PerSender)
            .times(1)
            .returning(|sub, _| {
                Ok(Message {
                    sequence: Sequence(1),
                    content: sub.content.clone(),
                    dedup_token: None,
                    sender_label: None,
                    committed_at: chrono::Utc::now(),
                })
            });
        let gate = IngestionGate::new(Arc::new(store), DedupScope::PerSender);
        assert_matches!(gate.ingest(Submission::new("x")).await, IngestOutcome::Accepted(_));
    }
}
