use chorus_core::{DedupScope, Message, Sequence, Submission};
use chrono::Utc;
use tracing::{debug, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Append-only, totally ordered message log.
///
/// Implementations are blocking; async callers wrap calls in
/// `tokio::task::spawn_blocking`.
pub trait LogStore: Send + Sync {
    /// Commit a submission and assign it the next sequence.
    ///
    /// Returns [`StoreError::Duplicate`] when the submission's dedup key under
    /// `scope` is already committed. A submission without a token never
    /// collides.
    fn append(&self, submission: &Submission, scope: DedupScope) -> Result<Message, StoreError>;

    /// Up to `limit` messages with `sequence > after`, ascending.
    fn read_page_after(&self, after: Sequence, limit: u32) -> Result<Vec<Message>, StoreError>;

    /// Highest committed sequence, or `Sequence::ZERO` when empty.
    fn head(&self) -> Result<Sequence, StoreError>;
}

/// [`LogStore`] backed by the `messages` table.
#[derive(Clone)]
pub struct SqliteLog {
    db: Database,
}

impl SqliteLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

const TABLE: &str = "messages";

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let committed_at: String = row_helpers::get(row, 4, TABLE, "committed_at")?;
    Ok(Message {
        sequence: Sequence(row_helpers::get(row, 0, TABLE, "sequence")?),
        content: row_helpers::get(row, 1, TABLE, "content")?,
        dedup_token: row_helpers::get_opt(row, 2, TABLE, "dedup_token")?,
        sender_label: row_helpers::get_opt(row, 3, TABLE, "sender_label")?,
        committed_at: row_helpers::parse_timestamp(&committed_at, TABLE, "committed_at")?,
    })
}

impl LogStore for SqliteLog {
    #[instrument(skip(self, submission), fields(has_token = submission.token().is_some()))]
    fn append(&self, submission: &Submission, scope: DedupScope) -> Result<Message, StoreError> {
        let dedup_key = scope.key(submission);
        let dedup_token = submission.token().map(str::to_owned);
        let committed_at = Utc::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (dedup_key, dedup_token, content, sender_label, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    dedup_key,
                    dedup_token,
                    submission.content,
                    submission.sender_label,
                    committed_at.to_rfc3339(),
                ],
            )
            .map_err(|e| {
                if StoreError::is_unique_violation(&e) {
                    StoreError::Duplicate(dedup_key.clone().unwrap_or_default())
                } else {
                    StoreError::from(e)
                }
            })?;

            let sequence = Sequence(conn.last_insert_rowid());
            debug!(%sequence, "message committed");

            Ok(Message {
                sequence,
                content: submission.content.clone(),
                dedup_token,
                sender_label: submission.sender_label.clone(),
                committed_at,
            })
        })
    }

    #[instrument(skip(self))]
    fn read_page_after(&self, after: Sequence, limit: u32) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT sequence, content, dedup_token, sender_label, committed_at
                 FROM messages WHERE sequence > ?1 ORDER BY sequence ASC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![after.value(), limit])?;
            let mut page = Vec::new();
            while let Some(row) = rows.next()? {
                page.push(row_to_message(row)?);
            }
            Ok(page)
        })
    }

    fn head(&self) -> Result<Sequence, StoreError> {
        self.db.with_conn(|conn| {
            let max: i64 =
                conn.query_row("SELECT COALESCE(MAX(sequence), 0) FROM messages", [], |row| {
                    row.get(0)
                })?;
            Ok(Sequence(max))
        })
    }
}
