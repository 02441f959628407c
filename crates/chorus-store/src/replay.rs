use std::sync::Arc;

use async_stream::try_stream;
use chorus_core::{Message, Sequence};
use futures::Stream;

use crate::error::StoreError;
use crate::log::LogStore;

/// Lazily stream every message with `sequence > after`, ascending.
///
/// Pages of `page_size` rows are read on the blocking pool. The stream keeps
/// paging until it reads a short page, so messages committed while it runs
/// are included. Each call starts a fresh scan.
pub fn read_after(
    store: Arc<dyn LogStore>,
    after: Sequence,
    page_size: u32,
) -> impl Stream<Item = Result<Message, StoreError>> + Send + 'static {
    let page_size = page_size.max(1);
    try_stream! {
        let mut cursor = after;
        loop {
            let store = store.clone();
            let page = tokio::task::spawn_blocking(move || store.read_page_after(cursor, page_size))
                .await
                .map_err(|e| StoreError::Database(format!("replay task: {e}")))?;
            let page = page?;
            let short = page.len() < page_size as usize;
            for message in page {
                cursor = message.sequence;
                yield message;
            }
            if short {
                break;
            }
        }
    }
}
