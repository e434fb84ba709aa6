//! Scroll cursor lifecycle over a [`DocumentStore`].

use std::time::Duration;

use custrecon_core::{RawDocument, ScrollRequest};
use custrecon_storage::{format_keep_alive, DocumentStore, StoreError};
use tracing::{debug, warn};

/// Exclusive owner of one server-side scroll context.
///
/// The handle is refreshed after every page because the store may rotate it.
/// [`ScrollCursor::release`] consumes the cursor, so a context is released at
/// most once; dropping an unreleased cursor only logs, since the context then
/// lingers on the store until its keep-alive lapses.
pub struct ScrollCursor<'a> {
    store: &'a dyn DocumentStore,
    handle: Option<String>,
    ttl: Duration,
    released: bool,
}

impl<'a> ScrollCursor<'a> {
    /// Issue the opening query and return the cursor with the first page of documents.
    pub async fn open(
        store: &'a dyn DocumentStore,
        request: &ScrollRequest,
    ) -> Result<(Self, Vec<RawDocument>), StoreError> {
        let page = store.search(request).await?;
        let cursor = Self {
            store,
            handle: page.cursor,
            ttl: request.ttl,
            released: false,
        };
        Ok((cursor, page.documents))
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    /// Fetch the following page. An empty result marks the end of the scan.
    pub async fn next_page(&mut self) -> Result<Vec<RawDocument>, StoreError> {
        let Some(handle) = self.handle.as_deref() else {
            warn!("store issued no scroll cursor; ending scan after first page");
            return Ok(Vec::new());
        };

        let page = self.store.scroll_next(handle, self.ttl).await?;
        if let Some(rotated) = page.cursor {
            self.handle = Some(rotated);
        }
        Ok(page.documents)
    }

    /// Release the scroll context. A no-op when the store never issued a handle.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        match self.handle.take() {
            Some(handle) => {
                debug!("releasing scroll cursor");
                self.store.release_cursor(&handle).await
            }
            None => Ok(()),
        }
    }
}

impl Drop for ScrollCursor<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(handle) = &self.handle {
            warn!(
                cursor = %handle,
                keep_alive = %format_keep_alive(self.ttl),
                "scroll cursor dropped without release; context expires after keep-alive"
            );
        }
    }
}
