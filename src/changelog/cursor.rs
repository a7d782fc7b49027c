//! Forward cursor over one change log.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::OwnedRwLockReadGuard;

use crate::changelog::replica_log::{decode_update, successor};
use crate::changelog::store::ChangelogStore;
use crate::proto::{ChangeNumber, UpdateMsg};
use crate::utils::ChorusError;

/// Number of records fetched from the store per refill.
const CURSOR_BATCH: usize = 128;

/// Forward cursor yielding the real records of a change log in change
/// number order. Holds the log open (a shared guard) until `close()` is
/// called or the cursor is dropped.
pub struct ChangelogCursor {
    store: Arc<dyn ChangelogStore>,
    next_key: Vec<u8>,
    fetched: VecDeque<Arc<UpdateMsg>>,
    guard: Option<OwnedRwLockReadGuard<()>>,
}

impl ChangelogCursor {
    pub(crate) fn new(
        store: Arc<dyn ChangelogStore>,
        from_key: Vec<u8>,
        guard: OwnedRwLockReadGuard<()>,
    ) -> Self {
        ChangelogCursor {
            store,
            next_key: from_key,
            fetched: VecDeque::new(),
            guard: Some(guard),
        }
    }

    /// Next record, or `None` once the end of the log is reached or the
    /// cursor was closed. Records written after reaching the end are picked
    /// up by later calls.
    pub async fn next(&mut self) -> Result<Option<Arc<UpdateMsg>>, ChorusError> {
        if self.guard.is_none() {
            return Ok(None);
        }
        if self.fetched.is_empty() {
            self.refill().await?;
        }
        Ok(self.fetched.pop_front())
    }

    /// Change number of the record `next()` would return, fetching if
    /// needed.
    pub async fn peek_cn(&mut self) -> Result<Option<ChangeNumber>, ChorusError> {
        if self.guard.is_none() {
            return Ok(None);
        }
        if self.fetched.is_empty() {
            self.refill().await?;
        }
        Ok(self.fetched.front().map(|msg| msg.cn))
    }

    async fn refill(&mut self) -> Result<(), ChorusError> {
        loop {
            let batch = self
                .store
                .read_forward(&self.next_key, CURSOR_BATCH)
                .await
                .map_err(ChorusError::into_storage)?;
            let last_key = match batch.last() {
                Some((key, _)) => key.clone(),
                None => return Ok(()),
            };
            for (key, value) in batch.iter() {
                if ChangeNumber::from_key(key)?.is_counter() {
                    continue;
                }
                self.fetched.push_back(Arc::new(decode_update(value)?));
            }
            self.next_key = successor(&last_key);
            if !self.fetched.is_empty() {
                return Ok(());
            }
        }
    }

    /// Releases the cursor's hold on the log.
    pub fn close(&mut self) {
        self.guard = None;
        self.fetched.clear();
    }
}
