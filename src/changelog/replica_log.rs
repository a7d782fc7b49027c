//! Durable change log of one replica within one suffix.
//!
//! Records are keyed by the order-preserving encoding of their change
//! number. Every `counter_window` records, a synthetic counter record keyed
//! with replica ID 0 is written right before the next real record; its value
//! is the number of real records appended before it since the log was
//! created (or last cleared). Range counts then only walk from each boundary
//! to the nearest counter record.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use get_size::GetSize;
use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::changelog::cursor::ChangelogCursor;
use crate::changelog::store::{ChangelogStore, StoreRecord};
use crate::proto::{now_millis, ChangeNumber, ServerId, UpdateMsg};
use crate::utils::{ChorusError, ShutdownSignal};

/// Approximate per-record size used to derive the byte budget of the write
/// buffer from its record budget.
const AVG_RECORD_BYTES: usize = 200;

/// Number of records fetched per store read when walking the log.
const WALK_BATCH: usize = 256;

/// Tunable parameters of a change log. Everything except `counter_window`
/// may be changed at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogParams {
    /// Record budget of the write-behind buffer.
    pub queue_size: usize,

    /// Number of records per store write.
    pub flush_chunk: usize,

    /// Real records between two counter records.
    pub counter_window: u64,

    /// Period of the background flush.
    pub flush_interval_ms: u64,

    /// Period of the background trim.
    pub trim_interval_ms: u64,

    /// Records older than this are trimmed; 0 disables trimming.
    pub purge_delay_ms: u64,
}

impl Default for LogParams {
    fn default() -> Self {
        LogParams {
            queue_size: 10000,
            flush_chunk: 500,
            counter_window: 1000,
            flush_interval_ms: 500,
            trim_interval_ms: 1000,
            purge_delay_ms: 24 * 3600 * 1000,
        }
    }
}

impl LogParams {
    #[inline]
    fn high_records(&self) -> usize {
        (self.queue_size * 4 / 5).max(1)
    }

    #[inline]
    fn low_records(&self) -> usize {
        self.queue_size / 5
    }

    #[inline]
    fn high_bytes(&self) -> usize {
        self.high_records() * AVG_RECORD_BYTES
    }

    #[inline]
    fn low_bytes(&self) -> usize {
        self.low_records() * AVG_RECORD_BYTES
    }
}

/// Records accepted but not yet written to the store.
#[derive(Debug, Default)]
struct WriteBuffer {
    queue: VecDeque<Arc<UpdateMsg>>,
    bytes: usize,
}

/// Bounds and counters of the persisted part of the log.
#[derive(Debug, Default)]
struct LogBounds {
    /// Oldest real record, persisted or buffered.
    first: Option<ChangeNumber>,

    /// Newest real record, persisted or buffered.
    last: Option<ChangeNumber>,

    /// Newest persisted real record.
    flushed_last: Option<ChangeNumber>,

    /// Number of real records persisted since creation or last clear.
    total: u64,
}

/// Change log of one (suffix, replica).
pub struct ChangelogLog {
    base_dn: String,
    replica_id: ServerId,
    store: Arc<dyn ChangelogStore>,
    params: RwLock<LogParams>,

    buffer: Mutex<WriteBuffer>,
    bounds: Mutex<LogBounds>,

    /// Serializes flushes, trims and clears.
    flush_lock: AsyncMutex<()>,

    /// Wakes the flusher.
    flush_notify: Notify,

    /// Wakes appenders waiting for the buffer to drain.
    drained_notify: Notify,

    /// Open cursors hold it shared; clear and shutdown take it exclusively.
    db_lock: Arc<AsyncRwLock<()>>,

    closed: AtomicBool,
    shutdown: ShutdownSignal,
    flusher_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChangelogLog {
    /// Opens the log over `store`, recovering its bounds from existing
    /// records, and spawns its background flusher.
    pub async fn new_and_setup(
        base_dn: &str,
        replica_id: ServerId,
        store: Arc<dyn ChangelogStore>,
        params: LogParams,
        shutdown: ShutdownSignal,
    ) -> Result<Arc<Self>, ChorusError> {
        let bounds = Self::recover_bounds(store.as_ref())
            .await
            .map_err(ChorusError::into_storage)?;
        pf_debug!(
            "opened changelog {}/{}: first {:?} last {:?} total {}",
            base_dn,
            replica_id,
            bounds.first,
            bounds.last,
            bounds.total
        );

        let log = Arc::new(ChangelogLog {
            base_dn: base_dn.to_string(),
            replica_id,
            store,
            params: RwLock::new(params),
            buffer: Mutex::new(WriteBuffer::default()),
            bounds: Mutex::new(bounds),
            flush_lock: AsyncMutex::new(()),
            flush_notify: Notify::new(),
            drained_notify: Notify::new(),
            db_lock: Arc::new(AsyncRwLock::new(())),
            closed: AtomicBool::new(false),
            shutdown,
            flusher_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::flusher_thread(log.clone()));
        if let Ok(mut slot) = log.flusher_handle.lock() {
            *slot = Some(handle);
        }
        Ok(log)
    }

    /// Scans both ends of the store for the first/last real records and the
    /// running total.
    async fn recover_bounds(
        store: &dyn ChangelogStore,
    ) -> Result<LogBounds, ChorusError> {
        let mut bounds = LogBounds::default();

        // first real record
        let mut from: Vec<u8> = vec![];
        'fwd: loop {
            let batch = store.read_forward(&from, WALK_BATCH).await?;
            for (key, _) in batch.iter() {
                let cn = ChangeNumber::from_key(key)?;
                if !cn.is_counter() {
                    bounds.first = Some(cn);
                    break 'fwd;
                }
            }
            match batch.last() {
                Some((key, _)) => from = successor(key),
                None => break,
            }
        }
        if bounds.first.is_none() {
            return Ok(bounds);
        }

        // last real record, and distance back to the nearest counter
        let mut reals = 0;
        let mut upper: Option<Vec<u8>> = None;
        'bwd: loop {
            let batch = store
                .read_backward(upper.as_deref(), WALK_BATCH + 1)
                .await?;
            let mut progressed = false;
            for (key, value) in batch.iter() {
                if upper.as_deref() == Some(key.as_slice()) {
                    continue;
                }
                progressed = true;
                let cn = ChangeNumber::from_key(key)?;
                if cn.is_counter() {
                    bounds.total = decode_counter(value)? + reals;
                    break 'bwd;
                }
                if bounds.last.is_none() {
                    bounds.last = Some(cn);
                }
                reals += 1;
            }
            if !progressed {
                bounds.total = reals;
                break;
            }
            upper = batch.last().map(|(key, _)| key.clone());
        }
        bounds.flushed_last = bounds.last;
        Ok(bounds)
    }

    #[inline]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    #[inline]
    pub fn replica_id(&self) -> ServerId {
        self.replica_id
    }

    fn params(&self) -> LogParams {
        self.params
            .read()
            .map(|params| params.clone())
            .unwrap_or_default()
    }

    /// Applies new runtime parameters. The counter window is fixed at
    /// creation and is kept.
    pub fn set_params(&self, mut params: LogParams) {
        if let Ok(mut slot) = self.params.write() {
            params.counter_window = slot.counter_window;
            *slot = params;
        }
        // new water marks may unblock appenders
        self.flush_notify.notify_one();
        self.drained_notify.notify_waiters();
    }

    fn check_open(&self) -> Result<(), ChorusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChorusError::storage(format!(
                "changelog {}/{} is closed",
                self.base_dn, self.replica_id
            )))
        } else {
            Ok(())
        }
    }

    fn lock_buffer(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, WriteBuffer>, ChorusError> {
        self.buffer
            .lock()
            .map_err(|_| ChorusError::storage("changelog buffer poisoned"))
    }

    fn lock_bounds(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, LogBounds>, ChorusError> {
        self.bounds
            .lock()
            .map_err(|_| ChorusError::storage("changelog bounds poisoned"))
    }

    /// Queues `msg` for persistence. Waits while the write buffer is above
    /// its high-water mark until the flusher drains it below the low-water
    /// mark. Returns `Ok(false)` if the change is not newer than the last
    /// one logged for this replica and was therefore skipped.
    pub async fn append(
        &self,
        msg: Arc<UpdateMsg>,
    ) -> Result<bool, ChorusError> {
        loop {
            self.check_open()?;
            let drained = self.drained_notify.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            {
                let params = self.params();
                let mut buffer = self.lock_buffer()?;
                if buffer.queue.len() < params.high_records()
                    && buffer.bytes < params.high_bytes()
                {
                    let mut bounds = self.lock_bounds()?;
                    if bounds.last.is_some_and(|last| msg.cn <= last) {
                        pf_debug!(
                            "changelog {}/{} skipping stale {}",
                            self.base_dn,
                            self.replica_id,
                            msg.cn
                        );
                        return Ok(false);
                    }
                    if bounds.first.is_none() {
                        bounds.first = Some(msg.cn);
                    }
                    bounds.last = Some(msg.cn);
                    buffer.bytes += msg.get_size();
                    buffer.queue.push_back(msg);
                    if buffer.queue.len() >= params.flush_chunk {
                        self.flush_notify.notify_one();
                    }
                    return Ok(true);
                }
            }

            // above high-water mark: wait for the flusher
            self.flush_notify.notify_one();
            drained.await;
        }
    }

    /// Persists every buffered record, chunk by chunk. A chunk leaves the
    /// buffer only once written, so a failed flush can be retried.
    pub async fn flush(&self) -> Result<(), ChorusError> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> Result<(), ChorusError> {
        loop {
            let params = self.params();
            let chunk: Vec<Arc<UpdateMsg>> = {
                let buffer = self.lock_buffer()?;
                buffer
                    .queue
                    .iter()
                    .take(params.flush_chunk.max(1))
                    .cloned()
                    .collect()
            };
            if chunk.is_empty() {
                self.drained_notify.notify_waiters();
                return Ok(());
            }

            let mut total = self.lock_bounds()?.total;
            let mut records: Vec<StoreRecord> = Vec::with_capacity(chunk.len());
            for msg in chunk.iter() {
                if total > 0 && total % params.counter_window.max(1) == 0 {
                    records.push((
                        msg.cn.counter_sibling().to_key().to_vec(),
                        total.to_be_bytes().to_vec(),
                    ));
                }
                let value = encode_to_vec(msg.as_ref())
                    .map_err(|e| ChorusError::storage(e.to_string()))?;
                records.push((msg.cn.to_key().to_vec(), value));
                total += 1;
            }
            self.store
                .append_batch(records)
                .await
                .map_err(ChorusError::into_storage)?;

            // chunk is durable now, commit
            let below_low = {
                let mut buffer = self.lock_buffer()?;
                for _ in 0..chunk.len() {
                    if let Some(front) = buffer.queue.pop_front() {
                        buffer.bytes =
                            buffer.bytes.saturating_sub(front.get_size());
                    }
                }
                buffer.queue.len() <= params.low_records()
                    && buffer.bytes <= params.low_bytes()
            };
            {
                let mut bounds = self.lock_bounds()?;
                bounds.total = total;
                bounds.flushed_last = chunk.last().map(|msg| msg.cn);
            }

            if below_low {
                self.drained_notify.notify_waiters();
            }
        }
    }

    /// Flushes first if any buffered record satisfies `pred`.
    async fn flush_if_buffered(
        &self,
        pred: impl Fn(&ChangeNumber) -> bool,
    ) -> Result<(), ChorusError> {
        let needed = {
            let buffer = self.lock_buffer()?;
            buffer.queue.iter().any(|msg| pred(&msg.cn))
        };
        if needed {
            self.flush().await?;
        }
        Ok(())
    }

    /// Deletes persisted records older than `max_age_ms`, but never the
    /// newest persisted record.
    pub async fn trim(&self, max_age_ms: u64) -> Result<u64, ChorusError> {
        let cutoff = now_millis().saturating_sub(max_age_ms as i64);
        self.trim_before(cutoff).await
    }

    /// Deletes persisted records with timestamp < `cutoff`, keeping the
    /// newest persisted record and the counter record right before any
    /// kept record. Returns the number of store records deleted.
    pub async fn trim_before(&self, cutoff: i64) -> Result<u64, ChorusError> {
        let _guard = self.flush_lock.lock().await;
        self.check_open()?;
        let protected = match self.lock_bounds()?.flushed_last {
            Some(cn) => cn,
            None => return Ok(0),
        };

        let mut stop: Option<Vec<u8>> = None;
        let mut pending_counter: Option<Vec<u8>> = None;
        let mut from: Vec<u8> = vec![];
        'scan: loop {
            let batch = self.store.read_forward(&from, WALK_BATCH).await?;
            for (key, _) in batch.iter() {
                let cn = ChangeNumber::from_key(key)?;
                if cn.is_counter() {
                    pending_counter = Some(key.clone());
                    continue;
                }
                if cn.timestamp >= cutoff || cn == protected {
                    stop = Some(pending_counter.take().unwrap_or(key.clone()));
                    break 'scan;
                }
                pending_counter = None;
            }
            match batch.last() {
                Some((key, _)) => from = successor(key),
                None => break,
            }
        }

        let stop = match stop {
            Some(stop) => stop,
            None => return Ok(0),
        };
        let deleted = self
            .store
            .delete_range(&[], &stop)
            .await
            .map_err(ChorusError::into_storage)?;

        if deleted > 0 {
            let first = self.first_persisted().await?;
            let mut bounds = self.lock_bounds()?;
            bounds.first = first.or(bounds.first);
            pf_debug!(
                "trimmed {} records of changelog {}/{}",
                deleted,
                self.base_dn,
                self.replica_id
            );
        }
        Ok(deleted)
    }

    async fn first_persisted(
        &self,
    ) -> Result<Option<ChangeNumber>, ChorusError> {
        let mut from: Vec<u8> = vec![];
        loop {
            let batch = self.store.read_forward(&from, WALK_BATCH).await?;
            for (key, _) in batch.iter() {
                let cn = ChangeNumber::from_key(key)?;
                if !cn.is_counter() {
                    return Ok(Some(cn));
                }
            }
            match batch.last() {
                Some((key, _)) => from = successor(key),
                None => return Ok(None),
            }
        }
    }

    /// Opens a forward cursor positioned at the first record at-or-after
    /// `from`. Buffered records at-or-after `from` are flushed first. The
    /// cursor holds the log open until closed or dropped.
    pub async fn open_cursor(
        &self,
        from: ChangeNumber,
    ) -> Result<ChangelogCursor, ChorusError> {
        self.check_open()?;
        self.flush_if_buffered(|cn| *cn >= from).await?;
        self.cursor_at(from.to_key().to_vec()).await
    }

    /// Cursor positioned right after `after`, or at the start of the log if
    /// `None`.
    pub async fn open_cursor_after(
        &self,
        after: Option<ChangeNumber>,
    ) -> Result<ChangelogCursor, ChorusError> {
        self.check_open()?;
        match after {
            Some(after) => {
                self.flush_if_buffered(|cn| *cn > after).await?;
                self.cursor_at(successor(&after.to_key())).await
            }
            None => {
                self.flush().await?;
                self.cursor_at(vec![]).await
            }
        }
    }

    async fn cursor_at(
        &self,
        from_key: Vec<u8>,
    ) -> Result<ChangelogCursor, ChorusError> {
        let guard = self.db_lock.clone().read_owned().await;
        self.check_open()?;
        Ok(ChangelogCursor::new(self.store.clone(), from_key, guard))
    }

    /// Number of real records with change number in `[from, to]`.
    pub async fn count(
        &self,
        from: ChangeNumber,
        to: ChangeNumber,
    ) -> Result<u64, ChorusError> {
        if from > to {
            return Ok(0);
        }
        self.check_open()?;
        self.flush_if_buffered(|cn| *cn <= to).await?;
        let to_key = to.to_key();

        // walk forward from `from` to the first counter record
        let mut fwd_reals = 0;
        let mut fwd_counter: Option<u64> = None;
        let mut cursor: Vec<u8> = from.to_key().to_vec();
        'fwd: loop {
            let batch = self.store.read_forward(&cursor, WALK_BATCH).await?;
            for (key, value) in batch.iter() {
                if key.as_slice() > to_key.as_slice() {
                    return Ok(fwd_reals);
                }
                if ChangeNumber::from_key(key)?.is_counter() {
                    fwd_counter = Some(decode_counter(value)?);
                    break 'fwd;
                }
                fwd_reals += 1;
            }
            match batch.last() {
                Some((key, _)) => cursor = successor(key),
                None => break,
            }
        }
        let fwd_counter = match fwd_counter {
            Some(value) => value,
            None => return Ok(fwd_reals),
        };

        // walk backward from `to` to the last counter record
        let mut bwd_reals = 0;
        let mut bwd_counter: Option<u64> = None;
        let mut upper: Vec<u8> = to_key.to_vec();
        let mut skip_upper = false;
        'bwd: loop {
            let batch = self
                .store
                .read_backward(Some(&upper), WALK_BATCH + 1)
                .await?;
            let mut progressed = false;
            for (key, value) in batch.iter() {
                if skip_upper && *key == upper {
                    continue;
                }
                progressed = true;
                if ChangeNumber::from_key(key)?.is_counter() {
                    bwd_counter = Some(decode_counter(value)?);
                    break 'bwd;
                }
                bwd_reals += 1;
            }
            if !progressed {
                break;
            }
            if let Some((key, _)) = batch.last() {
                upper = key.clone();
                skip_upper = true;
            }
        }
        let bwd_counter = match bwd_counter {
            Some(value) => value,
            None => {
                return Err(ChorusError::storage(format!(
                    "changelog {}/{} lost a counter record",
                    self.base_dn, self.replica_id
                )))
            }
        };

        Ok(fwd_reals + bwd_counter.saturating_sub(fwd_counter) + bwd_reals)
    }

    /// Number of real records currently in the log.
    pub async fn changes_count(&self) -> Result<u64, ChorusError> {
        match (self.first_change(), self.last_change()) {
            (Some(first), Some(last)) => self.count(first, last).await,
            _ => Ok(0),
        }
    }

    pub fn first_change(&self) -> Option<ChangeNumber> {
        self.bounds.lock().ok().and_then(|bounds| bounds.first)
    }

    pub fn last_change(&self) -> Option<ChangeNumber> {
        self.bounds.lock().ok().and_then(|bounds| bounds.last)
    }

    /// Number of records waiting in the write buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.queue.len()).unwrap_or(0)
    }

    /// Drops every record, buffered or persisted. Waits for open cursors.
    pub async fn clear(&self) -> Result<(), ChorusError> {
        let _db_guard = self.db_lock.write().await;
        let _guard = self.flush_lock.lock().await;
        {
            let mut buffer = self.lock_buffer()?;
            buffer.queue.clear();
            buffer.bytes = 0;
        }
        self.store.clear().await.map_err(ChorusError::into_storage)?;
        *self.lock_bounds()? = LogBounds::default();
        self.drained_notify.notify_waiters();
        pf_info!("cleared changelog {}/{}", self.base_dn, self.replica_id);
        Ok(())
    }

    /// Flushes what is buffered, waits for open cursors, closes the store
    /// and stops the flusher. Idempotent.
    pub async fn shutdown(&self) -> Result<(), ChorusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let flushed = self.flush().await;
        self.closed.store(true, Ordering::Release);
        self.flush_notify.notify_one();
        self.drained_notify.notify_waiters();

        let _db_guard = self.db_lock.write().await;
        let closed = self.store.close().await;
        let handle = self.flusher_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if time::timeout(Duration::from_secs(2), handle).await.is_err() {
                pf_warn!(
                    "changelog {}/{} flusher did not stop in time",
                    self.base_dn,
                    self.replica_id
                );
            }
        }
        flushed?;
        closed.map_err(ChorusError::into_storage)
    }

    /// Marks the log broken and raises the server-wide shutdown.
    fn fail(&self, e: &ChorusError) {
        pf_error!(
            "fatal error on changelog {}/{}: {}",
            self.base_dn,
            self.replica_id,
            e
        );
        self.closed.store(true, Ordering::Release);
        self.drained_notify.notify_waiters();
        self.shutdown.trigger(format!(
            "changelog {}/{} failed: {}",
            self.base_dn, self.replica_id, e
        ));
    }

    /// Background flusher: flushes when woken or periodically, trims
    /// periodically using the current purge delay.
    async fn flusher_thread(log: Arc<Self>) {
        pf_debug!(
            "flusher of changelog {}/{} started",
            log.base_dn,
            log.replica_id
        );
        let ticker = |ms: u64| {
            let mut interval = time::interval(Duration::from_millis(ms.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        };
        let params = log.params();
        let (mut flush_ms, mut trim_ms) =
            (params.flush_interval_ms, params.trim_interval_ms);
        let mut flush_interval = ticker(flush_ms);
        let mut trim_interval = ticker(trim_ms);

        while !log.closed.load(Ordering::Acquire) {
            // intervals follow runtime parameter changes
            let params = log.params();
            if params.flush_interval_ms != flush_ms {
                flush_ms = params.flush_interval_ms;
                flush_interval = ticker(flush_ms);
            }
            if params.trim_interval_ms != trim_ms {
                trim_ms = params.trim_interval_ms;
                trim_interval = ticker(trim_ms);
            }

            tokio::select! {
                _ = log.flush_notify.notified() => {
                    if let Err(e) = log.flush().await {
                        log.fail(&e);
                    }
                },

                _ = flush_interval.tick() => {
                    if log.buffered() > 0 {
                        if let Err(e) = log.flush().await {
                            log.fail(&e);
                        }
                    }
                },

                _ = trim_interval.tick() => {
                    let purge_delay_ms = log.params().purge_delay_ms;
                    if purge_delay_ms > 0 {
                        if let Err(e) = log.trim(purge_delay_ms).await {
                            if !log.closed.load(Ordering::Acquire) {
                                log.fail(&e);
                            }
                        }
                    }
                },
            }
        }

        pf_debug!(
            "flusher of changelog {}/{} exited",
            log.base_dn,
            log.replica_id
        );
    }
}

/// Smallest key strictly greater than `key`.
#[inline]
pub(crate) fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

fn decode_counter(value: &[u8]) -> Result<u64, ChorusError> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        ChorusError::storage(format!(
            "malformed counter record of {} bytes",
            value.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Decodes a real record.
pub(crate) fn decode_update(value: &[u8]) -> Result<UpdateMsg, ChorusError> {
    decode_from_slice(value).map_err(|e| ChorusError::storage(e.to_string()))
}
