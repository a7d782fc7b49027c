//! Ordered key/value storage contract backing the change logs, plus an
//! in-memory engine.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::proto::ServerId;
use crate::utils::ChorusError;

/// A raw record as stored: (key, value).
pub type StoreRecord = (Vec<u8>, Vec<u8>);

/// Ordered byte-key tree holding the change log of one (suffix, replica).
/// Every error returned is a storage fault.
#[async_trait]
pub trait ChangelogStore: Send + Sync {
    /// Writes a batch of records at the end of the tree. Writing a key that
    /// already exists overwrites it, so retrying a batch is harmless.
    async fn append_batch(
        &self,
        records: Vec<StoreRecord>,
    ) -> Result<(), ChorusError>;

    /// Reads up to `limit` records with keys >= `from`, ascending.
    async fn read_forward(
        &self,
        from: &[u8],
        limit: usize,
    ) -> Result<Vec<StoreRecord>, ChorusError>;

    /// Reads up to `limit` records with keys <= `from` (or from the very
    /// end if `None`), descending.
    async fn read_backward(
        &self,
        from: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<StoreRecord>, ChorusError>;

    /// Deletes every record with key in `[from, to)`. Returns how many were
    /// deleted.
    async fn delete_range(
        &self,
        from: &[u8],
        to: &[u8],
    ) -> Result<u64, ChorusError>;

    /// Approximate number of records with key in `[from, to]`.
    async fn approximate_count(
        &self,
        from: &[u8],
        to: &[u8],
    ) -> Result<u64, ChorusError>;

    /// Deletes everything.
    async fn clear(&self) -> Result<(), ChorusError>;

    /// Releases the underlying resources. Later calls fail.
    async fn close(&self) -> Result<(), ChorusError>;
}

/// Opens change log stores by (suffix, replica).
#[async_trait]
pub trait ChangelogEnv: Send + Sync {
    async fn open(
        &self,
        base_dn: &str,
        replica_id: ServerId,
    ) -> Result<Arc<dyn ChangelogStore>, ChorusError>;

    /// Every (suffix, replica) that has a store already.
    async fn list(&self) -> Result<Vec<(String, ServerId)>, ChorusError>;

    /// Generation ID the change logs of a suffix belong to, if recorded.
    async fn load_generation_id(
        &self,
        base_dn: &str,
    ) -> Result<Option<i64>, ChorusError>;

    /// Records (or with `None`, forgets) the generation ID of a suffix.
    async fn save_generation_id(
        &self,
        base_dn: &str,
        generation_id: Option<i64>,
    ) -> Result<(), ChorusError>;
}

#[derive(Debug, Default)]
struct MemInner {
    tree: BTreeMap<Vec<u8>, Vec<u8>>,
    closed: bool,
}

/// In-memory store over a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tree<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<Vec<u8>, Vec<u8>>) -> R,
    ) -> Result<R, ChorusError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChorusError::storage("memory store lock poisoned"))?;
        if inner.closed {
            return Err(ChorusError::storage("memory store already closed"));
        }
        Ok(f(&mut inner.tree))
    }

    fn set_closed(&self, closed: bool) -> Result<(), ChorusError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChorusError::storage("memory store lock poisoned"))?;
        inner.closed = closed;
        Ok(())
    }
}

#[async_trait]
impl ChangelogStore for MemStore {
    async fn append_batch(
        &self,
        records: Vec<StoreRecord>,
    ) -> Result<(), ChorusError> {
        self.with_tree(|tree| {
            for (key, value) in records {
                tree.insert(key, value);
            }
        })
    }

    async fn read_forward(
        &self,
        from: &[u8],
        limit: usize,
    ) -> Result<Vec<StoreRecord>, ChorusError> {
        self.with_tree(|tree| {
            tree.range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    async fn read_backward(
        &self,
        from: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<StoreRecord>, ChorusError> {
        self.with_tree(|tree| {
            let upper = match from {
                Some(key) => Bound::Included(key),
                None => Bound::Unbounded,
            };
            tree.range::<[u8], _>((Bound::Unbounded, upper))
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    async fn delete_range(
        &self,
        from: &[u8],
        to: &[u8],
    ) -> Result<u64, ChorusError> {
        self.with_tree(|tree| {
            let doomed: Vec<Vec<u8>> = tree
                .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed.iter() {
                tree.remove(key);
            }
            doomed.len() as u64
        })
    }

    async fn approximate_count(
        &self,
        from: &[u8],
        to: &[u8],
    ) -> Result<u64, ChorusError> {
        if from > to {
            return Ok(0);
        }
        self.with_tree(|tree| {
            tree.range::<[u8], _>((Bound::Included(from), Bound::Included(to)))
                .count() as u64
        })
    }

    async fn clear(&self) -> Result<(), ChorusError> {
        self.with_tree(|tree| tree.clear())
    }

    async fn close(&self) -> Result<(), ChorusError> {
        self.set_closed(true)
    }
}

/// Environment of in-memory stores. Reopening a (suffix, replica) hands
/// back the same store, so a domain restarted within one process finds its
/// change logs again.
#[derive(Debug, Default)]
pub struct MemEnv {
    stores: Mutex<HashMap<(String, ServerId), Arc<MemStore>>>,
    generation_ids: Mutex<HashMap<String, i64>>,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangelogEnv for MemEnv {
    async fn open(
        &self,
        base_dn: &str,
        replica_id: ServerId,
    ) -> Result<Arc<dyn ChangelogStore>, ChorusError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| ChorusError::storage("memory env lock poisoned"))?;
        let store = stores
            .entry((base_dn.to_string(), replica_id))
            .or_insert_with(|| Arc::new(MemStore::new()))
            .clone();
        store.set_closed(false)?;
        Ok(store)
    }

    async fn list(&self) -> Result<Vec<(String, ServerId)>, ChorusError> {
        let stores = self
            .stores
            .lock()
            .map_err(|_| ChorusError::storage("memory env lock poisoned"))?;
        let mut keys: Vec<_> = stores.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn load_generation_id(
        &self,
        base_dn: &str,
    ) -> Result<Option<i64>, ChorusError> {
        let ids = self
            .generation_ids
            .lock()
            .map_err(|_| ChorusError::storage("memory env lock poisoned"))?;
        Ok(ids.get(base_dn).copied())
    }

    async fn save_generation_id(
        &self,
        base_dn: &str,
        generation_id: Option<i64>,
    ) -> Result<(), ChorusError> {
        let mut ids = self
            .generation_ids
            .lock()
            .map_err(|_| ChorusError::storage("memory env lock poisoned"))?;
        match generation_id {
            Some(id) => ids.insert(base_dn.to_string(), id),
            None => ids.remove(base_dn),
        };
        Ok(())
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;

    fn rec(k: u8) -> StoreRecord {
        (vec![k], vec![k, k])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mem_store_ranges() -> Result<(), ChorusError> {
        let store = MemStore::new();
        store
            .append_batch((1..=9).map(rec).collect())
            .await?;
        let fwd = store.read_forward(&[4], 3).await?;
        assert_eq!(fwd, vec![rec(4), rec(5), rec(6)]);
        let bwd = store.read_backward(Some(&[4]), 2).await?;
        assert_eq!(bwd, vec![rec(4), rec(3)]);
        let tail = store.read_backward(None, 1).await?;
        assert_eq!(tail, vec![rec(9)]);
        assert_eq!(store.approximate_count(&[2], &[5]).await?, 4);
        assert_eq!(store.approximate_count(&[5], &[2]).await?, 0);
        assert_eq!(store.delete_range(&[2], &[5]).await?, 3);
        assert_eq!(store.read_forward(&[0], 100).await?.len(), 6);
        // retried batch is harmless
        store.append_batch(vec![rec(9)]).await?;
        assert_eq!(store.read_forward(&[0], 100).await?.len(), 6);
        store.clear().await?;
        assert!(store.read_forward(&[0], 100).await?.is_empty());
        store.close().await?;
        assert!(store.read_forward(&[0], 1).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mem_env_reopen() -> Result<(), ChorusError> {
        let env = MemEnv::new();
        let store = env.open("dc=ex", 3).await?;
        store.append_batch(vec![rec(1)]).await?;
        store.close().await?;
        let again = env.open("dc=ex", 3).await?;
        assert_eq!(again.read_forward(&[0], 10).await?, vec![rec(1)]);
        env.open("dc=other", 1).await?;
        assert_eq!(
            env.list().await?,
            vec![("dc=ex".to_string(), 3), ("dc=other".to_string(), 1)]
        );

        assert_eq!(env.load_generation_id("dc=ex").await?, None);
        env.save_generation_id("dc=ex", Some(42)).await?;
        assert_eq!(env.load_generation_id("dc=ex").await?, Some(42));
        env.save_generation_id("dc=ex", None).await?;
        assert_eq!(env.load_generation_id("dc=ex").await?, None);
        Ok(())
    }
}
