//! Append-file storage engine: every mutation is appended to a per-store
//! operation file as a length-prefixed MessagePack record and replayed into
//! an ordered in-memory index when the store is opened.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::changelog::store::{ChangelogEnv, ChangelogStore, StoreRecord};
use crate::proto::ServerId;
use crate::utils::ChorusError;

/// Rewrite the operation file once it holds this many more operations than
/// there are live records.
const COMPACT_SLACK: usize = 4096;

/// One durable mutation.
#[derive(Debug, Serialize, Deserialize)]
enum StoreOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    DeleteRange { from: Vec<u8>, to: Vec<u8> },
    Clear,
}

struct FileInner {
    backer: Option<File>,
    file_size: usize,
    index: BTreeMap<Vec<u8>, Vec<u8>>,

    /// Number of operations in the file, for deciding when to compact.
    num_ops: usize,
}

/// Store backed by one operation file.
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileStore {
    /// Opens (creating if missing) the store at `path` and replays its
    /// operation file. A torn record at the tail is cut off.
    pub async fn open(path: &Path) -> Result<Self, ChorusError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_debug!("created changelog file '{}'", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let file_size = backer.metadata().await?.len() as usize;

        let mut index = BTreeMap::new();
        let mut num_ops = 0;
        let mut offset = 0;
        while let Some((op, next)) =
            Self::read_op(&mut backer, file_size, offset).await?
        {
            Self::apply_op(&mut index, op);
            num_ops += 1;
            offset = next;
        }
        if offset < file_size {
            pf_warn!(
                "cutting torn tail of '{}' at {} (size {})",
                path.display(),
                offset,
                file_size
            );
            backer.set_len(offset as u64).await?;
            backer.sync_all().await?;
        }
        backer.seek(SeekFrom::End(0)).await?; // cursor at EOF

        Ok(FileStore {
            path: path.to_path_buf(),
            inner: Mutex::new(FileInner {
                backer: Some(backer),
                file_size: offset,
                index,
                num_ops,
            }),
        })
    }

    /// Reads the operation at `offset`. Returns `None` at EOF or on a torn
    /// record.
    async fn read_op(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<Option<(StoreOp, usize)>, ChorusError> {
        if offset + 8 > file_size {
            return Ok(None);
        }

        // read entry length header
        backer.seek(SeekFrom::Start(offset as u64)).await?;
        let op_len = backer.read_u64().await? as usize;
        let offset_e = offset + 8 + op_len;
        if offset_e > file_size {
            return Ok(None);
        }

        // read entry content
        let mut op_buf: Vec<u8> = vec![0; op_len];
        backer.read_exact(&mut op_buf[..]).await?;
        match decode_from_slice(&op_buf) {
            Ok(op) => Ok(Some((op, offset_e))),
            Err(e) => {
                pf_warn!("undecodable op at offset {}: {}", offset, e);
                Ok(None)
            }
        }
    }

    fn apply_op(index: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: StoreOp) -> u64 {
        match op {
            StoreOp::Put { key, value } => {
                index.insert(key, value);
                1
            }
            StoreOp::DeleteRange { from, to } => {
                if from >= to {
                    return 0;
                }
                let mut tail = index.split_off(&from);
                let mut rest = tail.split_off(&to);
                let deleted = tail.len() as u64;
                index.append(&mut rest);
                deleted
            }
            StoreOp::Clear => {
                let deleted = index.len() as u64;
                index.clear();
                deleted
            }
        }
    }

    /// Appends the given operations at EOF and syncs.
    async fn append_ops(
        inner: &mut FileInner,
        ops: &[StoreOp],
    ) -> Result<(), ChorusError> {
        let backer = match inner.backer.as_mut() {
            Some(backer) => backer,
            None => return Err(ChorusError::storage("changelog file closed")),
        };

        let mut buf = Vec::new();
        for op in ops {
            let op_bytes = encode_to_vec(op)?;
            buf.extend_from_slice(&(op_bytes.len() as u64).to_be_bytes());
            buf.extend_from_slice(&op_bytes);
        }
        backer.write_all(&buf).await?;
        backer.sync_data().await?;

        inner.file_size += buf.len();
        inner.num_ops += ops.len();
        Ok(())
    }

    /// Rewrites the operation file with only the live records if it has
    /// accumulated too much garbage.
    async fn maybe_compact(
        &self,
        inner: &mut FileInner,
    ) -> Result<(), ChorusError> {
        if inner.num_ops < inner.index.len() + COMPACT_SLACK {
            return Ok(());
        }

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path).await?;
        let mut buf = Vec::new();
        for (key, value) in inner.index.iter() {
            let op_bytes = encode_to_vec(&StoreOp::Put {
                key: key.clone(),
                value: value.clone(),
            })?;
            buf.extend_from_slice(&(op_bytes.len() as u64).to_be_bytes());
            buf.extend_from_slice(&op_bytes);
        }
        tmp.write_all(&buf).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).await?;

        let mut backer =
            OpenOptions::new().read(true).write(true).open(&self.path).await?;
        backer.seek(SeekFrom::End(0)).await?;
        pf_debug!(
            "compacted '{}': {} ops -> {} records",
            self.path.display(),
            inner.num_ops,
            inner.index.len()
        );
        inner.backer = Some(backer);
        inner.file_size = buf.len();
        inner.num_ops = inner.index.len();
        Ok(())
    }

    fn check_open(inner: &FileInner) -> Result<(), ChorusError> {
        if inner.backer.is_none() {
            Err(ChorusError::storage("changelog file closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChangelogStore for FileStore {
    async fn append_batch(
        &self,
        records: Vec<StoreRecord>,
    ) -> Result<(), ChorusError> {
        let mut inner = self.inner.lock().await;
        let ops: Vec<StoreOp> = records
            .into_iter()
            .map(|(key, value)| StoreOp::Put { key, value })
            .collect();
        Self::append_ops(&mut inner, &ops).await?;
        for op in ops {
            Self::apply_op(&mut inner.index, op);
        }
        Ok(())
    }

    async fn read_forward(
        &self,
        from: &[u8],
        limit: usize,
    ) -> Result<Vec<StoreRecord>, ChorusError> {
        let inner = self.inner.lock().await;
        Self::check_open(&inner)?;
        Ok(inner
            .index
            .range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn read_backward(
        &self,
        from: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<StoreRecord>, ChorusError> {
        let inner = self.inner.lock().await;
        Self::check_open(&inner)?;
        let upper = match from {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        Ok(inner
            .index
            .range::<[u8], _>((Bound::Unbounded, upper))
            .rev()
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete_range(
        &self,
        from: &[u8],
        to: &[u8],
    ) -> Result<u64, ChorusError> {
        let mut inner = self.inner.lock().await;
        let op = StoreOp::DeleteRange {
            from: from.to_vec(),
            to: to.to_vec(),
        };
        Self::append_ops(&mut inner, std::slice::from_ref(&op)).await?;
        let deleted = Self::apply_op(&mut inner.index, op);
        self.maybe_compact(&mut inner).await?;
        Ok(deleted)
    }

    async fn approximate_count(
        &self,
        from: &[u8],
        to: &[u8],
    ) -> Result<u64, ChorusError> {
        if from > to {
            return Ok(0);
        }
        let inner = self.inner.lock().await;
        Self::check_open(&inner)?;
        Ok(inner
            .index
            .range::<[u8], _>((Bound::Included(from), Bound::Included(to)))
            .count() as u64)
    }

    async fn clear(&self) -> Result<(), ChorusError> {
        let mut inner = self.inner.lock().await;
        Self::append_ops(&mut inner, &[StoreOp::Clear]).await?;
        inner.index.clear();
        self.maybe_compact(&mut inner).await
    }

    async fn close(&self) -> Result<(), ChorusError> {
        let mut inner = self.inner.lock().await;
        if let Some(backer) = inner.backer.take() {
            backer.sync_all().await?;
        }
        Ok(())
    }
}

/// Name of the file holding the generation ID of a suffix.
const GENERATION_FILE: &str = "generation";

/// Environment of file stores rooted at a directory: one subdirectory per
/// suffix (hex-encoded name), one `<replica>.log` file per replica and a
/// `generation` file.
pub struct FileEnv {
    root: PathBuf,
}

impl FileEnv {
    pub async fn new_and_setup(root: &Path) -> Result<Self, ChorusError> {
        fs::create_dir_all(root).await?;
        pf_info!("changelog directory '{}'", root.display());
        Ok(FileEnv {
            root: root.to_path_buf(),
        })
    }

    fn suffix_dir(&self, base_dn: &str) -> PathBuf {
        let name: String =
            base_dn.bytes().map(|b| format!("{:02x}", b)).collect();
        self.root.join(name)
    }

    fn decode_dir_name(name: &str) -> Option<String> {
        if name.len() % 2 != 0 {
            return None;
        }
        let bytes: Option<Vec<u8>> = (0..name.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
            .collect();
        String::from_utf8(bytes?).ok()
    }
}

#[async_trait]
impl ChangelogEnv for FileEnv {
    async fn open(
        &self,
        base_dn: &str,
        replica_id: ServerId,
    ) -> Result<Arc<dyn ChangelogStore>, ChorusError> {
        let dir = self.suffix_dir(base_dn);
        fs::create_dir_all(&dir).await?;
        let store =
            FileStore::open(&dir.join(format!("{}.log", replica_id))).await?;
        Ok(Arc::new(store))
    }

    async fn list(&self) -> Result<Vec<(String, ServerId)>, ChorusError> {
        let mut found = vec![];
        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            let dir_name = dir.file_name().to_string_lossy().to_string();
            let base_dn = match Self::decode_dir_name(&dir_name) {
                Some(base_dn) => base_dn,
                None => continue,
            };
            let mut files = fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let file_name = file.file_name().to_string_lossy().to_string();
                if let Some(rid) = file_name
                    .strip_suffix(".log")
                    .and_then(|stem| stem.parse::<ServerId>().ok())
                {
                    found.push((base_dn.clone(), rid));
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn load_generation_id(
        &self,
        base_dn: &str,
    ) -> Result<Option<i64>, ChorusError> {
        let path = self.suffix_dir(base_dn).join(GENERATION_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).await?;
        Ok(Some(text.trim().parse::<i64>().map_err(|e| {
            ChorusError::storage(format!(
                "bad generation id file '{}': {}",
                path.display(),
                e
            ))
        })?))
    }

    async fn save_generation_id(
        &self,
        base_dn: &str,
        generation_id: Option<i64>,
    ) -> Result<(), ChorusError> {
        let dir = self.suffix_dir(base_dn);
        let path = dir.join(GENERATION_FILE);
        match generation_id {
            Some(id) => {
                fs::create_dir_all(&dir).await?;
                let tmp = dir.join(format!("{}.tmp", GENERATION_FILE));
                fs::write(&tmp, id.to_string()).await?;
                fs::rename(&tmp, &path).await?;
            }
            None => {
                if fs::try_exists(&path).await? {
                    fs::remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }
}
