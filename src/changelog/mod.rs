//! Durable per-replica change logs and their storage engines.

mod cursor;
mod filestore;
mod replica_log;
mod store;

pub use cursor::ChangelogCursor;
pub use filestore::{FileEnv, FileStore};
pub use replica_log::{ChangelogLog, LogParams};
pub use store::{ChangelogEnv, ChangelogStore, MemEnv, MemStore, StoreRecord};
