//! Content-addressed hash cache.
//!
//! Keys on `(absolute_path, size, mtime_ns)` rather than file content so a
//! cache hit never requires reading the file twice. Backed by an embedded
//! single-file key-value store instead of one JSON blob per directory --
//! lookups stay O(1) regardless of how many files have ever been scanned.

use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use redb::{Database, ReadableTable, TableDefinition};
use sha2::{Digest, Sha256};

use crate::errors::WardenError;

const TABLE: TableDefinition<&str, &str> = TableDefinition::new("digests");
const READ_CHUNK: usize = 64 * 1024;

pub struct HashCache {
    db: Mutex<Database>,
}

impl HashCache {
    pub fn open(path: &Path) -> Result<Self, WardenError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WardenError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = Database::create(path)
            .map_err(|e| WardenError::CacheOpen {
                path: path.to_path_buf(),
                source: anyhow::Error::new(e),
            })?;

        {
            let write_txn = db.begin_write().map_err(|e| WardenError::CacheOpen {
                path: path.to_path_buf(),
                source: anyhow::Error::new(e),
            })?;
            write_txn
                .open_table(TABLE)
                .map_err(|e| WardenError::CacheOpen {
                    path: path.to_path_buf(),
                    source: anyhow::Error::new(e),
                })?;
            write_txn.commit().map_err(|e| WardenError::CacheOpen {
                path: path.to_path_buf(),
                source: anyhow::Error::new(e),
            })?;
        }

        Ok(HashCache { db: Mutex::new(db) })
    }

    /// In-memory cache used by tests and `--no-cache` runs; never persists.
    pub fn in_memory() -> Result<Self, WardenError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| WardenError::CacheOpen {
                path: std::path::PathBuf::from(":memory:"),
                source: anyhow::Error::new(e),
            })?;
        Ok(HashCache { db: Mutex::new(db) })
    }

    /// Returns the SHA-256 hex digest of `path`, consulting the cache first.
    pub fn digest_of(&self, path: &Path) -> anyhow::Result<String> {
        let absolute = std::fs::canonicalize(path)?;
        let metadata = std::fs::metadata(&absolute)?;
        let size = metadata.len();
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let key = cache_key(&absolute, size, mtime_ns);

        if let Some(digest) = self.lookup(&key)? {
            return Ok(digest);
        }

        let digest = hash_file(&absolute)?;
        self.store(&key, &digest)?;
        Ok(digest)
    }

    fn lookup(&self, key: &str) -> anyhow::Result<Option<String>> {
        let db = self.db.lock().unwrap();
        let read_txn = db.begin_read()?;
        let table = match read_txn.open_table(TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    fn store(&self, key: &str, digest: &str) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE)?;
            table.insert(key, digest)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drops every cached entry.
    pub fn clear(&self) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE)?;
            let keys: Vec<String> = table
                .iter()?
                .filter_map(|r| r.ok())
                .map(|(k, _)| k.value().to_string())
                .collect();
            for k in keys {
                table.remove(k.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn cache_key(absolute: &Path, size: u64, mtime_ns: u128) -> String {
    format!("{}|{}|{}", absolute.display(), size, mtime_ns)
}

fn hash_file(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cache_hit_avoids_rehash_until_mtime_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("artifact.bin");
        std::fs::write(&file_path, b"hello world").unwrap();

        let cache = HashCache::in_memory().unwrap();
        let first = cache.digest_of(&file_path).unwrap();
        let second = cache.digest_of(&file_path).unwrap();
        assert_eq!(first, second);

        // Force a new mtime and different content; cache key changes so the
        // stored digest does not leak across revisions.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&file_path)
            .unwrap();
        f.write_all(b"goodbye world").unwrap();
        drop(f);

        let third = cache.digest_of(&file_path).unwrap();
        assert_ne!(first, third);
    }
}
