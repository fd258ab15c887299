//! # Local Store
//!
//! The digest→path index over the watched directory.
//!
//! Files matching `*.dig` directly inside the directory are content;
//! subdirectories are ignored. The index invariant: for every record
//! there is a file on disk whose full contents hash to the record's
//! digest — a violation is evicted at the next rescan.
//!
//! Partial downloads live under a `.partial` subdirectory so the watcher
//! and scanner never see them; a completed download is renamed into place
//! as `<digest>.dig`.

pub mod digest;
pub mod watcher;

pub use watcher::WatcherHandle;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::time::now_timestamp_millis;

/// Extension for content files.
pub const DIG_EXTENSION: &str = "dig";

/// Staging directory for in-progress downloads, inside the watched dir.
const PARTIAL_DIR: &str = ".partial";

/// A file the store currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// SHA-256 of the file's full contents, hex-encoded
    pub digest: String,
    /// Path relative to the watched directory
    pub relative_path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Last-modified, Unix millis
    pub modified: i64,
}

/// Events emitted as the index changes.
///
/// The index is updated before the event fires.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A record entered the index (scan, watch, or completed download)
    Added(FileRecord),
    /// The file at this relative path left the index
    Removed(PathBuf),
    /// The file at this path now hashes differently
    Changed(FileRecord),
}

#[derive(Default)]
struct Index {
    /// digest → record
    by_digest: HashMap<String, FileRecord>,
    /// relative path → digest, for removals and change detection
    by_path: HashMap<PathBuf, String>,
}

/// The local content store.
pub struct LocalStore {
    root: PathBuf,
    index: RwLock<Index>,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Open a store over `root`, creating it (and the staging dir) if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(root.join(PARTIAL_DIR)).await?;
        let (event_tx, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            root,
            index: RwLock::new(Index::default()),
            event_tx,
        }))
    }

    /// The watched directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to index events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    /// Where a download for `digest` stages its partial file.
    pub fn partial_path(&self, digest: &str) -> PathBuf {
        self.root.join(PARTIAL_DIR).join(format!("{digest}.part"))
    }

    /// Absolute path of the content file for `digest`, if held.
    pub fn lookup(&self, digest: &str) -> Option<PathBuf> {
        self.index
            .read()
            .by_digest
            .get(digest)
            .map(|r| self.root.join(&r.relative_path))
    }

    /// The record for `digest`, if held.
    pub fn record(&self, digest: &str) -> Option<FileRecord> {
        self.index.read().by_digest.get(digest).cloned()
    }

    /// All current records.
    pub fn list(&self) -> Vec<FileRecord> {
        self.index.read().by_digest.values().cloned().collect()
    }

    /// The set of digests currently held.
    pub fn digests(&self) -> Vec<String> {
        self.index.read().by_digest.keys().cloned().collect()
    }

    /// Whether `path` is a content file for this store: a direct child of
    /// the root with the `.dig` extension.
    fn is_content_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
            && path.extension().map_or(false, |e| e == DIG_EXTENSION)
    }

    /// Full directory scan: hash every `*.dig` child, rebuild the index,
    /// and emit events for the differences. Also evicts records whose
    /// file disappeared or changed, per the index invariant.
    pub async fn scan(self: &Arc<Self>) -> Result<()> {
        let mut seen: HashMap<PathBuf, FileRecord> = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if !meta.is_file() || !self.is_content_path(&path) {
                continue;
            }
            match self.hash_record(&path, &meta).await {
                Ok(record) => {
                    seen.insert(record.relative_path.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                }
            }
        }
        self.apply_snapshot(seen);
        Ok(())
    }

    /// Re-examine a single path (from the watcher). Missing file ⇒ removal;
    /// present file ⇒ add or change.
    pub async fn process_path(self: &Arc<Self>, path: &Path) -> Result<()> {
        if !self.is_content_path(path) {
            return Ok(());
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                let record = self.hash_record(path, &meta).await?;
                self.insert_record(record);
            }
            _ => {
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(path)
                    .to_path_buf();
                self.remove_path(&rel);
            }
        }
        Ok(())
    }

    /// Verify `bytes` against `digest` and write them into the store
    /// atomically (temp file + rename). Rejects on mismatch.
    pub async fn ingest(self: &Arc<Self>, digest: &str, bytes: &[u8]) -> Result<FileRecord> {
        let actual = digest::bytes_digest(bytes);
        if actual != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        let staging = self.partial_path(digest);
        tokio::fs::write(&staging, bytes).await?;
        self.adopt(digest, &staging).await
    }

    /// Move an already-verified file at `src` into the store as
    /// `<digest>.dig`. The caller vouches that `src` hashes to `digest`;
    /// used by completed downloads after streaming verification.
    pub async fn adopt(self: &Arc<Self>, digest: &str, src: &Path) -> Result<FileRecord> {
        if !digest::is_valid_digest(digest) {
            return Err(Error::InvalidDigest(digest.to_string()));
        }
        let final_path = self.root.join(format!("{digest}.{DIG_EXTENSION}"));
        tokio::fs::rename(src, &final_path).await?;
        let meta = tokio::fs::metadata(&final_path).await?;
        let record = FileRecord {
            digest: digest.to_string(),
            relative_path: PathBuf::from(format!("{digest}.{DIG_EXTENSION}")),
            size: meta.len(),
            modified: modified_millis(&meta),
        };
        self.insert_record(record.clone());
        Ok(record)
    }

    async fn hash_record(&self, path: &Path, meta: &std::fs::Metadata) -> Result<FileRecord> {
        let digest = digest::file_digest(path).await?;
        Ok(FileRecord {
            digest,
            relative_path: path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_path_buf(),
            size: meta.len(),
            modified: modified_millis(meta),
        })
    }

    /// Replace the whole index with `snapshot`, emitting the diff.
    fn apply_snapshot(&self, snapshot: HashMap<PathBuf, FileRecord>) {
        let mut events = Vec::new();
        {
            let mut index = self.index.write();
            let old_paths: Vec<PathBuf> = index.by_path.keys().cloned().collect();
            for path in old_paths {
                if !snapshot.contains_key(&path) {
                    if let Some(old_digest) = index.by_path.remove(&path) {
                        index.by_digest.remove(&old_digest);
                        events.push(StoreEvent::Removed(path));
                    }
                }
            }
            for (path, record) in snapshot {
                match index.by_path.get(&path) {
                    Some(old_digest) if *old_digest == record.digest => {
                        // Same content; refresh metadata silently.
                        index.by_digest.insert(record.digest.clone(), record);
                    }
                    Some(old_digest) => {
                        let old_digest = old_digest.clone();
                        index.by_digest.remove(&old_digest);
                        index.by_path.insert(path, record.digest.clone());
                        index.by_digest.insert(record.digest.clone(), record.clone());
                        events.push(StoreEvent::Changed(record));
                    }
                    None => {
                        index.by_path.insert(path, record.digest.clone());
                        index.by_digest.insert(record.digest.clone(), record.clone());
                        events.push(StoreEvent::Added(record));
                    }
                }
            }
        }
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    fn insert_record(&self, record: FileRecord) {
        let event = {
            let mut index = self.index.write();
            let prior = index.by_path.get(&record.relative_path).cloned();
            match prior {
                Some(old_digest) if old_digest == record.digest => {
                    index.by_digest.insert(record.digest.clone(), record);
                    None
                }
                Some(old_digest) => {
                    index.by_digest.remove(&old_digest);
                    index
                        .by_path
                        .insert(record.relative_path.clone(), record.digest.clone());
                    index.by_digest.insert(record.digest.clone(), record.clone());
                    Some(StoreEvent::Changed(record))
                }
                None => {
                    index
                        .by_path
                        .insert(record.relative_path.clone(), record.digest.clone());
                    index.by_digest.insert(record.digest.clone(), record.clone());
                    Some(StoreEvent::Added(record))
                }
            }
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
    }

    fn remove_path(&self, rel: &Path) {
        let removed = {
            let mut index = self.index.write();
            match index.by_path.remove(rel) {
                Some(digest) => {
                    index.by_digest.remove(&digest);
                    true
                }
                None => false,
            }
        };
        if removed {
            let _ = self.event_tx.send(StoreEvent::Removed(rel.to_path_buf()));
        }
    }

    /// Drop a record after an external integrity violation (read error
    /// during serving). The file itself is left alone.
    pub fn evict(&self, digest: &str) {
        let rel = {
            let mut index = self.index.write();
            index.by_digest.remove(digest).map(|r| {
                index.by_path.remove(&r.relative_path);
                r.relative_path
            })
        };
        if let Some(rel) = rel {
            let _ = self.event_tx.send(StoreEvent::Removed(rel));
        }
    }
}

fn modified_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_else(now_timestamp_millis)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in(dir: &Path) -> Arc<LocalStore> {
        LocalStore::open(dir).await.unwrap()
    }

    fn write_dig(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_scan_indexes_dig_files_only() {
        let dir = tempfile::tempdir().unwrap();
        write_dig(dir.path(), "a.dig", b"alpha");
        write_dig(dir.path(), "notes.txt", b"ignored");
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_dig(&dir.path().join("sub"), "nested.dig", b"ignored too");

        let store = store_in(dir.path()).await;
        store.scan().await.unwrap();

        let records = store.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].digest, digest::bytes_digest(b"alpha"));
        assert_eq!(records[0].size, 5);
    }

    #[tokio::test]
    async fn test_scan_emits_added_then_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dig(dir.path(), "a.dig", b"alpha");

        let store = store_in(dir.path()).await;
        let mut events = store.subscribe();
        store.scan().await.unwrap();
        match events.recv().await.unwrap() {
            StoreEvent::Added(record) => {
                assert_eq!(record.relative_path, PathBuf::from("a.dig"))
            }
            other => panic!("expected Added, got {other:?}"),
        }

        std::fs::remove_file(&path).unwrap();
        store.scan().await.unwrap();
        match events.recv().await.unwrap() {
            StoreEvent::Removed(rel) => assert_eq!(rel, PathBuf::from("a.dig")),
            other => panic!("expected Removed, got {other:?}"),
        }
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn test_rescan_detects_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dig(dir.path(), "a.dig", b"before");

        let store = store_in(dir.path()).await;
        store.scan().await.unwrap();
        let old = digest::bytes_digest(b"before");
        assert!(store.lookup(&old).is_some());

        std::fs::write(&path, b"after").unwrap();
        let mut events = store.subscribe();
        store.scan().await.unwrap();

        match events.recv().await.unwrap() {
            StoreEvent::Changed(record) => {
                assert_eq!(record.digest, digest::bytes_digest(b"after"))
            }
            other => panic!("expected Changed, got {other:?}"),
        }
        // Old digest evicted, new one present — invariant holds.
        assert!(store.lookup(&old).is_none());
        assert!(store.lookup(&digest::bytes_digest(b"after")).is_some());
    }

    #[tokio::test]
    async fn test_ingest_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let wrong = digest::bytes_digest(b"other bytes");
        let err = store.ingest(&wrong, b"payload").await.unwrap_err();
        assert_eq!(err.kind(), "digest-mismatch");
        assert!(store.lookup(&wrong).is_none());
    }

    #[tokio::test]
    async fn test_ingest_writes_digest_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let d = digest::bytes_digest(b"payload");
        let record = store.ingest(&d, b"payload").await.unwrap();
        assert_eq!(record.relative_path, PathBuf::from(format!("{d}.dig")));

        let on_disk = store.lookup(&d).unwrap();
        assert_eq!(std::fs::read(on_disk).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_ingest_updates_index_before_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let mut events = store.subscribe();

        let d = digest::bytes_digest(b"ordered");
        store.ingest(&d, b"ordered").await.unwrap();

        // By the time the event is observable the lookup must succeed.
        match events.recv().await.unwrap() {
            StoreEvent::Added(record) => {
                assert_eq!(record.digest, d);
                assert!(store.lookup(&d).is_some());
            }
            other => panic!("expected Added, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_path_is_invisible_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        std::fs::write(store.partial_path("00aa"), b"half a download").unwrap();
        store.scan().await.unwrap();
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn test_adopt_renames_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let d = digest::bytes_digest(b"downloaded");
        let staging = store.partial_path(&d);
        std::fs::write(&staging, b"downloaded").unwrap();

        let record = store.adopt(&d, &staging).await.unwrap();
        assert_eq!(record.size, 10);
        assert!(!staging.exists());
        assert!(store.lookup(&d).is_some());
    }

    #[tokio::test]
    async fn test_adopt_rejects_malformed_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let staging = store.partial_path("xyz");
        std::fs::write(&staging, b"data").unwrap();
        assert!(store.adopt("not-a-digest", &staging).await.is_err());
    }

    #[tokio::test]
    async fn test_evict_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        write_dig(dir.path(), "a.dig", b"alpha");
        let store = store_in(dir.path()).await;
        store.scan().await.unwrap();

        let d = digest::bytes_digest(b"alpha");
        store.evict(&d);
        assert!(store.lookup(&d).is_none());
    }
}
