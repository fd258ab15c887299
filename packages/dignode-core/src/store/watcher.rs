//! # Directory Watcher
//!
//! Forwards filesystem changes in the watched directory into the store
//! index. The notify callback runs on the watcher's own thread; events
//! cross into the async world over an mpsc channel and a tokio task
//! applies them through [`LocalStore::process_path`].

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::LocalStore;
use crate::error::Result;

/// A running watcher. Dropping it (or calling [`stop`]) detaches the
/// filesystem watch and ends the forwarding task.
///
/// [`stop`]: WatcherHandle::stop
pub struct WatcherHandle {
    // Held for its Drop: deregisters the OS watch.
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop forwarding events; the OS watch itself deregisters when the
    /// handle is dropped.
    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Start watching the store's root directory. Non-recursive:
/// subdirectories are never content.
pub fn spawn(store: Arc<LocalStore>) -> Result<WatcherHandle> {
    let (tx, mut rx) = mpsc::channel::<Vec<PathBuf>>(256);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        match res {
            Ok(event) => {
                // Creates, writes, renames, and removals all reduce to
                // "re-examine these paths"; process_path decides
                // add/change/remove from what is on disk now.
                let _ = tx.blocking_send(event.paths);
            }
            Err(e) => {
                tracing::warn!(error = %e, "watch error");
            }
        }
    })?;
    watcher.watch(store.root(), RecursiveMode::NonRecursive)?;

    let task = tokio::spawn(async move {
        while let Some(paths) = rx.recv().await {
            for path in paths {
                if let Err(e) = store.process_path(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "failed to index path");
                }
            }
        }
    });

    Ok(WatcherHandle { _watcher: watcher, task })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{digest, StoreEvent};
    use std::time::Duration;

    async fn next_event(
        rx: &mut tokio::sync::broadcast::Receiver<StoreEvent>,
    ) -> StoreEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no store event within 5s")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_watcher_picks_up_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let mut events = store.subscribe();
        let handle = spawn(store.clone()).unwrap();

        std::fs::write(dir.path().join("fresh.dig"), b"fresh bytes").unwrap();

        match next_event(&mut events).await {
            StoreEvent::Added(record) => {
                assert_eq!(record.digest, digest::bytes_digest(b"fresh bytes"));
            }
            other => panic!("expected Added, got {other:?}"),
        }
        assert!(store.lookup(&digest::bytes_digest(b"fresh bytes")).is_some());
        handle.stop();
    }

    #[tokio::test]
    async fn test_watcher_picks_up_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.dig");
        std::fs::write(&path, b"doomed").unwrap();

        let store = LocalStore::open(dir.path()).await.unwrap();
        store.scan().await.unwrap();
        let mut events = store.subscribe();
        let handle = spawn(store.clone()).unwrap();

        std::fs::remove_file(&path).unwrap();

        loop {
            match next_event(&mut events).await {
                StoreEvent::Removed(rel) => {
                    assert_eq!(rel, PathBuf::from("gone.dig"));
                    break;
                }
                // Some platforms report a modify before the remove.
                _ => continue,
            }
        }
        assert!(store.list().is_empty());
        handle.stop();
    }

    #[tokio::test]
    async fn test_watcher_ignores_non_dig_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let handle = spawn(store.clone()).unwrap();

        std::fs::write(dir.path().join("readme.md"), b"not content").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.list().is_empty());
        handle.stop();
    }
}
