//! # Download Engine
//!
//! Client side of the transfer protocol. Metadata first, then pipelined
//! chunk requests with a bounded number in flight. Out-of-order
//! arrivals are written straight to the partial file at their offset;
//! the SHA-256 accumulator only ever advances in index order, so
//! verification streams with the download.
//!
//! Resume: an existing partial file is truncated to a chunk boundary,
//! its prefix re-hashed into the accumulator, and requests start at the
//! first missing chunk. Interrupting a transfer at any chunk boundary
//! and re-running it produces a byte-identical file.
//!
//! On completion the final hash must equal the digest; a mismatch
//! deletes the partial and fails the transfer — nothing recovers
//! silently from an integrity failure.

use sha2::{Digest as _, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::choke::Choker;
use super::{CancelFlag, Connection, TransferEvent};
use crate::error::{Error, Result};
use crate::store::digest::{chunk_count, is_valid_digest, prefix_hasher};
use crate::store::{FileRecord, LocalStore};
use crate::wire::Frame;

/// How often stalled requests are checked for timeout.
const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_millis(250);

/// Consecutive failures on one source before switching to the next.
const SOURCE_FAILURE_LIMIT: u32 = 3;

/// Validated metadata for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Metadata {
    total_bytes: u64,
    total_chunks: u64,
    chunk_size: u32,
}

/// The download half of the transfer protocol.
pub struct Downloader {
    pub store: Arc<LocalStore>,
    pub request_timeout: Duration,
    pub max_outstanding: usize,
    pub max_chunk_retries: u32,
    pub events: broadcast::Sender<TransferEvent>,
    /// Feeds peer contribution into the choke scheduler
    pub choker: Option<Arc<Choker>>,
}

impl Downloader {
    /// Fetch `digest` using `sources` (tried in order; chunk failures
    /// rotate to later sources). Returns the adopted store record.
    pub async fn download(
        &self,
        digest: &str,
        sources: &[Arc<Connection>],
        cancel: &CancelFlag,
    ) -> Result<FileRecord> {
        if !is_valid_digest(digest) {
            return Err(Error::InvalidDigest(digest.to_string()));
        }
        if sources.is_empty() {
            return Err(Error::PeerNotFound(format!("no sources for {digest}")));
        }

        let result = self.run(digest, sources, cancel).await;
        match &result {
            Ok(_) => {
                let _ = self.events.send(TransferEvent::Completed { digest: digest.to_string() });
            }
            Err(Error::Cancelled) => {
                let _ = self.events.send(TransferEvent::Cancelled { digest: digest.to_string() });
            }
            Err(e) => {
                let _ = self.events.send(TransferEvent::Failed {
                    digest: digest.to_string(),
                    reason: e.kind(),
                });
            }
        }
        result
    }

    async fn run(
        &self,
        digest: &str,
        sources: &[Arc<Connection>],
        cancel: &CancelFlag,
    ) -> Result<FileRecord> {
        // Metadata from the first source that answers.
        let (mut active, metadata, mut rx) = self.fetch_metadata(digest, sources, 0).await?;
        let _ = self.events.send(TransferEvent::Started {
            digest: digest.to_string(),
            source: sources[active].remote,
        });

        // Zero-byte blob: no chunk requests at all.
        if metadata.total_chunks == 0 {
            sources[active].unregister_transfer(digest);
            return self.finish_empty(digest).await;
        }

        let partial = self.store.partial_path(digest);
        let (mut hasher, mut hash_pos) = self.resume_state(&partial, &metadata).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&partial)
            .await?;

        let mut queue: VecDeque<u64> = (hash_pos..metadata.total_chunks).collect();
        let mut outstanding: HashMap<u64, Instant> = HashMap::new();
        let mut received: HashSet<u64> = HashSet::new();
        let mut pending_hash: HashMap<u64, Vec<u8>> = HashMap::new();
        let mut retries: HashMap<u64, u32> = HashMap::new();
        let mut choked_since: Option<Instant> = None;
        let mut source_failures: u32 = 0;

        let mut scan = tokio::time::interval(TIMEOUT_SCAN_INTERVAL);

        while hash_pos < metadata.total_chunks {
            let connection = &sources[active];

            // Fill the pipeline.
            if choked_since.is_none() {
                while outstanding.len() < self.max_outstanding {
                    let Some(chunk) = queue.pop_front() else { break };
                    if received.contains(&chunk) {
                        continue;
                    }
                    let request = Frame::ChunkRequest {
                        digest: digest.to_string(),
                        chunk_index: chunk,
                    };
                    if let Err(e) = connection.send(request).await {
                        // Dead source; put the chunk back and let the
                        // timeout path rotate (or fail, if alone).
                        queue.push_front(chunk);
                        if sources.len() == 1 {
                            return Err(e);
                        }
                        source_failures = SOURCE_FAILURE_LIMIT;
                        break;
                    }
                    connection.note_request_sent();
                    outstanding.insert(chunk, Instant::now());
                }
            }

            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        None => {
                            // Source died; rotate.
                            let next = self
                                .rotate_source(digest, sources, active, &metadata)
                                .await?;
                            active = next.0;
                            rx = next.1;
                            requeue_outstanding(&mut outstanding, &mut queue, connection);
                            choked_since = None;
                            source_failures = 0;
                        }
                        Some(Frame::ChunkResponse { chunk_index, data, .. }) => {
                            connection.note_response();
                            outstanding.remove(&chunk_index);
                            source_failures = 0;
                            if chunk_index >= metadata.total_chunks
                                || received.contains(&chunk_index)
                                || chunk_index < hash_pos
                            {
                                continue;
                            }
                            if data.len() as u64 != expected_len(&metadata, chunk_index) {
                                tracing::warn!(
                                    digest,
                                    chunk_index,
                                    got = data.len(),
                                    "chunk length mismatch"
                                );
                                self.count_retry(digest, chunk_index, &mut retries)?;
                                queue.push_front(chunk_index);
                                continue;
                            }

                            file.seek(SeekFrom::Start(chunk_index * metadata.chunk_size as u64))
                                .await?;
                            file.write_all(&data).await?;
                            received.insert(chunk_index);
                            if let Some(choker) = &self.choker {
                                choker.record_contribution(connection.remote, data.len() as u64);
                            }
                            // Tell the peer we hold it now (spread tracking).
                            let _ = connection
                                .send(Frame::Have {
                                    digest: digest.to_string(),
                                    chunk_index,
                                })
                                .await;

                            pending_hash.insert(chunk_index, data);
                            while let Some(bytes) = pending_hash.remove(&hash_pos) {
                                hasher.update(&bytes);
                                hash_pos += 1;
                            }
                            let _ = self.events.send(TransferEvent::Progress {
                                digest: digest.to_string(),
                                received_chunks: hash_pos,
                                total_chunks: metadata.total_chunks,
                            });
                        }
                        Some(Frame::Error { reason, chunk_index: Some(chunk), .. }) => {
                            connection.note_response();
                            outstanding.remove(&chunk);
                            if reason == "choked" {
                                // Not a chunk failure: wait for unchoke.
                                choked_since.get_or_insert_with(Instant::now);
                                queue.push_front(chunk);
                            } else {
                                tracing::debug!(digest, chunk, reason, "chunk refused");
                                self.count_retry(digest, chunk, &mut retries)?;
                                queue.push_front(chunk);
                                source_failures += 1;
                            }
                        }
                        Some(Frame::Choke) => {
                            choked_since.get_or_insert_with(Instant::now);
                        }
                        Some(Frame::Unchoke) => {
                            choked_since = None;
                        }
                        // Duplicate metadata or unrelated noise.
                        Some(_) => {}
                    }
                }
                _ = scan.tick() => {
                    let timed_out: Vec<u64> = outstanding
                        .iter()
                        .filter(|(_, sent)| sent.elapsed() > self.request_timeout)
                        .map(|(chunk, _)| *chunk)
                        .collect();
                    for chunk in timed_out {
                        outstanding.remove(&chunk);
                        connection.note_response();
                        self.count_retry(digest, chunk, &mut retries)?;
                        queue.push_front(chunk);
                        source_failures += 1;
                    }
                    // A peer that never unchokes us is a dead source.
                    if matches!(choked_since, Some(since) if since.elapsed() > self.request_timeout)
                    {
                        source_failures = SOURCE_FAILURE_LIMIT;
                    }
                    if source_failures >= SOURCE_FAILURE_LIMIT && sources.len() > 1 {
                        let next = self
                            .rotate_source(digest, sources, active, &metadata)
                            .await?;
                        active = next.0;
                        rx = next.1;
                        requeue_outstanding(&mut outstanding, &mut queue, connection);
                        choked_since = None;
                        source_failures = 0;
                    }
                }
                _ = cancel.cancelled() => {
                    // Best-effort cancels; the partial stays for resume.
                    for chunk in outstanding.keys() {
                        let _ = connection
                            .send(Frame::Cancel {
                                digest: digest.to_string(),
                                chunk_index: *chunk,
                            })
                            .await;
                    }
                    connection.reset_outstanding();
                    sources[active].unregister_transfer(digest);
                    file.flush().await?;
                    return Err(Error::Cancelled);
                }
            }
        }

        sources[active].unregister_transfer(digest);
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        // Streaming verification lands here with the full-file hash.
        let actual = hex::encode(hasher.finalize());
        if actual != digest {
            tokio::fs::remove_file(&partial).await.ok();
            return Err(Error::IntegrityFailure { digest: digest.to_string() });
        }
        self.store.adopt(digest, &partial).await
    }

    /// Metadata exchange against sources `from..`, first answer wins.
    async fn fetch_metadata(
        &self,
        digest: &str,
        sources: &[Arc<Connection>],
        from: usize,
    ) -> Result<(usize, Metadata, mpsc::Receiver<Frame>)> {
        let mut last_err = Error::MetadataTimeout(digest.to_string());
        for (index, connection) in sources.iter().enumerate().skip(from) {
            let mut rx = connection.register_transfer(digest);
            match self.metadata_from(digest, connection, &mut rx).await {
                Ok(metadata) => return Ok((index, metadata, rx)),
                Err(e) => {
                    connection.unregister_transfer(digest);
                    tracing::debug!(peer = %connection.remote, error = %e, "metadata failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn metadata_from(
        &self,
        digest: &str,
        connection: &Arc<Connection>,
        rx: &mut mpsc::Receiver<Frame>,
    ) -> Result<Metadata> {
        connection
            .send(Frame::MetadataRequest { digest: digest.to_string() })
            .await?;
        let deadline = Instant::now() + self.request_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .map_err(|_| Error::MetadataTimeout(digest.to_string()))?
                .ok_or_else(|| Error::ConnectionClosed(connection.remote.to_hex()))?;
            match frame {
                Frame::MetadataResponse { total_bytes, total_chunks, chunk_size, .. } => {
                    if total_chunks > 0 && chunk_size == 0 {
                        return Err(Error::Protocol("metadata with zero chunk size".into()));
                    }
                    if total_chunks != chunk_count(total_bytes, chunk_size.max(1)) {
                        return Err(Error::Protocol(format!(
                            "metadata inconsistent: {total_bytes} bytes in {total_chunks} chunks of {chunk_size}"
                        )));
                    }
                    return Ok(Metadata { total_bytes, total_chunks, chunk_size });
                }
                Frame::Error { reason, .. } => {
                    return Err(Error::NotFound(format!("{digest}: {reason}")));
                }
                _ => continue,
            }
        }
    }

    /// Next source after `current`; its metadata must agree with the
    /// shape the transfer already committed to.
    async fn rotate_source(
        &self,
        digest: &str,
        sources: &[Arc<Connection>],
        current: usize,
        expected: &Metadata,
    ) -> Result<(usize, mpsc::Receiver<Frame>)> {
        sources[current].unregister_transfer(digest);
        let mut from = current + 1;
        loop {
            if from >= sources.len() {
                return Err(Error::ConnectionClosed(format!(
                    "all sources exhausted for {digest}"
                )));
            }
            let (index, metadata, rx) = self.fetch_metadata(digest, sources, from).await?;
            if metadata == *expected {
                tracing::debug!(digest, peer = %sources[index].remote, "switched source");
                return Ok((index, rx));
            }
            tracing::debug!(
                digest,
                peer = %sources[index].remote,
                "source metadata disagrees; skipping"
            );
            sources[index].unregister_transfer(digest);
            from = index + 1;
        }
    }

    /// Truncate an existing partial to a chunk boundary and rebuild the
    /// accumulator over its prefix.
    async fn resume_state(&self, partial: &std::path::Path, metadata: &Metadata) -> Result<(Sha256, u64)> {
        let existing = match tokio::fs::metadata(partial).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Ok((Sha256::new(), 0)),
        };
        let resume_chunks =
            (existing / metadata.chunk_size as u64).min(metadata.total_chunks);
        if resume_chunks == 0 {
            tokio::fs::remove_file(partial).await.ok();
            return Ok((Sha256::new(), 0));
        }
        let prefix_bytes = resume_chunks * metadata.chunk_size as u64;
        let file = OpenOptions::new().write(true).open(partial).await?;
        file.set_len(prefix_bytes).await?;
        drop(file);

        let hasher = prefix_hasher(partial, prefix_bytes).await?;
        tracing::info!(
            partial = %partial.display(),
            resume_chunks,
            "resuming download from existing prefix"
        );
        Ok((hasher, resume_chunks))
    }

    async fn finish_empty(&self, digest: &str) -> Result<FileRecord> {
        let actual = hex::encode(Sha256::new().finalize());
        if actual != digest {
            return Err(Error::IntegrityFailure { digest: digest.to_string() });
        }
        let partial = self.store.partial_path(digest);
        tokio::fs::write(&partial, b"").await?;
        self.store.adopt(digest, &partial).await
    }

    fn count_retry(
        &self,
        digest: &str,
        chunk: u64,
        retries: &mut HashMap<u64, u32>,
    ) -> Result<()> {
        let count = retries.entry(chunk).or_insert(0);
        *count += 1;
        if *count > self.max_chunk_retries {
            return Err(Error::ChunkUnavailable { digest: digest.to_string(), chunk });
        }
        Ok(())
    }
}

fn expected_len(metadata: &Metadata, chunk: u64) -> u64 {
    let start = chunk * metadata.chunk_size as u64;
    (metadata.total_bytes - start).min(metadata.chunk_size as u64)
}

fn requeue_outstanding(
    outstanding: &mut HashMap<u64, Instant>,
    queue: &mut VecDeque<u64>,
    old_source: &Arc<Connection>,
) {
    for (chunk, _) in outstanding.drain() {
        queue.push_front(chunk);
    }
    old_source.reset_outstanding();
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::store::digest::bytes_digest;
    use crate::transfer::choke::Choker;
    use crate::transfer::serve::{serve_connection, ServeDeps};
    use crate::transport::tcp::{TcpAcceptor, TcpChannel};
    use crate::transport::{BoxedChannel, Channel, TransportKind};

    /// A serving node over TCP loopback with `data` in its store, plus
    /// the client-side connection pointed at it.
    struct Seed {
        client_conn: Arc<Connection>,
        digest: String,
        cancel: CancelFlag,
        _server_dir: tempfile::TempDir,
    }

    async fn seed_with(data: &[u8], chunk_size: u32) -> Seed {
        let server_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(server_dir.path()).await.unwrap();
        let digest = bytes_digest(data);
        store.ingest(&digest, data).await.unwrap();

        let deps = Arc::new(ServeDeps {
            store,
            choker: Arc::new(Choker::new(4, 4)),
            chunk_size,
        });

        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client_chan: BoxedChannel = Arc::new(
            TcpChannel::connect(acceptor.local_addr(), TransportKind::DirectTcp)
                .await
                .unwrap(),
        );
        let server_chan: BoxedChannel = Arc::new(acceptor.accept().await.unwrap());

        let client_id = NodeId::random();
        deps.choker.register_peer(client_id);
        let (server_conn, server_rx) =
            Connection::new(client_id, TransportKind::DirectTcp, server_chan);
        let cancel = CancelFlag::new();
        tokio::spawn(serve_connection(deps, server_conn, server_rx, cancel.clone()));

        let (client_conn, _client_server_rx) =
            Connection::new(NodeId::random(), TransportKind::DirectTcp, client_chan);

        Seed { client_conn, digest, cancel, _server_dir: server_dir }
    }

    fn downloader(store: Arc<LocalStore>) -> Downloader {
        let (events, _) = broadcast::channel(256);
        Downloader {
            store,
            request_timeout: Duration::from_secs(5),
            max_outstanding: 5,
            max_chunk_retries: 3,
            events,
            choker: None,
        }
    }

    #[tokio::test]
    async fn test_download_multi_chunk_blob() {
        let data: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();
        let seed = seed_with(&data, 64 * 1024).await;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let dl = downloader(store.clone());
        let cancel = CancelFlag::new();

        let record = dl
            .download(&seed.digest, &[seed.client_conn.clone()], &cancel)
            .await
            .unwrap();
        assert_eq!(record.digest, seed.digest);
        assert_eq!(record.size, 200_000);

        let path = store.lookup(&seed.digest).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
        seed.cancel.cancel();
    }

    #[tokio::test]
    async fn test_download_17_byte_blob() {
        let data = b"seventeen bytes!!";
        assert_eq!(data.len(), 17);
        let seed = seed_with(data, 64 * 1024).await;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let dl = downloader(store.clone());

        let record = dl
            .download(&seed.digest, &[seed.client_conn.clone()], &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(record.size, 17);
        let path = store.lookup(&seed.digest).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
        seed.cancel.cancel();
    }

    #[tokio::test]
    async fn test_download_zero_byte_blob() {
        let seed = seed_with(b"", 64 * 1024).await;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let dl = downloader(store.clone());

        let record = dl
            .download(&seed.digest, &[seed.client_conn.clone()], &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(record.size, 0);
        // SHA-256 of empty input.
        assert_eq!(
            record.digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        seed.cancel.cancel();
    }

    #[tokio::test]
    async fn test_resume_from_partial_prefix() {
        // 1 MiB + 1 byte: 17 chunks at 64 KiB.
        let data: Vec<u8> = (0..1_048_577u32).map(|i| (i % 251) as u8).collect();
        let chunk = 64 * 1024u32;
        let seed = seed_with(&data, chunk).await;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        // Ten chunks already on disk from an interrupted run.
        let prefix = &data[..10 * chunk as usize];
        std::fs::write(store.partial_path(&seed.digest), prefix).unwrap();

        let dl = downloader(store.clone());
        let record = dl
            .download(&seed.digest, &[seed.client_conn.clone()], &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(record.size, 1_048_577);

        let path = store.lookup(&seed.digest).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
        seed.cancel.cancel();
    }

    #[tokio::test]
    async fn test_resume_with_ragged_partial_truncates() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        let chunk = 64 * 1024u32;
        let seed = seed_with(&data, chunk).await;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        // Partial ends mid-chunk; resume truncates to the boundary.
        let ragged = &data[..chunk as usize + 1000];
        std::fs::write(store.partial_path(&seed.digest), ragged).unwrap();

        let dl = downloader(store.clone());
        dl.download(&seed.digest, &[seed.client_conn.clone()], &CancelFlag::new())
            .await
            .unwrap();
        let path = store.lookup(&seed.digest).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
        seed.cancel.cancel();
    }

    /// A hostile seed: valid metadata, then chunks with flipped bits.
    async fn malicious_seed(data: Vec<u8>, chunk_size: u32) -> (Arc<Connection>, String) {
        let digest = bytes_digest(&data);
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client_chan: BoxedChannel = Arc::new(
            TcpChannel::connect(acceptor.local_addr(), TransportKind::DirectTcp)
                .await
                .unwrap(),
        );
        let server_chan: BoxedChannel = Arc::new(acceptor.accept().await.unwrap());

        let evil_digest = digest.clone();
        tokio::spawn(async move {
            while let Some(frame) = server_chan.recv().await {
                match frame {
                    Frame::MetadataRequest { .. } => {
                        let _ = server_chan
                            .send(Frame::MetadataResponse {
                                digest: evil_digest.clone(),
                                total_bytes: data.len() as u64,
                                total_chunks: chunk_count(data.len() as u64, chunk_size),
                                chunk_size,
                            })
                            .await;
                    }
                    Frame::ChunkRequest { chunk_index, .. } => {
                        let start = chunk_index as usize * chunk_size as usize;
                        let end = (start + chunk_size as usize).min(data.len());
                        let mut bytes = data[start..end].to_vec();
                        if chunk_index == 1 {
                            bytes[0] ^= 0xFF; // corrupt chunk 1
                        }
                        let _ = server_chan
                            .send(Frame::ChunkResponse {
                                digest: evil_digest.clone(),
                                chunk_index,
                                data: bytes,
                            })
                            .await;
                    }
                    _ => {}
                }
            }
        });

        let (conn, _rx) = Connection::new(NodeId::random(), TransportKind::DirectTcp, client_chan);
        (conn, digest)
    }

    #[tokio::test]
    async fn test_corrupt_chunk_fails_integrity_and_deletes_partial() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 199) as u8).collect();
        let (conn, digest) = malicious_seed(data, 64 * 1024).await;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let dl = downloader(store.clone());

        let err = dl
            .download(&digest, &[conn], &CancelFlag::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "integrity-failure");
        assert!(store.lookup(&digest).is_none());
        assert!(!store.partial_path(&digest).exists(), "partial must be discarded");
    }

    #[tokio::test]
    async fn test_cancel_leaves_partial_for_resume() {
        let data: Vec<u8> = (0..2_000_000u32).map(|i| (i % 223) as u8).collect();
        let seed = seed_with(&data, 16 * 1024).await;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let dl = downloader(store.clone());
        let cancel = CancelFlag::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = dl
            .download(&seed.digest, &[seed.client_conn.clone()], &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        // Whatever made it to disk stays for the next attempt.
        assert!(store.lookup(&seed.digest).is_none());
        seed.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_digest_fails() {
        let seed = seed_with(b"some data", 64 * 1024).await;
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let dl = downloader(store);

        let missing = "11".repeat(32);
        let err = dl
            .download(&missing, &[seed.client_conn.clone()], &CancelFlag::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not-found");
        seed.cancel.cancel();
    }

    #[tokio::test]
    async fn test_no_sources_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let dl = downloader(store);
        let err = dl
            .download(&"ab".repeat(32), &[], &CancelFlag::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "peer-not-found");
    }
}
