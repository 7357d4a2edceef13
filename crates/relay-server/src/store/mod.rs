//! Temporary storage for request and response bodies that are too large to
//! travel inline in a relay message.
//!
//! Entries are keyed by request id. A response body may be written under a
//! temporary id first and renamed once the request it belongs to is known.
//! Every write refreshes the entry's last-write timestamp; [`BodyStore::sweep`]
//! drops everything that has not been written to within the retention window,
//! which also reclaims streams whose writer went away without finishing.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};

use crate::{error::StoreError, util::is_valid_id};

mod disk;
mod memory;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BodyWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub type FileBodyStore = TemporaryStore<DiskBackend>;
pub type MemoryBodyStore = TemporaryStore<MemoryBackend>;

#[async_trait]
pub trait BodyStore: Send + Sync {
    async fn create_request_stream(&self, id: &str) -> Result<BodyWriter, StoreError>;

    async fn get_request_stream(&self, id: &str) -> Result<BodyReader, StoreError>;

    async fn create_response_stream(&self, id: &str) -> Result<BodyWriter, StoreError>;

    async fn get_response_stream(&self, id: &str) -> Result<BodyReader, StoreError>;

    /// Moves a finished response body from `temporary_id` to `id` and returns
    /// its length in bytes. Retrying a rename that already happened returns
    /// the same length.
    async fn rename_response_stream(&self, temporary_id: &str, id: &str)
    -> Result<u64, StoreError>;

    /// Removing an entry that does not exist is not an error.
    async fn remove_request_stream(&self, id: &str) -> Result<(), StoreError>;

    async fn remove_response_stream(&self, id: &str) -> Result<(), StoreError>;

    /// Drops all entries not written to within `retention`. Returns how many were removed.
    async fn sweep(&self, retention: Duration) -> Result<usize, StoreError>;

    fn contains_request(&self, id: &str) -> bool;

    fn contains_response(&self, id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub kind: Kind,
    pub id: String,
}

impl Key {
    fn new(kind: Kind, id: &str) -> Result<Self, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }
}

/// Where the bytes actually live.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn writer(&self, key: &Key) -> io::Result<BodyWriter>;

    async fn reader(&self, key: &Key) -> io::Result<BodyReader>;

    async fn rename(&self, from: &Key, to: &Key) -> io::Result<()>;

    async fn delete(&self, key: &Key) -> io::Result<()>;
}

#[derive(Debug, Default)]
struct Entry {
    last_write: AtomicU64,
    length: AtomicU64,
    complete: AtomicBool,
    renamed_from: Option<String>,
}

impl Entry {
    fn touch(&self, epoch: Instant) {
        self.last_write
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

pub struct TemporaryStore<B> {
    backend: B,
    epoch: Instant,
    entries: Mutex<HashMap<Key, Arc<Entry>>>,
}

impl TemporaryStore<MemoryBackend> {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }
}

impl TemporaryStore<DiskBackend> {
    pub async fn on_disk(dir: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::new(DiskBackend::create(dir).await?))
    }
}

impl<B: Backend> TemporaryStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            epoch: Instant::now(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, Arc<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn create(&self, kind: Kind, id: &str) -> Result<BodyWriter, StoreError> {
        let key = Key::new(kind, id)?;
        let entry = Arc::new(Entry::default());
        entry.touch(self.epoch);

        {
            let mut entries = self.entries();
            if entries.contains_key(&key) {
                return Err(StoreError::Conflict(id.to_string()));
            }
            entries.insert(key.clone(), entry.clone());
        }

        match self.backend.writer(&key).await {
            Ok(inner) => Ok(Box::pin(TrackedWriter {
                inner,
                entry,
                epoch: self.epoch,
            })),
            Err(err) => {
                self.entries().remove(&key);
                Err(err.into())
            }
        }
    }

    async fn get(&self, kind: Kind, id: &str) -> Result<BodyReader, StoreError> {
        let key = Key::new(kind, id)?;
        let complete = self
            .entries()
            .get(&key)
            .map(|entry| entry.complete.load(Ordering::Acquire));
        match complete {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(false) => Err(StoreError::Conflict(id.to_string())),
            Some(true) => Ok(self.backend.reader(&key).await?),
        }
    }

    async fn remove(&self, kind: Kind, id: &str) -> Result<(), StoreError> {
        let key = Key::new(kind, id)?;
        let removed = self.entries().remove(&key).is_some();
        if removed {
            self.backend.delete(&key).await?;
        }
        Ok(())
    }

    fn contains(&self, kind: Kind, id: &str) -> bool {
        Key::new(kind, id).is_ok_and(|key| self.entries().contains_key(&key))
    }
}

#[async_trait]
impl<B: Backend> BodyStore for TemporaryStore<B> {
    async fn create_request_stream(&self, id: &str) -> Result<BodyWriter, StoreError> {
        self.create(Kind::Request, id).await
    }

    async fn get_request_stream(&self, id: &str) -> Result<BodyReader, StoreError> {
        self.get(Kind::Request, id).await
    }

    async fn create_response_stream(&self, id: &str) -> Result<BodyWriter, StoreError> {
        self.create(Kind::Response, id).await
    }

    async fn get_response_stream(&self, id: &str) -> Result<BodyReader, StoreError> {
        self.get(Kind::Response, id).await
    }

    async fn rename_response_stream(
        &self,
        temporary_id: &str,
        id: &str,
    ) -> Result<u64, StoreError> {
        let from = Key::new(Kind::Response, temporary_id)?;
        let to = Key::new(Kind::Response, id)?;

        // The target is reserved before the backend moves any bytes, so a
        // concurrent create or rename of `id` sees a conflict.
        let (source, target) = {
            let mut entries = self.entries();
            let Some(source) = entries.get(&from).cloned() else {
                return match entries.get(&to) {
                    Some(done) if done.renamed_from.as_deref() == Some(temporary_id) => {
                        Ok(done.length.load(Ordering::Acquire))
                    }
                    _ => Err(StoreError::NotFound(temporary_id.to_string())),
                };
            };
            if !source.complete.load(Ordering::Acquire) {
                return Err(StoreError::Conflict(temporary_id.to_string()));
            }
            if entries.contains_key(&to) {
                return Err(StoreError::Conflict(id.to_string()));
            }

            let target = Arc::new(Entry {
                renamed_from: Some(temporary_id.to_string()),
                ..Default::default()
            });
            target
                .length
                .store(source.length.load(Ordering::Acquire), Ordering::Release);
            target.touch(self.epoch);

            entries.remove(&from);
            entries.insert(to.clone(), target.clone());
            (source, target)
        };

        if let Err(err) = self.backend.rename(&from, &to).await {
            let mut entries = self.entries();
            entries.remove(&to);
            entries.insert(from, source);
            return Err(err.into());
        }

        target.complete.store(true, Ordering::Release);
        Ok(target.length.load(Ordering::Acquire))
    }

    async fn remove_request_stream(&self, id: &str) -> Result<(), StoreError> {
        self.remove(Kind::Request, id).await
    }

    async fn remove_response_stream(&self, id: &str) -> Result<(), StoreError> {
        self.remove(Kind::Response, id).await
    }

    async fn sweep(&self, retention: Duration) -> Result<usize, StoreError> {
        let now = self.epoch.elapsed().as_millis() as u64;
        let cutoff = retention.as_millis() as u64;

        let expired: Vec<Key> = {
            let mut entries = self.entries();
            let keys: Vec<Key> = entries
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.last_write.load(Ordering::Relaxed)) > cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        for key in &expired {
            tracing::debug!(kind = ?key.kind, id = %key.id, "🧹 reclaiming expired body stream");
            if let Err(err) = self.backend.delete(key).await {
                tracing::warn!(id = %key.id, "failed to delete expired body stream: {err}");
            }
        }

        Ok(expired.len())
    }

    fn contains_request(&self, id: &str) -> bool {
        self.contains(Kind::Request, id)
    }

    fn contains_response(&self, id: &str) -> bool {
        self.contains(Kind::Response, id)
    }
}

/// Keeps the index entry's length and last-write timestamp current and marks
/// the entry complete once the writer is shut down.
struct TrackedWriter {
    inner: BodyWriter,
    entry: Arc<Entry>,
    epoch: Instant,
}

impl AsyncWrite for TrackedWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = this.inner.as_mut().poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.entry
                .length
                .fetch_add(*written as u64, Ordering::AcqRel);
            this.entry.touch(this.epoch);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let poll = this.inner.as_mut().poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = &poll {
            this.entry.touch(this.epoch);
            this.entry.complete.store(true, Ordering::Release);
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn write_response(store: &dyn BodyStore, id: &str, data: &[u8]) {
        let mut writer = store.create_response_stream(id).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.shutdown().await.unwrap();
    }

    async fn read_all(mut reader: BodyReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn exercise(store: &dyn BodyStore) {
        let mut writer = store.create_request_stream("req1").await.unwrap();
        assert!(matches!(
            store.create_request_stream("req1").await,
            Err(StoreError::Conflict(_))
        ));
        // still being written
        assert!(matches!(
            store.get_request_stream("req1").await,
            Err(StoreError::Conflict(_))
        ));
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let body = read_all(store.get_request_stream("req1").await.unwrap()).await;
        assert_eq!(body, b"hello world");

        store.remove_request_stream("req1").await.unwrap();
        store.remove_request_stream("req1").await.unwrap();
        assert!(!store.contains_request("req1"));
        assert!(matches!(
            store.get_request_stream("req1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_streams() {
        exercise(&MemoryBodyStore::in_memory()).await;
    }

    #[tokio::test]
    async fn test_disk_store_streams() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBodyStore::on_disk(dir.path()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_rename_is_idempotent_and_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBodyStore::on_disk(dir.path()).await.unwrap();
        write_response(&store, "tmp-1", b"0123456789").await;

        assert_eq!(store.rename_response_stream("tmp-1", "req1").await.unwrap(), 10);
        assert_eq!(store.rename_response_stream("tmp-1", "req1").await.unwrap(), 10);
        assert!(!store.contains_response("tmp-1"));

        let body = read_all(store.get_response_stream("req1").await.unwrap()).await;
        assert_eq!(body, b"0123456789");
    }

    #[tokio::test]
    async fn test_rename_of_unknown_temporary_id_is_not_found() {
        let store = MemoryBodyStore::in_memory();
        assert!(matches!(
            store.rename_response_stream("never-written", "req1").await,
            Err(StoreError::NotFound(id)) if id == "never-written"
        ));
        assert!(!store.contains_response("req1"));
    }

    #[tokio::test]
    async fn test_rename_onto_existing_id_conflicts() {
        let store = MemoryBodyStore::in_memory();
        write_response(&store, "tmp-1", b"a").await;
        write_response(&store, "req1", b"b").await;

        assert!(matches!(
            store.rename_response_stream("tmp-1", "req1").await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.contains_response("tmp-1"));
    }

    #[tokio::test]
    async fn test_invalid_ids_are_rejected() {
        let store = MemoryBodyStore::in_memory();
        assert!(matches!(
            store.create_request_stream("../../etc").await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_orphaned_streams() {
        let store = MemoryBodyStore::in_memory();

        // writer that never finishes
        let mut orphan = store.create_request_stream("orphan").await.unwrap();
        orphan.write_all(b"partial").await.unwrap();
        drop(orphan);

        tokio::time::advance(Duration::from_secs(30)).await;
        write_response(&store, "fresh", b"data").await;

        assert_eq!(store.sweep(Duration::from_secs(10)).await.unwrap(), 1);
        assert!(!store.contains_request("orphan"));
        assert!(store.contains_response("fresh"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.sweep(Duration::from_secs(10)).await.unwrap(), 1);
        assert!(!store.contains_response("fresh"));
    }
}
