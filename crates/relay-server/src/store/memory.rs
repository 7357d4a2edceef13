use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};
use tokio::io::AsyncWrite;

use super::{Backend, BodyReader, BodyWriter, Key};

type Buffer = Arc<Mutex<Vec<u8>>>;

/// Keeps bodies in process memory. Meant for tests and single instance setups
/// with small payloads.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buffers: Mutex<HashMap<Key, Buffer>>,
}

impl MemoryBackend {
    fn buffers(&self) -> MutexGuard<'_, HashMap<Key, Buffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(key: &Key) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no buffer for {}", key.id))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn writer(&self, key: &Key) -> io::Result<BodyWriter> {
        let buffer = Buffer::default();
        self.buffers().insert(key.clone(), buffer.clone());
        Ok(Box::pin(MemoryWriter { buffer }))
    }

    async fn reader(&self, key: &Key) -> io::Result<BodyReader> {
        let buffer = self.buffers().get(key).cloned().ok_or_else(|| not_found(key))?;
        let data = Bytes::from(buffer.lock().unwrap_or_else(PoisonError::into_inner).clone());
        Ok(Box::pin(io::Cursor::new(data)))
    }

    async fn rename(&self, from: &Key, to: &Key) -> io::Result<()> {
        let mut buffers = self.buffers();
        let buffer = buffers.remove(from).ok_or_else(|| not_found(from))?;
        buffers.insert(to.clone(), buffer);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> io::Result<()> {
        self.buffers().remove(key);
        Ok(())
    }
}

struct MemoryWriter {
    buffer: Buffer,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
