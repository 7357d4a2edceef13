use async_trait::async_trait;
use std::{io, path::PathBuf};

use super::{Backend, BodyReader, BodyWriter, Key, Kind};

/// Stores each body as one file below `dir`.
#[derive(Debug)]
pub struct DiskBackend {
    dir: PathBuf,
}

impl DiskBackend {
    pub async fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, key: &Key) -> PathBuf {
        let suffix = match key.kind {
            Kind::Request => "req",
            Kind::Response => "res",
        };
        self.dir.join(format!("{}.{suffix}", key.id))
    }
}

#[async_trait]
impl Backend for DiskBackend {
    async fn writer(&self, key: &Key) -> io::Result<BodyWriter> {
        let file = tokio::fs::File::create(self.path(key)).await?;
        Ok(Box::pin(file))
    }

    async fn reader(&self, key: &Key) -> io::Result<BodyReader> {
        let file = tokio::fs::File::open(self.path(key)).await?;
        Ok(Box::pin(file))
    }

    async fn rename(&self, from: &Key, to: &Key) -> io::Result<()> {
        tokio::fs::rename(self.path(from), self.path(to)).await
    }

    async fn delete(&self, key: &Key) -> io::Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }
}
