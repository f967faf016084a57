//! Upload sinks.
//!
//! `submit` starts the dispatch and hands back a completion future; the
//! pipeline keeps that future and only awaits it once parsing is over.
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;

use crate::batch::Batch;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink rejected batch: {0}")]
    Rejected(String),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("submission task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Completion handle for one in-flight batch.
pub type Submission = BoxFuture<'static, Result<(), SinkError>>;

pub trait BatchSink {
    fn submit(&mut self, batch: Batch) -> Submission;
}

impl<F, Fut> BatchSink for F
where
    F: FnMut(Batch) -> Fut,
    Fut: Future<Output = Result<(), SinkError>> + Send + 'static,
{
    fn submit(&mut self, batch: Batch) -> Submission {
        self(batch).boxed()
    }
}

/// Writes every batch to its own `batch-NNNNNN.ndjson` file, one fragment per line.
#[derive(Debug)]
pub struct NdjsonDirSink {
    dir: PathBuf,
    next_seq: u64,
}

impl NdjsonDirSink {
    pub async fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, next_seq: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batch_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("batch-{seq:06}.ndjson"))
    }
}

impl BatchSink for NdjsonDirSink {
    fn submit(&mut self, batch: Batch) -> Submission {
        let path = self.batch_path(self.next_seq);
        self.next_seq += 1;
        // Spawned so the write proceeds while the caller keeps parsing.
        let handle = tokio::spawn(write_ndjson(path, batch));
        async move { handle.await? }.boxed()
    }
}

async fn write_ndjson(path: PathBuf, batch: Batch) -> Result<(), SinkError> {
    let mut buf = Vec::with_capacity(batch.len() * 64);
    for fragment in batch.fragments() {
        serde_json::to_writer(&mut buf, fragment)?;
        buf.push(b'\n');
    }
    tokio::fs::write(&path, buf).await?;
    Ok(())
}
