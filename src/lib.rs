//! Streaming JSON-array ingestion for identifier uploads.
//!
//! - Input: any `AsyncRead` carrying one JSON array of flat objects, optionally
//!   gzip/zstd compressed or in a non-UTF-8 charset (see [`build_json_reader`]).
//! - The first record fixes the column -> output-path mapping; columns no rule
//!   matches are dropped.
//! - Every matched column becomes its own single-field [`Fragment`]; fields whose
//!   output name carries the hashing marker are normalized and SHA-256 hashed.
//! - Fragments are queued and handed to a [`BatchSink`] in batches. Submissions
//!   are not awaited until the stream is exhausted, and all of them are awaited
//!   before the run reports back.
//!
//! Data shape:
//! - `IngestSummary { records, fragments, batches_submitted, batch_capacity, schema }`
//! - Records: `serde_json::Map<String, Value>` in document column order
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod batch;
mod codec;
mod hash;
mod io;
mod pipeline;
mod schema;
mod sink;
mod transform;

pub use crate::batch::{Batch, BatchAccumulator, DEFAULT_BATCH_CAPACITY};
pub use crate::codec::{JsonArrayDecoder, Utf8Transcoder, DEFAULT_MAX_RECORD_BYTES};
pub use crate::hash::normalize_and_hash;
pub use crate::io::{build_json_reader, reader_from_path, StreamMeta};
pub use crate::pipeline::{Pipeline, PipelineConfig, RunState};
pub use crate::schema::{OutputPath, PatternRule, RuleSet, SchemaMapping};
pub use crate::sink::{BatchSink, NdjsonDirSink, SinkError, Submission};
pub use crate::transform::{Fragment, RowTransformer};

use thiserror::Error;
use tokio::io::AsyncRead;

/// One decoded element of the input array.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Completion report for a run.
#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub records: u64,
    pub fragments: u64,
    pub batches_submitted: usize,
    pub batch_capacity: usize,
    pub schema: SchemaMapping,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed JSON stream at byte {offset}: {reason}")]
    Decode { offset: u64, reason: String },
    #[error("JSON stream ended at byte {offset} before the closing ']'")]
    Truncated { offset: u64 },
    #[error("record at byte {offset} exceeds {limit} bytes")]
    RecordTooLarge { offset: u64, limit: usize },
    #[error("invalid record at byte {offset}: {source}")]
    Record {
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid rule `{rule}`: {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{failed} of {submitted} batch submissions failed; first error: {source}")]
    Submission {
        failed: usize,
        submitted: usize,
        #[source]
        source: SinkError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Run the whole pipeline over `reader` with a fresh [`Pipeline`].
pub async fn process_json_stream<R, S>(
    reader: R,
    sink: S,
    config: PipelineConfig,
) -> IngestResult<IngestSummary>
where
    R: AsyncRead + Unpin,
    S: BatchSink,
{
    Pipeline::new(sink, config)?.run(reader).await
}
