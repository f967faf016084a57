use futures::future::join_all;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchAccumulator, DEFAULT_BATCH_CAPACITY};
use crate::codec::{JsonArrayDecoder, DEFAULT_MAX_RECORD_BYTES};
use crate::schema::{RuleSet, SchemaMapping};
use crate::sink::{BatchSink, SinkError, Submission};
use crate::transform::RowTransformer;
use crate::{IngestError, IngestResult, IngestSummary, RawRecord};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Queue capacity `C`; a steady-state flush takes `C - 1` fragments.
    pub batch_capacity: usize,
    pub hashing_enabled: bool,
    /// Output paths whose leaf contains this are hashed.
    pub hash_marker: String,
    pub rules: RuleSet,
    /// Largest single array element the decoder will buffer.
    pub max_record_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            hashing_enabled: true,
            hash_marker: "hashed".to_string(),
            rules: RuleSet::default(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> IngestResult<()> {
        if self.batch_capacity < 2 {
            return Err(IngestError::InvalidConfig(format!(
                "batch capacity must be at least 2, got {}",
                self.batch_capacity
            )));
        }
        if self.max_record_bytes == 0 {
            return Err(IngestError::InvalidConfig(
                "max record size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Parsing,
    Draining,
    Done,
    Failed,
}

/// Drives one pass over a JSON-array stream: infer, transform, batch, submit.
///
/// Submissions are never awaited while parsing. Their completion handles are
/// kept and awaited together once the stream ends, whether it ended cleanly
/// or with a decode error.
pub struct Pipeline<S> {
    sink: S,
    config: PipelineConfig,
    transformer: RowTransformer,
    schema: Option<SchemaMapping>,
    queue: BatchAccumulator,
    pending: Vec<Submission>,
    state: RunState,
    records: u64,
    fragments: u64,
    batches: usize,
}

impl<S: BatchSink> Pipeline<S> {
    pub fn new(sink: S, config: PipelineConfig) -> IngestResult<Self> {
        config.validate()?;
        Ok(Self {
            sink,
            transformer: RowTransformer::new(config.hashing_enabled, config.hash_marker.clone()),
            queue: BatchAccumulator::new(config.batch_capacity),
            config,
            schema: None,
            pending: Vec::new(),
            state: RunState::Idle,
            records: 0,
            fragments: 0,
            batches: 0,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The mapping inferred from the first record, once one has been seen.
    pub fn schema(&self) -> Option<&SchemaMapping> {
        self.schema.as_ref()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub async fn run<R>(&mut self, reader: R) -> IngestResult<IngestSummary>
    where
        R: AsyncRead + Unpin,
    {
        if self.state != RunState::Idle {
            return Err(IngestError::InvalidConfig(
                "a pipeline can only run once".to_string(),
            ));
        }
        self.transition(RunState::Parsing);

        let decoder = JsonArrayDecoder::new(self.config.max_record_bytes);
        let mut records = FramedRead::with_capacity(reader, decoder, 1 << 16);
        let parsed = loop {
            match records.next().await {
                Some(Ok(record)) => self.ingest(&record),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };

        let decode_error = match parsed {
            Ok(()) => {
                self.transition(RunState::Draining);
                let last = self.queue.flush_all();
                if last.is_empty() {
                    debug!("final flush is empty, nothing to submit");
                } else {
                    self.submit(last);
                }
                None
            }
            Err(e) => {
                warn!(error = %e, records = self.records, "input stream failed to decode");
                if !self.queue.is_empty() {
                    warn!(
                        discarded = self.queue.len(),
                        "dropping fragments that were never flushed"
                    );
                    self.queue.flush_all();
                }
                self.transition(RunState::Failed);
                Some(e)
            }
        };

        let (failed, first_failure) = self.settle().await;
        if let Some(e) = decode_error {
            return Err(e);
        }
        if let Some(source) = first_failure {
            self.transition(RunState::Failed);
            return Err(IngestError::Submission {
                failed,
                submitted: self.batches,
                source,
            });
        }

        self.transition(RunState::Done);
        let summary = IngestSummary {
            records: self.records,
            fragments: self.fragments,
            batches_submitted: self.batches,
            batch_capacity: self.config.batch_capacity,
            schema: self.schema.clone().unwrap_or_default(),
        };
        info!(
            batches = summary.batches_submitted,
            capacity = summary.batch_capacity,
            records = summary.records,
            fragments = summary.fragments,
            "ingest complete"
        );
        Ok(summary)
    }

    fn ingest(&mut self, record: &RawRecord) {
        self.records += 1;
        let rules = &self.config.rules;
        let schema = self.schema.get_or_insert_with(|| {
            let inferred = SchemaMapping::infer(record, rules);
            debug!(
                columns = record.len(),
                mapped = inferred.len(),
                "schema inferred from first record"
            );
            inferred
        });
        let fragments = self.transformer.transform(record, schema);
        self.fragments += fragments.len() as u64;
        self.queue.push(fragments);

        // Only loops when a single record produced at least `C` fragments; keeps
        // the residue, and so the final batch, at or below `C`.
        while self.queue.ready() {
            let batch = self.queue.flush(self.queue.steady_flush_size());
            self.submit(batch);
        }
    }

    fn submit(&mut self, batch: Batch) {
        debug!(
            batch = self.batches,
            size = batch.len(),
            queued = self.queue.len(),
            "submitting batch"
        );
        self.pending.push(self.sink.submit(batch));
        self.batches += 1;
    }

    /// Await every outstanding submission; returns the failure count and the first failure.
    async fn settle(&mut self) -> (usize, Option<SinkError>) {
        let outcomes = join_all(self.pending.drain(..)).await;
        let mut failed = 0;
        let mut first = None;
        for (seq, outcome) in outcomes.into_iter().enumerate() {
            if let Err(e) = outcome {
                error!(batch = seq, error = %e, "batch submission failed");
                failed += 1;
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        (failed, first)
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::normalize_and_hash;
    use crate::schema::PatternRule;
    use crate::transform::Fragment;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<Batch>>>;

    fn recording_sink() -> (Seen, impl BatchSink) {
        let seen: Seen = Arc::default();
        let log = seen.clone();
        let sink = move |batch: Batch| {
            log.lock().unwrap().push(batch);
            futures::future::ready(Ok::<(), SinkError>(()))
        };
        (seen, sink)
    }

    fn email_rows(n: usize) -> String {
        let rows: Vec<String> = (0..n).map(|i| format!(r#"{{"email":"u{i}@x.io"}}"#)).collect();
        format!("[{}]", rows.join(","))
    }

    fn config(capacity: usize) -> PipelineConfig {
        PipelineConfig {
            batch_capacity: capacity,
            ..Default::default()
        }
    }

    fn sizes(seen: &Seen) -> Vec<usize> {
        seen.lock().unwrap().iter().map(Batch::len).collect()
    }

    #[tokio::test]
    async fn concrete_scenario_yields_unmerged_fragments() {
        let (seen, sink) = recording_sink();
        let config = PipelineConfig {
            rules: RuleSet::new(vec![
                PatternRule::new("email", "hashed_email").unwrap(),
                PatternRule::new("zip|postal", "address_info.postal_code").unwrap(),
            ]),
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(sink, config).unwrap();
        let input: &[u8] = br#"[{"Email":"A@B.com","Zip":"90210"}]"#;
        let summary = pipeline.run(input).await.unwrap();

        assert_eq!(pipeline.state(), RunState::Done);
        assert_eq!(summary.batches_submitted, 1);
        assert_eq!(summary.batch_capacity, 10_000);
        let batches = seen.lock().unwrap();
        let fragments: Vec<Value> = batches[0].fragments().iter().map(Fragment::to_json).collect();
        assert_eq!(
            fragments,
            vec![
                json!({ "hashed_email": normalize_and_hash("a@b.com") }),
                json!({ "address_info": { "postal_code": "90210" } }),
            ]
        );
    }

    #[tokio::test]
    async fn schema_is_frozen_after_first_record() {
        let (seen, sink) = recording_sink();
        let mut pipeline = Pipeline::new(sink, config(10)).unwrap();
        let input: &[u8] = br#"[{"Email":"a@b.com"},{"Phone":"555","Zip":"1"}]"#;
        let summary = pipeline.run(input).await.unwrap();

        assert_eq!(summary.schema.len(), 1);
        assert!(pipeline.schema().unwrap().get("Phone").is_none());
        let batches = seen.lock().unwrap();
        let values: Vec<Value> = batches[0].fragments().iter().map(Fragment::to_json).collect();
        assert_eq!(values[1], json!({ "hashed_email": null }));
        assert_eq!(summary.fragments, 2);
    }

    #[tokio::test]
    async fn steady_flushes_take_capacity_minus_one() {
        let (seen, sink) = recording_sink();
        let input = email_rows(25);
        let summary = Pipeline::new(sink, config(10))
            .unwrap()
            .run(input.as_bytes())
            .await
            .unwrap();
        assert_eq!(sizes(&seen), vec![9, 9, 7]);
        assert_eq!(summary.batches_submitted, 3);
        assert_eq!(summary.records, 25);
    }

    #[tokio::test]
    async fn final_flush_drains_residue() {
        let (seen, sink) = recording_sink();
        let input = email_rows(11);
        Pipeline::new(sink, config(10))
            .unwrap()
            .run(input.as_bytes())
            .await
            .unwrap();
        assert_eq!(sizes(&seen), vec![9, 2]);
    }

    #[tokio::test]
    async fn empty_array_submits_nothing() {
        let (seen, sink) = recording_sink();
        let mut pipeline = Pipeline::new(sink, config(10)).unwrap();
        let input: &[u8] = b"[]";
        let summary = pipeline.run(input).await.unwrap();
        assert_eq!(summary.batches_submitted, 0);
        assert!(summary.schema.is_empty());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(pipeline.state(), RunState::Done);
    }

    #[tokio::test]
    async fn rows_without_matches_are_skipped() {
        let (seen, sink) = recording_sink();
        let input: &[u8] = br#"[{"colour":"red"},{"colour":"blue"}]"#;
        let summary = Pipeline::new(sink, config(10)).unwrap().run(input).await.unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.fragments, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wide_record_is_flushed_until_below_threshold() {
        let (seen, sink) = recording_sink();
        let config = PipelineConfig {
            batch_capacity: 2,
            rules: RuleSet::new(vec![PatternRule::new("^c", "col").unwrap()]),
            ..Default::default()
        };
        let input: &[u8] = br#"[{"c1":1,"c2":2,"c3":3,"c4":4,"c5":5}]"#;
        Pipeline::new(sink, config).unwrap().run(input).await.unwrap();
        assert_eq!(sizes(&seen), vec![1, 1, 1, 2]);
    }

    #[tokio::test]
    async fn decode_failure_still_awaits_submitted_batches() {
        let completed = Arc::new(AtomicUsize::new(0));
        let done = completed.clone();
        let sink = move |_batch: Batch| {
            let done = done.clone();
            async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), SinkError>(())
            }
        };
        let mut pipeline = Pipeline::new(sink, config(2)).unwrap();
        let input: &[u8] =
            br#"[{"email":"a"},{"email":"b"},{"email":"c"},{"email":"d"} oops"#;
        let err = pipeline.run(input).await.unwrap_err();

        assert!(matches!(err, IngestError::Decode { .. }), "{err}");
        assert_eq!(pipeline.state(), RunState::Failed);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_submission_is_reported_after_all_complete() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = move |_batch: Batch| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SinkError::Rejected("quota exceeded".into()))
                } else {
                    Ok(())
                }
            }
        };
        let input = email_rows(25);
        let mut pipeline = Pipeline::new(sink, config(10)).unwrap();
        match pipeline.run(input.as_bytes()).await {
            Err(IngestError::Submission {
                failed, submitted, ..
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(submitted, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn parsing_continues_while_earlier_batches_are_pending() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = move |_batch: Batch| {
            let seq = counter.fetch_add(1, Ordering::SeqCst);
            let calls = counter.clone();
            async move {
                if seq == 0 {
                    // Batch 0 can only finish once batch 2 has been handed over.
                    for _ in 0..1_000 {
                        if calls.load(Ordering::SeqCst) > 2 {
                            return Ok(());
                        }
                        tokio::task::yield_now().await;
                    }
                    return Err(SinkError::Rejected("batch 0 awaited inline".into()));
                }
                Ok::<(), SinkError>(())
            }
        };
        let input = email_rows(25);
        let mut pipeline = Pipeline::new(sink, config(10)).unwrap();
        let summary = pipeline.run(input.as_bytes()).await.unwrap();
        assert_eq!(summary.batches_submitted, 3);
        assert_eq!(pipeline.state(), RunState::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sink_is_returned_after_run() {
        let (seen, sink) = recording_sink();
        let mut pipeline = Pipeline::new(sink, config(10)).unwrap();
        let input = email_rows(3);
        pipeline.run(input.as_bytes()).await.unwrap();
        let mut sink = pipeline.into_sink();
        sink.submit(Batch::default()).await.unwrap();
        assert_eq!(sizes(&seen), vec![3, 0]);
    }

    #[tokio::test]
    async fn pipeline_runs_only_once() {
        let (_seen, sink) = recording_sink();
        let mut pipeline = Pipeline::new(sink, config(10)).unwrap();
        let input: &[u8] = b"[]";
        pipeline.run(input).await.unwrap();
        assert!(matches!(
            pipeline.run(input).await,
            Err(IngestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn capacity_below_two_is_rejected() {
        let (_seen, sink) = recording_sink();
        assert!(matches!(
            Pipeline::new(sink, config(1)),
            Err(IngestError::InvalidConfig(_))
        ));
    }
}
