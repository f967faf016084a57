use clap::{Arg, ArgAction, Command};
use crc32fast::Hasher as Crc32;
use json_ingest::{
    process_json_stream, reader_from_path, Batch, IngestSummary, NdjsonDirSink, PatternRule,
    PipelineConfig, RuleSet, SinkError,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("bench")
        .arg(Arg::new("path").long("path").required(true).value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("rule").long("rule").help("PATTERN=OUTPUT_PATH, repeatable; replaces the built-in rules").action(ArgAction::Append))
        .arg(Arg::new("capacity").long("capacity").help("Batch capacity C").value_parser(clap::value_parser!(usize)).default_value("10000"))
        .arg(Arg::new("no-hash").long("no-hash").help("Write sensitive fields unhashed").action(ArgAction::SetTrue))
        .arg(Arg::new("out").long("out").help("Write each batch as NDJSON into this directory").value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("verify").long("verify").help("CRC32 over every submitted fragment (ignored with --out)").action(ArgAction::SetTrue))
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("json_ingest=info")),
        )
        .init();

    let rules = match matches.get_many::<String>("rule") {
        Some(specs) => RuleSet::new(
            specs
                .map(|s| PatternRule::parse(s))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => RuleSet::default(),
    };
    let config = PipelineConfig {
        batch_capacity: *matches.get_one::<usize>("capacity").unwrap(),
        hashing_enabled: !matches.get_flag("no-hash"),
        rules,
        ..Default::default()
    };

    let path = matches.get_one::<PathBuf>("path").unwrap();
    let start = Instant::now();
    let (reader, _meta) = reader_from_path(path).await?;

    let (summary, crc) = if let Some(dir) = matches.get_one::<PathBuf>("out") {
        let sink = NdjsonDirSink::create(dir).await?;
        (process_json_stream(reader, sink, config).await?, None)
    } else {
        let verify = matches.get_flag("verify");
        let crc = Arc::new(Mutex::new(Crc32::new()));
        let digest = crc.clone();
        let sink = move |batch: Batch| {
            let result = if verify { checksum(&digest, &batch) } else { Ok(()) };
            futures::future::ready(result)
        };
        let summary = process_json_stream(reader, sink, config).await?;
        let crc = verify.then(|| crc.lock().map(|h| h.clone().finalize()).unwrap_or_default());
        (summary, crc)
    };

    report(path, &summary, crc, start.elapsed().as_secs_f64());
    Ok(())
}

// accumulate CRC32 over each fragment's JSON, newline separated
fn checksum(crc: &Mutex<Crc32>, batch: &Batch) -> Result<(), SinkError> {
    let mut hasher = crc
        .lock()
        .map_err(|_| SinkError::Rejected("checksum state poisoned".into()))?;
    for fragment in batch.fragments() {
        hasher.update(&serde_json::to_vec(fragment)?);
        hasher.update(b"\n");
    }
    Ok(())
}

fn report(path: &std::path::Path, summary: &IngestSummary, crc: Option<u32>, elapsed: f64) {
    let rps = (summary.records as f64) / elapsed;
    let mapped: Vec<String> = summary
        .schema
        .iter()
        .map(|(label, out)| format!("{label}->{out}"))
        .collect();
    println!(
        "source={} records={} fragments={} batches={} capacity={} schema={:?}",
        path.display(),
        summary.records,
        summary.fragments,
        summary.batches_submitted,
        summary.batch_capacity,
        mapped
    );
    if let Some(d) = crc {
        println!("crc=0x{d:08x}");
    }
    println!("elapsed={elapsed:.1}s rows/sec={rps:.0}");
}
