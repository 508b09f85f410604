//! Polaris ledger sink
//!
//! Replays newline-delimited anchored events (as emitted by the ledger
//! extractor) through the ingestion pipeline and prints one JSON outcome per
//! line on stdout. Logs go to stderr.
//!
//! The graph lives in memory. When an event log is configured, the graph is
//! rebuilt from it before the first new event is read.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use polaris_core::config::PolarisConfig;
use polaris_core::ingest::{AnchoredEvent, IngestRuntime, IngestionPipeline};
use polaris_core::storage::persistent::FileEventStore;
use polaris_core::storage::{EventStore, InMemoryEventStore, InMemoryGraphStore};
use polaris_core::{PolarisError, StoredEvent};

/// Command-line options
#[derive(Default)]
struct Args {
    /// TOML config file
    config: Option<PathBuf>,
    /// NDJSON input; stdin when unset
    events: Option<PathBuf>,
    /// Emit logs as JSON
    log_json: bool,
}

fn usage() {
    println!("polaris-sink - replay anchored events into the Polaris identity core");
    println!();
    println!("USAGE:");
    println!("    polaris-sink [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>    TOML config file");
    println!("    -e, --events <FILE>    NDJSON anchored events [default: stdin]");
    println!("        --log-json         Emit logs as JSON");
    println!("    -h, --help             Print help information");
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            flag @ ("--config" | "-c" | "--events" | "-e") => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("error: {flag} requires a value");
                    std::process::exit(1);
                };
                let path = Some(PathBuf::from(value));
                if matches!(flag, "--config" | "-c") {
                    parsed.config = path;
                } else {
                    parsed.events = path;
                }
                i += 2;
            }
            "--log-json" => {
                parsed.log_json = true;
                i += 1;
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }
    parsed
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => PolarisConfig::from_file(path)?,
        None => PolarisConfig::default(),
    };

    let graph = Arc::new(InMemoryGraphStore::with_retarget_mode(config.storage.retarget_mode));
    let (events, stored): (Arc<dyn EventStore>, Vec<StoredEvent>) = match &config.storage.event_log_path {
        Some(path) => {
            let store = FileEventStore::open(path, config.storage.sync_on_write).map_err(PolarisError::from)?;
            let stored = store.events_in_order().map_err(PolarisError::from)?;
            (Arc::new(store), stored)
        }
        None => (Arc::new(InMemoryEventStore::new()), Vec::new()),
    };
    let pipeline = Arc::new(IngestionPipeline::from_config(graph, events, &config));
    if !stored.is_empty() {
        pipeline.restore(stored)?;
    }
    let runtime = IngestRuntime::start(Arc::clone(&pipeline), &config.runtime())?;

    let input: Box<dyn BufRead> = match &args.events {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let mut out = BufWriter::new(io::stdout().lock());

    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let anchored: AnchoredEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(line = line_no + 1, error = %e, "unparseable input line");
                continue;
            }
        };

        // The sink preserves ledger order, so events are applied one at a time.
        let record = match runtime.ingest(anchored) {
            Ok(outcome) => serde_json::to_value(&outcome)?,
            Err(e) => serde_json::json!({ "line": line_no + 1, "error": e.report() }),
        };
        writeln!(out, "{record}")?;
    }
    out.flush()?;

    let stats = pipeline.stats().snapshot();
    tracing::info!(
        received = stats.received,
        processed = stats.processed,
        duplicates = stats.duplicates,
        skipped = stats.skipped,
        failed = stats.failed,
        hash_mismatches = stats.hash_mismatches,
        "replay finished"
    );
    Ok(())
}

fn main() {
    let args = parse_args();
    init_logging(args.log_json);

    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "polaris-sink failed");
        std::process::exit(1);
    }
}
