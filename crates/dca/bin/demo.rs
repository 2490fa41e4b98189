//! # Diagnostics Collection Agent Demo
//!
//! Runs the agent core end to end against a scratch directory.
//!
//! ## What it does
//!
//! 1. Loads an `AgentConfig` (optional JSON path as the first argument,
//!    `DCA_QUEUE_CAPACITY` override) and enables the configured plugins
//! 2. Resolves the trace session folder through the session cache
//! 3. Runs one decode pass per synthetic trace file, concurrently, through the
//!    configured event filter, fanning events out to a CSV consumer (retrying
//!    its writes) and an in-memory consumer
//! 4. Runs the same passes again to show the resumed consumers skip what
//!    they already have
//! 5. Trims the CSV output folder against a simulated upstream copy
//!
//! ## Running
//!
//! ```bash
//! DCA_LOG_LEVEL=info cargo run -p dca --bin demo
//! DCA_LOG_LEVEL=debug cargo run -p dca --bin demo -- agent.json --files 8
//! ```

use anyhow::{Context, Result};
use dca::consumers::RESUME_STATE_FILE;
use dca::{
    logging, AgentConfig, ConsumerRegistry, CsvFileConsumer, DecodeError, DecodePass, DecodeSource, DecodedRecord,
    DirectorySessionResolver, FolderTrimmer, LocalUpstream, MemoryConsumer, PassReport, PluginFlags, PluginKind,
    SessionFolderCache,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const SESSION: &str = "FabricTraces";

// =============================================================================
// SYNTHETIC DECODE SOURCE
// =============================================================================

/// Generates plausible trace records; roughly one in fifty lacks a task name.
struct SyntheticSource {
    rng: StdRng,
    remaining: usize,
    timestamp: i64,
}

impl SyntheticSource {
    fn new(seed: u64, events: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            remaining: events,
            timestamp: 133_500_000_000_000_000,
        }
    }
}

const TASKS: &[(&str, &str)] = &[
    ("Hosting", "ApplicationActivated"),
    ("RA", "ReplicaOpen"),
    ("Lease", "Renewed"),
    ("Transport", "MessageSent"),
];

impl DecodeSource for SyntheticSource {
    async fn next_record(&mut self) -> Option<Result<DecodedRecord, DecodeError>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        // Bursts of events share a timestamp.
        if self.rng.gen_bool(0.6) {
            self.timestamp += self.rng.gen_range(1..10_000);
        }
        let (task, event_type) = TASKS[self.rng.gen_range(0..TASKS.len())];
        let malformed = self.rng.gen_ratio(1, 50);
        tokio::task::yield_now().await;

        Some(Ok(DecodedRecord {
            timestamp: self.timestamp,
            task_name: (!malformed).then(|| task.to_string()),
            event_type: Some(event_type.to_string()),
            level: self.rng.gen_range(1..=5),
            thread_id: self.rng.gen_range(1..64),
            process_id: 4200,
            text: format!("{task} {event_type}\r\nseq={}", self.remaining),
        }))
    }
}

// =============================================================================
// SETUP
// =============================================================================

struct Args {
    config: Option<PathBuf>,
    files: usize,
    events: usize,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        files: 4,
        events: 2_000,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--files" => args.files = iter.next().context("--files needs a value")?.parse()?,
            "--events" => args.events = iter.next().context("--events needs a value")?.parse()?,
            path => args.config = Some(PathBuf::from(path)),
        }
    }
    Ok(args)
}

fn enabled_plugins(config: &AgentConfig) -> Result<PluginFlags> {
    let flags = config.plugin_flags()?;
    if flags.is_empty() {
        return Ok(PluginKind::FileShareEtwCsvUploader | PluginKind::MdsEtwEventUploader);
    }
    Ok(flags)
}

async fn run_passes(
    registry: &ConsumerRegistry,
    flags: PluginFlags,
    config: &AgentConfig,
    trace_folder: &Path,
    args: &Args,
) -> Result<Vec<PassReport>> {
    let filter = config.event_filter()?;
    let passes: Vec<_> = (0..args.files)
        .map(|n| {
            let trace_file = trace_folder.join(format!("Calc_App{n}")).join(format!("trace_{n}.etl"));
            let mut pass = DecodePass::new(trace_file.display().to_string(), registry.active(flags), config.delivery_config())
                .with_active_file(n + 1 == args.files)
                .with_filter(filter.clone());
            if let Some(budget) = config.delivery_pass_length() {
                pass = pass.with_time_budget(budget);
            }
            let source = SyntheticSource::new(n as u64, args.events);
            tokio::spawn(async move { pass.run(source).await })
        })
        .collect();

    let mut reports = Vec::with_capacity(passes.len());
    for pass in passes {
        reports.push(pass.await??);
    }
    Ok(reports)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = parse_args()?;
    let config = AgentConfig::from_env_and_file(args.config.as_deref())?;
    let flags = enabled_plugins(&config)?;
    info!(?flags, capacity = config.queue_capacity, "agent configured");

    let scratch = std::env::temp_dir().join(format!("dca-demo-{}", std::process::id()));
    let sessions = scratch.join("sessions");
    let output = scratch.join("share");
    let upstream = scratch.join("upstream");
    for dir in [&sessions.join(SESSION), &output, &upstream] {
        tokio::fs::create_dir_all(dir).await?;
    }

    // Session folder
    let session_cache = SessionFolderCache::new(DirectorySessionResolver::new(&sessions), config.retry.clone());
    let trace_folder = session_cache
        .folder_for(SESSION)
        .await
        .context("trace session folder did not resolve")?;

    // Consumers
    let csv = CsvFileConsumer::open("file-share", &output)
        .await?
        .with_retry(config.retry.clone());
    let memory = Arc::new(MemoryConsumer::new("mds"));
    let mut registry = ConsumerRegistry::new();
    registry.register(PluginKind::FileShareEtwCsvUploader, csv)?;
    registry.register_shared(PluginKind::MdsEtwEventUploader, memory.clone())?;

    // Decode passes
    for round in 1..=2 {
        for report in run_passes(&registry, flags, &config, &trace_folder, &args).await? {
            info!(
                round,
                trace_file = %report.trace_file,
                malformed = report.malformed,
                filtered = report.filtered,
                delivered = report.delivered,
                failed = report.failed,
                read = %report.read_record,
                delivery = %report.delivery_record,
                "pass finished"
            );
        }
    }
    info!(events = memory.deliveries().len(), "in-memory consumer totals");

    // Upstream keeps the resume state and every other application folder.
    tokio::fs::copy(output.join(RESUME_STATE_FILE), upstream.join(RESUME_STATE_FILE)).await?;
    for n in (0..args.files).step_by(2) {
        let app = format!("Calc_App{n}");
        let from = output.join(&app).join(format!("trace_{n}.csv"));
        let to = upstream.join(&app);
        tokio::fs::create_dir_all(&to).await?;
        tokio::fs::copy(&from, to.join(format!("trace_{n}.csv"))).await?;
    }
    let trimmer = FolderTrimmer::new(LocalUpstream::new(&upstream), config.trim.clone());
    let trim = trimmer.trim(&output).await?;
    info!(
        deleted = trim.files_deleted,
        expired = trim.files_expired,
        kept = trim.files_kept,
        folders_removed = trim.folders_removed,
        record = %trim.record,
        "cache trimmed"
    );

    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
        warn!(dir = %scratch.display(), error = %e, "cannot remove scratch directory");
    }
    Ok(())
}
