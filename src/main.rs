use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use propline::checkpoint::{self, CheckpointManager};
use propline::export;
use propline::ingest::{IngestConfig, IngestOptions, IngestSummary};
use propline::progress::IngestEvent;
use propline::rebuild::rebuild_index;
use propline::stats::IngestStats;
use propline::store::{FileStore, IndexPrefix, ProjectionStore};
use propline::task::{spawn_ingest, spawn_rebuild};
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "propline")]
#[command(about = "Ingest player projection feeds into a local keyed store")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a projection feed into the store
    Ingest(IngestArgs),
    /// Recompute the composite index and player counts from stored records
    RebuildIndex(StoreArgs),
    /// List composite index entries for a league
    Lookup(LookupArgs),
    /// Export records and the player index as CSV
    Export(ExportArgs),
    /// Fold the store journal into a fresh snapshot
    Compact(StoreArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// Store directory
    #[arg(short, long)]
    store: String,
}

#[derive(Args)]
struct IngestArgs {
    /// Path to the projection feed (.json)
    #[arg(short, long)]
    input: String,

    /// Store directory
    #[arg(short, long)]
    store: String,

    /// Skip player count maintenance during the pass (run rebuild-index later)
    #[arg(long)]
    fast: bool,

    /// Rebuild the index right after the pass completes
    #[arg(long)]
    rebuild: bool,

    /// Resume from last checkpoint if available
    #[arg(long)]
    resume: bool,

    /// Clear the existing store and checkpoint before starting
    #[arg(long)]
    clean: bool,

    /// Number of transactions the pass is split into
    #[arg(long, default_value_t = propline::config::TARGET_TRANSACTIONS)]
    target_transactions: usize,

    /// Checkpoint interval in committed flushes
    #[arg(long, default_value_t = propline::config::CHECKPOINT_INTERVAL)]
    checkpoint_interval: u32,
}

#[derive(Args)]
struct LookupArgs {
    /// Store directory
    #[arg(short, long)]
    store: String,

    /// League name, e.g. NBA
    #[arg(long)]
    league: String,

    /// Restrict to one stat type
    #[arg(long)]
    stat: Option<String>,

    /// Player name prefix
    #[arg(long)]
    player: Option<String>,
}

#[derive(Args)]
struct ExportArgs {
    /// Store directory
    #[arg(short, long)]
    store: String,

    /// Output directory for CSV files
    #[arg(short, long)]
    output: String,
}

fn make_progress_bar(input_len: u64) -> ProgressBar {
    let pb = ProgressBar::new(input_len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {percent}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn run_ingest(args: IngestArgs) -> Result<()> {
    if args.clean {
        let store_path = Path::new(&args.store);
        if store_path.exists() {
            info!("Cleaning store directory: {}", args.store);
            fs::remove_dir_all(store_path)
                .with_context(|| format!("Failed to clean store directory: {}", args.store))?;
        }
    }

    let start_reading = Instant::now();
    let raw = fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read input: {}", args.input))?;
    let input_len = raw.len() as u64;
    info!(
        bytes = input_len,
        duration_secs = start_reading.elapsed().as_secs_f64(),
        "Input loaded"
    );

    let store = Arc::new(
        FileStore::open(&args.store)
            .with_context(|| format!("Failed to open store: {}", args.store))?,
    );
    let checkpoint_mgr = Arc::new(CheckpointManager::new(
        &args.input,
        &args.store,
        args.fast,
        args.checkpoint_interval,
    )?);

    let mut options = IngestOptions {
        fast_import: args.fast,
        config: IngestConfig {
            target_transactions: args.target_transactions,
            ..IngestConfig::default()
        },
        ..IngestOptions::default()
    };

    if args.resume && !args.clean {
        match checkpoint::load_if_valid(&args.input, &args.store, args.fast)? {
            Some(cp) => {
                let carried = IngestStats::from_checkpoint(&cp.stats);
                info!(
                    offset = cp.resume_offset,
                    records = carried.persisted(),
                    "Resuming from checkpoint"
                );
                options.resume_from = Some(cp.resume_offset);
                options.carried = Some(cp.stats);
            }
            None => info!("No valid checkpoint found, starting fresh"),
        }
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("propline-ingest-worker")
        .enable_time()
        .build()?;

    let start_ingesting = Instant::now();
    let summary: IngestSummary = rt.block_on(async {
        let mut task = spawn_ingest(
            store.clone(),
            raw,
            options,
            Some(checkpoint_mgr.clone()),
        );
        let pb = make_progress_bar(input_len);
        let mut committed = 0u64;

        while let Some(event) = task.next_event().await {
            match event {
                IngestEvent::Chunk { count, progress } => {
                    committed += count;
                    pb.set_position((progress * input_len as f64) as u64);
                    pb.set_message(format!("{committed} records"));
                }
                IngestEvent::Done { total, .. } => {
                    pb.finish_with_message(format!("{total} records"));
                }
                IngestEvent::Error { message } => {
                    pb.abandon_with_message(message);
                }
            }
        }

        task.join().await
    })?;
    let ingest_duration = start_ingesting.elapsed();

    if summary.cancelled {
        warn!(offset = summary.resume_offset, "Pass was cancelled, keeping checkpoint");
    } else if let Err(e) = checkpoint_mgr.clear() {
        warn!(error = %e, "Failed to clear checkpoint");
    }

    let mut index_dirty = summary.index_dirty;
    let mut rebuild_duration = None;
    if args.rebuild && !summary.cancelled {
        let start_rebuild = Instant::now();
        let rebuilt = rt.block_on(spawn_rebuild(store.clone()))?;
        info!(
            players = rebuilt.players_rebuilt,
            mappings = rebuilt.mappings_rebuilt,
            "Rebuild complete"
        );
        index_dirty = false;
        rebuild_duration = Some(start_rebuild.elapsed());
    }

    println!();
    println!("=== Summary ===");
    println!("Ingest time:        {:.2}s", ingest_duration.as_secs_f64());
    if let Some(d) = rebuild_duration {
        println!("Rebuild time:       {:.2}s", d.as_secs_f64());
    }
    println!();
    println!("Elements scanned:   {}", summary.elements);
    println!("Records persisted:  {}", summary.total);
    println!("Filtered (status):  {}", summary.filtered);
    println!("Malformed:          {}", summary.malformed);
    println!("Flushes:            {}", summary.flushes);
    println!("Store records:      {}", store.record_count()?);
    if index_dirty {
        println!();
        println!("Player counts are stale; run `propline rebuild-index -s {}`", args.store);
    }

    Ok(())
}

fn run_rebuild(args: StoreArgs) -> Result<()> {
    let store = FileStore::open(&args.store)
        .with_context(|| format!("Failed to open store: {}", args.store))?;
    let start = Instant::now();
    let summary = rebuild_index(&store)?;

    println!("Players rebuilt:    {}", summary.players_rebuilt);
    println!("Mappings rebuilt:   {}", summary.mappings_rebuilt);
    println!("Rebuild time:       {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn run_lookup(args: LookupArgs) -> Result<()> {
    let store = FileStore::open(&args.store)
        .with_context(|| format!("Failed to open store: {}", args.store))?;

    let mut prefix = IndexPrefix::league(&args.league);
    if let Some(stat) = &args.stat {
        prefix = prefix.with_stat(stat);
    }
    if let Some(player) = &args.player {
        prefix = prefix.with_player_prefix(player);
    }

    let entries = store.index_entries(&prefix)?;
    if entries.is_empty() {
        bail!("No index entries for league {}", args.league);
    }

    let counts = store.player_counts()?;
    for entry in &entries {
        match counts.get(&entry.player_name) {
            Some(n) => println!("{}\t{}\t{}\t{}", entry.league, entry.stat, entry.player_name, n),
            None => println!("{}\t{}\t{}", entry.league, entry.stat, entry.player_name),
        }
    }
    if store.aggregate_dirty()? {
        warn!("Player counts are stale, run rebuild-index");
    }
    Ok(())
}

fn run_export(args: ExportArgs) -> Result<()> {
    let store = FileStore::open(&args.store)
        .with_context(|| format!("Failed to open store: {}", args.store))?;
    let summary = export::export_csv(&store, Path::new(&args.output))?;

    println!("Records exported:   {}", summary.records);
    println!("Index rows:         {}", summary.index_entries);
    Ok(())
}

fn run_compact(args: StoreArgs) -> Result<()> {
    let store = FileStore::open(&args.store)
        .with_context(|| format!("Failed to open store: {}", args.store))?;
    store.compact()?;
    println!("Compacted {} records", store.record_count()?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Ingest(args) => run_ingest(args),
        Commands::RebuildIndex(args) => run_rebuild(args),
        Commands::Lookup(args) => run_lookup(args),
        Commands::Export(args) => run_export(args),
        Commands::Compact(args) => run_compact(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
