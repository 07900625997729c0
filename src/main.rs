use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use workpool_lite::checkpoint::{list_generations, read_sanity_file};
use workpool_lite::config::{CheckpointRetention, DistributorConfig};
use workpool_lite::demo::{PiDemo, PiQueen};
use workpool_lite::node::LocalCluster;
use workpool_lite::scheduler::RunSummary;
use workpool_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "workpool-lite")]
#[command(version)]
#[command(about = "A work-pool job distributor with archival nodes and checkpoint/restore")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Estimate pi on an in-process group of master, archive and worker nodes
    Demo(DemoArgs),

    /// Inspect a checkpoint directory
    Checkpoints {
        /// Checkpoint directory
        #[arg(long, default_value = "checkpoints")]
        dir: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Demo Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of processes in the group, master included
    #[arg(long, short = 'n', default_value = "6")]
    nprocs: usize,

    /// Number of dedicated archive nodes (0: the master archives everything)
    #[arg(long, default_value = "1")]
    archives: usize,

    /// Let the master hold results as well as the archives
    #[arg(long)]
    archive_on_master: bool,

    /// Keep archived results in this directory instead of in memory
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Fraction of processes that may write output
    #[arg(long, default_value = "0.01")]
    outputter_fraction: f64,

    /// Compress results before they leave the worker
    #[arg(long)]
    compress: bool,

    /// Attempts per job before it counts as failed
    #[arg(long, default_value = "1")]
    retry_limit: u32,

    /// Write a checkpoint every N seconds
    #[arg(long)]
    checkpoint_every: Option<u64>,

    /// Checkpoint directory
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Resume from the newest complete checkpoint
    #[arg(long)]
    restore: bool,

    /// Start from scratch if no usable checkpoint is found
    #[arg(long, requires = "restore")]
    continue_past_failed_restore: bool,

    /// Never delete old checkpoint generations
    #[arg(long, conflicts_with = "keep_generation")]
    keep_all_checkpoints: bool,

    /// Never delete this checkpoint generation
    #[arg(long)]
    keep_generation: Option<u64>,

    /// Number of sampling batches
    #[arg(long, default_value = "16")]
    batches: u64,

    /// Samples drawn per batch
    #[arg(long, default_value = "100000")]
    samples: u64,

    /// Base seed; batch i uses seed + i
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Directory the estimate is written to
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Output format for the run summary
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl DemoArgs {
    fn distributor_config(&self) -> DistributorConfig {
        let mut config = DistributorConfig::new()
            .with_archives(self.archives)
            .with_archive_on_master(self.archive_on_master)
            .with_outputter_fraction(self.outputter_fraction)
            .with_compression(self.compress)
            .with_default_retry_limit(self.retry_limit);
        if let Some(dir) = &self.archive_dir {
            config = config.with_archive_directory(dir);
        }
        if let Some(seconds) = self.checkpoint_every {
            config = config.with_checkpointing(&self.checkpoint_dir, Duration::from_secs(seconds));
        }
        if self.restore {
            config.checkpoint.directory = self.checkpoint_dir.clone();
            config = config.with_restore(self.continue_past_failed_restore);
        }
        if self.keep_all_checkpoints {
            config = config.with_retention(CheckpointRetention::KeepAll);
        } else if let Some(generation) = self.keep_generation {
            config = config.with_retention(CheckpointRetention::Keep(generation));
        }
        config
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct DemoOutput {
    summary: RunSummary,
    estimate_file: PathBuf,
}

#[derive(Serialize)]
struct CheckpointListOutput {
    directory: PathBuf,
    n_archives: Option<usize>,
    generations: Vec<u64>,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.distributor_config();
    let demo = Arc::new(PiDemo {
        batches: args.batches,
        samples_per_batch: args.samples,
        seed: args.seed,
        output_dir: args.output_dir.clone(),
    });

    tracing::info!(
        nprocs = args.nprocs,
        archives = args.archives,
        batches = args.batches,
        checkpointing = config.checkpoint.enabled,
        restore = config.checkpoint.restore,
        "Starting pi demo"
    );

    let shutdown = install_shutdown_handler();
    let summary = LocalCluster::new(args.nprocs, config)
        .with_shutdown(shutdown)
        .run(|_rank| PiQueen::new(demo.clone()))
        .await?;

    let estimate_file = demo.output_path(None);
    match args.output {
        OutputFormat::Json => {
            let output = DemoOutput {
                summary,
                estimate_file,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => print_summary(&summary, &estimate_file),
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, estimate_file: &std::path::Path) {
    println!("{:<28} {}", "Jobs completed", summary.jobs_completed);
    println!("{:<28} {}", "Jobs failed", summary.jobs_failed);
    println!("{:<28} {}", "Jobs previously executed", summary.jobs_previously_executed);
    println!("{:<28} {}", "Results output", summary.results_output);
    println!("{:<28} {}", "Results discarded", summary.results_discarded);
    println!("{:<28} {}", "Checkpoints written", summary.checkpoints_written);
    if let Some(generation) = summary.restored_from {
        println!("{:<28} {}", "Restored from generation", generation);
    }
    if !summary.results_held.is_empty() {
        println!();
        println!("{:<8} {:<10} {:<10}", "NODE", "HELD", "RECORDED");
        println!("{}", "-".repeat(30));
        for (node, held) in &summary.results_held {
            let recorded = summary.remaining_results.get(node).copied().unwrap_or(0);
            println!("{:<8} {:<10} {:<10}", node, held, recorded);
        }
    }
    println!();
    println!("Estimate written to {}", estimate_file.display());
}

fn list_checkpoints(dir: PathBuf, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let generations = list_generations(&dir)?;
    let n_archives = read_sanity_file(&dir)?;
    match output {
        OutputFormat::Json => {
            let listing = CheckpointListOutput {
                directory: dir,
                n_archives,
                generations,
            };
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        OutputFormat::Table => {
            println!("Directory: {}", dir.display());
            match n_archives {
                Some(count) => println!("Archives:  {}", count),
                None => println!("Archives:  (no sanity file)"),
            }
            if generations.is_empty() {
                println!("No checkpoint generations found.");
            } else {
                println!("{:<12}", "GENERATION");
                println!("{}", "-".repeat(12));
                for generation in generations {
                    println!("{:<12}", generation);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Demo(demo_args) => run_demo(demo_args).await,
        Commands::Checkpoints { dir, output } => list_checkpoints(dir, output),
    }
}
