// External crates
use anyhow::{Context, Error, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

// Standard library
use std::path::PathBuf;

// Internal crate imports
use neardup::cluster::CLUSTER_UNIT;
use neardup::{read_config, DedupConfig, DocumentSource, JsonlSource, Pipeline, Stage};

/*=================================================================
=                                  ARGS                           =
=================================================================*/

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct ArgParser {
    #[clap(subcommand)]
    command: Commands,

    #[arg(long, default_value_t = 0)]
    threads: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every stage locally, skipping units that already completed
    Run {
        #[arg(required = true, long)]
        config: PathBuf,

        #[arg(long, help = "Re-run every unit instead of resuming from completion markers")]
        no_resume: bool,
    },

    /// Sign one shard
    Signature {
        #[arg(required = true, long)]
        config: PathBuf,

        #[arg(required = true, long)]
        shard: u32,
    },

    /// Match one bucket partition
    Buckets {
        #[arg(required = true, long)]
        config: PathBuf,

        #[arg(required = true, long)]
        partition: u32,
    },

    /// Resolve clusters over every partition's edges
    Cluster {
        #[arg(required = true, long)]
        config: PathBuf,
    },

    /// Filter one shard
    Filter {
        #[arg(required = true, long)]
        config: PathBuf,

        #[arg(required = true, long)]
        shard: u32,
    },

    /// Print per-stage completion
    Status {
        #[arg(required = true, long)]
        config: PathBuf,
    },
}

impl Commands {
    fn config_path(&self) -> &PathBuf {
        match self {
            Commands::Run { config, .. }
            | Commands::Signature { config, .. }
            | Commands::Buckets { config, .. }
            | Commands::Cluster { config }
            | Commands::Filter { config, .. }
            | Commands::Status { config } => config,
        }
    }
}

/*=================================================================
=                             UTILITIES                           =
=================================================================*/

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn init_threads(args_threads: usize, config: &DedupConfig) -> Result<(), Error> {
    let threads = if args_threads != 0 { args_threads } else { config.worker_threads };
    if threads != 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to build rayon thread pool")?;
    }
    Ok(())
}

/*=================================================================
=                             COMMANDS                            =
=================================================================*/

fn run_all(config: &DedupConfig, no_resume: bool) -> Result<(), Error> {
    let source = JsonlSource::new(&config.input_dir, &config.content_key, &config.id_key)?;
    info!(shards = source.num_shards(), input = %config.input_dir.display(), "discovered input shards");
    let pipeline = Pipeline::new(config, &source)?.resume(!no_resume);
    for report in pipeline.run()? {
        info!(stage = %report.stage, ran = report.ran, skipped = report.skipped, "stage finished");
    }
    println!("Deduplicated output written to {:?}", config.output_dir);
    Ok(())
}

fn print_status(config: &DedupConfig) -> Result<(), Error> {
    let source = JsonlSource::new(&config.input_dir, &config.content_key, &config.id_key)?;
    let pipeline = Pipeline::new(config, &source)?;
    for status in pipeline.status() {
        let state = if status.complete == status.total { "done" } else { "pending" };
        println!("{:<10} {:>6}/{:<6} {}", status.stage.name(), status.complete, status.total, state);
    }
    Ok(())
}

/// Runs one unit through the pipeline, which binds to the run manifest and
/// range-checks the unit before touching any stage output.
fn run_single_unit(config: &DedupConfig, stage: Stage, unit: u32) -> Result<(), Error> {
    let source = JsonlSource::new(&config.input_dir, &config.content_key, &config.id_key)?;
    let pipeline = Pipeline::new(config, &source)?;
    pipeline.run_unit(stage, unit)?;
    info!(stage = %stage, unit, "unit complete");
    Ok(())
}

fn dispatch(args: &ArgParser, config: &DedupConfig) -> Result<(), Error> {
    match &args.command {
        Commands::Run { no_resume, .. } => run_all(config, *no_resume),
        Commands::Signature { shard, .. } => run_single_unit(config, Stage::Signature, *shard),
        Commands::Buckets { partition, .. } => run_single_unit(config, Stage::Bucket, *partition),
        Commands::Cluster { .. } => run_single_unit(config, Stage::Cluster, CLUSTER_UNIT),
        Commands::Filter { shard, .. } => run_single_unit(config, Stage::Filter, *shard),
        Commands::Status { .. } => print_status(config),
    }
}

/*=================================================================
=                                 MAIN                            =
=================================================================*/

fn main() -> Result<(), Error> {
    let args = ArgParser::parse();
    init_logging();

    let config_path = args.command.config_path();
    let config = read_config(config_path).with_context(|| format!("loading config {:?}", config_path))?;
    config.require_paths()?;
    init_threads(args.threads, &config)?;

    dispatch(&args, &config)
}
