use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use stcore::progress::{LogProgress, ProgressObserver};
use stdata::config::AnalysisConfig;
use stdata::data::handle::SpatialDataHandle;
use stdata::data::meta::summarize;
use stdata::pipeline;
use stdata::progress::BarProgress;

#[derive(Parser, Debug)]
#[command(name = "stdata", version, about = "Spatial region scoring on a SQLite spot store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the analyses of a configuration and write results into the store
    Run {
        /// SQLite store with spots, signals, labels and tables
        #[arg(long)]
        db: PathBuf,

        /// JSON analysis configuration
        #[arg(long)]
        config: PathBuf,

        /// Worker threads, all cores when absent
        #[arg(long)]
        threads: Option<usize>,

        /// Show progress bars instead of periodic log lines
        #[arg(long)]
        progress: bool,
    },
    /// Print what a store contains
    Inspect {
        #[arg(long)]
        db: PathBuf,
    },
    /// Print the default configuration with every analysis enabled
    InitConfig,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            db,
            config,
            threads,
            progress,
        } => run(db, config, threads, progress),
        Commands::Inspect { db } => inspect(db),
        Commands::InitConfig => {
            println!("{}", AnalysisConfig::template().to_json_pretty()?);
            Ok(())
        }
    }
}

fn open_store(db: &PathBuf) -> Result<SpatialDataHandle> {
    if !db.exists() {
        bail!("store {} does not exist", db.display());
    }
    SpatialDataHandle::new(db).with_context(|| format!("failed to open {}", db.display()))
}

fn run(db: PathBuf, config: PathBuf, threads: Option<usize>, progress: bool) -> Result<()> {
    let config =
        AnalysisConfig::from_path(&config).with_context(|| format!("failed to read config {}", config.display()))?;
    if config.n_analyses() == 0 {
        bail!("configuration enables no analysis");
    }
    let mut handle = open_store(&db)?;
    handle.init_schema()?;

    let observer: Box<dyn ProgressObserver> = if progress {
        Box::new(BarProgress::new())
    } else {
        Box::new(LogProgress::default())
    };

    let reports = match threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            info!("running on {} threads", n);
            pool.install(|| pipeline::run(&mut handle, &config, observer.as_ref()))
        }
        None => pipeline::run(&mut handle, &config, observer.as_ref()),
    }
    .with_context(|| format!("analysis run on {} failed", db.display()))?;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn inspect(db: PathBuf) -> Result<()> {
    let handle = open_store(&db)?;
    let summary = summarize(&handle).with_context(|| format!("failed to summarise {}", db.display()))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
