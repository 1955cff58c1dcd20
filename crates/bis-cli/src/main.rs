use anyhow::Result;
use bis_pipeline::{recent_runs_markdown, Pipeline, PipelineConfig};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bis-cli")]
#[command(about = "NYC building/parcel linkage command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch all sources and rebuild the master table.
    Build {
        /// Read API sources from their backup CSVs.
        #[arg(long)]
        offline: bool,
    },
    /// Fetch and normalize one source into `<output_dir>/<source_id>.csv`.
    Fetch {
        source_id: String,
        #[arg(long)]
        offline: bool,
    },
    /// Print the renovation summary for the current master table.
    Report {
        /// List the most recent run reports instead.
        #[arg(long)]
        runs: Option<usize>,
    },
    /// Score the master table and write the top leads.
    Leads {
        #[arg(long)]
        min_score: Option<u32>,
    },
    /// Rebuild on `BIS_REFRESH_CRON` until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    let command = match cli.command {
        Some(command) => command,
        None if config.scheduler_enabled => Commands::Schedule,
        None => Commands::Build { offline: false },
    };

    match command {
        Commands::Build { offline } => {
            config.offline |= offline;
            let summary = Pipeline::new(config)?.run_once().await?;
            println!(
                "build {}: run_id={} rows={} master={} reports={}",
                summary.status, summary.run_id, summary.master_rows, summary.master_path, summary.reports_dir
            );
        }
        Commands::Fetch { source_id, offline } => {
            config.offline |= offline;
            let (path, stats) = Pipeline::new(config)?.fetch_source(&source_id).await?;
            println!(
                "fetched {}: {} rows kept, {} rejected -> {}",
                stats.source_id,
                stats.normalize.output_rows,
                stats.normalize.rejected(),
                path.display()
            );
            if stats.truncated {
                eprintln!("warning: {} hit its page cap; output is partial", stats.source_id);
            }
        }
        Commands::Report { runs: Some(runs) } => {
            println!("{}", recent_runs_markdown(runs, &config.reports_dir)?);
        }
        Commands::Report { runs: None } => {
            let summary = Pipeline::new(config)?.renovation_report().await?;
            println!("{}", summary.to_markdown());
        }
        Commands::Leads { min_score } => {
            let (path, count) = Pipeline::new(config)?.write_top_leads(min_score).await?;
            println!("{count} leads written to {}", path.display());
        }
        Commands::Schedule => bis_pipeline::run_scheduler(config).await?,
    }

    Ok(())
}
