use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::error;
use vinloc_storage::CacheError;
use vinloc_sync::{dedupe_file, report_markdown, GeocodeConfig, GeocodePipeline, SourceMode, DEFAULT_FIXTURE_SOURCES_DIR};

#[derive(Debug, Parser)]
#[command(name = "vinloc-cli")]
#[command(about = "Resolve and reconcile wine record locations")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dedupe, geocode, reconcile and write a run report.
    Run(RunArgs),
    /// Deduplicate an input file without geocoding.
    Dedupe {
        #[arg(long)]
        input: PathBuf,
        /// Write canonical records here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Query the live gazetteer and encyclopedia instead of fixtures.
    #[arg(long, conflicts_with = "fixtures")]
    live: bool,
    /// Directory holding primary.json / secondary.json.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    #[arg(long)]
    threshold_km: Option<f64>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
}

impl RunArgs {
    fn apply(self, mut config: GeocodeConfig) -> GeocodeConfig {
        if let Some(input) = self.input {
            config.input_path = input;
        }
        if let Some(cache) = self.cache {
            config.cache_path = cache;
        }
        if self.live {
            config.source_mode = SourceMode::Live;
        } else if let Some(dir) = self.fixtures {
            config.source_mode = SourceMode::Fixtures(dir);
        }
        if let Some(km) = self.threshold_km {
            config.divergence_threshold_km = km;
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    match execute(cli.command.unwrap_or(Commands::Run(RunArgs::default()))).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(cache_err) = err.downcast_ref::<CacheError>() {
                error!(error = %cache_err, "geocode cache failure");
                eprintln!("geocode cache failure: {cache_err}");
                eprintln!("the run was aborted; fix or remove the cache file and retry");
                return ExitCode::from(2);
            }
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => {
            let config = args.apply(GeocodeConfig::from_env());
            config.validate()?;
            if let SourceMode::Fixtures(dir) = &config.source_mode {
                if !dir.exists() {
                    anyhow::bail!(
                        "fixture sources not found at {} (expected {DEFAULT_FIXTURE_SOURCES_DIR}/ or pass --fixtures / --live)",
                        dir.display()
                    );
                }
            }
            let summary = GeocodePipeline::new(config).run_once().await?;
            println!(
                "run complete: run_id={} records={} canonical={} places={} located={} failures={} cache_hits={} reports={}",
                summary.run_id,
                summary.input_records,
                summary.canonical_records,
                summary.unique_places,
                summary.located_places,
                summary.lookup_failures,
                summary.cache_hits,
                summary.reports_dir
            );
        }
        Commands::Dedupe { input, output } => {
            let (outcome, invalid) = dedupe_file(&input).await?;
            let json = serde_json::to_vec_pretty(&outcome.records).context("serializing canonical records")?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!(
                        "dedupe complete: input={} canonical={} duplicates_removed={} invalid={} output={}",
                        outcome.input_records,
                        outcome.records.len(),
                        outcome.duplicates_removed,
                        invalid.len(),
                        path.display()
                    );
                }
                None => println!("{}", String::from_utf8_lossy(&json)),
            }
        }
        Commands::Report { runs, workspace } => {
            let root = workspace.unwrap_or_else(|| GeocodeConfig::from_env().workspace_root);
            println!("{}", report_markdown(runs, Some(root))?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).expect("parse");
        match cli.command {
            Some(Commands::Run(args)) => args,
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn threshold_flag_is_validated() {
        let base = GeocodeConfig::from_env();
        for value in ["0", "-5", "NaN", "inf"] {
            let flag = format!("--threshold-km={value}");
            let config = run_args(&["vinloc-cli", "run", &flag]).apply(base.clone());
            assert!(config.validate().is_err(), "accepted {value}");
        }

        let config = run_args(&["vinloc-cli", "run", "--threshold-km", "25"]).apply(base);
        assert_eq!(config.divergence_threshold_km, 25.0);
        config.validate().expect("25 km");
    }
}
