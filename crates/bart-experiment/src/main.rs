//! BART Experiment CLI.
//!
//! Commands:
//! - run: Run every configured model against one shared threshold schedule
//! - analyze: Print summaries from a saved results JSON or combined CSV

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use bart_experiment::config::ExperimentConfig;
use bart_experiment::orchestrator::{MultiSubjectOrchestrator, OpenRouterFactory, TaskParameters};
use bart_experiment::results::ExperimentResults;
use bart_experiment::sink::{load_combined_csv, write_all};
use bart_experiment::status::ExperimentStatus;
use bart_experiment::trial::CancellationFlag;

#[derive(Parser)]
#[command(name = "bart-experiment")]
#[command(version)]
#[command(about = "Balloon Analogue Risk Task experiments for chat models")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the experiment for every configured model
    Run {
        /// YAML configuration file
        #[arg(long, default_value = "bart_config.yaml")]
        config: PathBuf,

        /// Models to run (comma-separated); overrides the config file
        #[arg(long, value_delimiter = ',')]
        models: Option<Vec<String>>,

        /// API key for the chat endpoint
        #[arg(long = "api-key", env = "OPENROUTER_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Number of balloons per model
        #[arg(long)]
        trials: Option<usize>,

        /// Minimum burst threshold
        #[arg(long)]
        min_threshold: Option<u32>,

        /// Maximum burst threshold
        #[arg(long)]
        max_threshold: Option<u32>,

        /// Reward per pump
        #[arg(long)]
        reward: Option<f64>,

        /// Explicit thresholds (comma-separated) instead of random draws
        #[arg(long, value_delimiter = ',')]
        thresholds: Option<Vec<u32>>,

        /// Random seed for the threshold schedule
        #[arg(long)]
        seed: Option<u64>,

        /// Output directory for result files
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Summarize a saved results JSON or combined CSV file
    Analyze {
        /// Results JSON or combined CSV written by `run`
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Commands::Run {
            config,
            models,
            api_key,
            trials,
            min_threshold,
            max_threshold,
            reward,
            thresholds,
            seed,
            output_dir,
        } => {
            let mut config = ExperimentConfig::load(&config)?;
            if let Some(models) = models {
                config.participants = models;
            }
            if api_key.is_some() {
                config.api_key = api_key;
            }
            if let Some(trials) = trials {
                config.num_trials = trials;
            }
            if let Some(min) = min_threshold {
                config.min_threshold = min;
            }
            if let Some(max) = max_threshold {
                config.max_threshold = max;
            }
            if let Some(reward) = reward {
                config.reward_per_step = reward;
            }
            if seed.is_some() {
                config.seed = seed;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            config.validate()?;

            let schedule = config.threshold_schedule(thresholds)?;

            let cancel = CancellationFlag::new();
            let signal_flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing current decisions and cancelling");
                    signal_flag.cancel();
                }
            });

            let status = ExperimentStatus::new();
            let orchestrator = MultiSubjectOrchestrator::new(
                OpenRouterFactory::new(config.clone()),
                TaskParameters::from(&config),
            )
            .with_cancellation(cancel)
            .with_status(status.clone());

            let results = orchestrator.run(&config.participants, &schedule).await?;
            let written = write_all(&results, &config.output_dir)?;

            println!("\n===== ALL EXPERIMENTS COMPLETE =====");
            print_results(&results);
            for failure in &results.failures {
                println!("  FAILED {}: {}", failure.participant, failure.reason);
            }
            let snapshot = status.snapshot().await;
            info!(
                completed_trials = snapshot.completed_trials(),
                "Status at exit"
            );
            println!("\nCombined CSV: {}", written.combined_csv.display());
            println!("Summary CSV: {}", written.summary_csv.display());
            println!("Results JSON: {}", written.results_json.display());
        }

        Commands::Analyze { file } => {
            let is_csv = file
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            let results = if is_csv {
                load_combined_csv(&file)?
            } else {
                let mut results = ExperimentResults::load(&file)?;
                results.compute_summary();
                results
            };
            println!("Analysis of {}:", file.display());
            print_results(&results);
        }
    }

    Ok(())
}

fn print_results(results: &ExperimentResults) {
    println!("Thresholds: {:?}", results.schedule.as_slice());
    println!(
        "\n  {:<32} {:>6} {:>6} {:>8} {:>8} {:>7} {:>8} {:>8}",
        "Model", "Trials", "Failed", "AvgPump", "AdjPump", "Burst", "AvgEarn", "Total"
    );
    for s in &results.summaries {
        println!(
            "  {:<32} {:>6} {:>6} {:>8.2} {:>8.2} {:>7.2} {:>8.2} {:>8.2}",
            s.participant,
            s.total_trials,
            s.failed_trials,
            s.avg_steps,
            s.adjusted_steps,
            s.burst_rate,
            s.avg_earnings,
            s.total_earnings
        );
    }

    if !results.trend.is_empty() {
        println!("\nPer-Balloon Trend:");
        println!(
            "  {:>7} {:>6} {:>8} {:>7} {:>8}",
            "Balloon", "Models", "AvgPump", "Burst", "AvgEarn"
        );
        for point in &results.trend {
            println!(
                "  {:>7} {:>6} {:>8.2} {:>7.2} {:>8.2}",
                point.trial_index + 1,
                point.participants,
                point.avg_steps,
                point.burst_rate,
                point.avg_earnings
            );
        }
    }
}
