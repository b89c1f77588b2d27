//! adaptest CLI: bank tooling, score conversion and simulation.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "adaptest",
    version,
    about = "Computerized adaptive testing engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate item bank TOML files
    Validate {
        /// Path to item bank file or directory
        #[arg(long)]
        bank: PathBuf,
    },

    /// Rank a bank's items by information at an ability level
    Items {
        /// Path to item bank file
        #[arg(long)]
        bank: PathBuf,

        /// Ability level to rank at
        #[arg(long, default_value = "0.0", allow_negative_numbers = true)]
        theta: f64,

        /// Only items in this topic
        #[arg(long)]
        topic: Option<String>,

        /// Show at most this many items
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Convert an ability estimate to reported scores
    Score {
        /// Ability estimate
        #[arg(long, allow_negative_numbers = true)]
        theta: f64,

        /// Standard error of the estimate
        #[arg(long, default_value = "0.0")]
        se: f64,

        /// Output format: text, json
        #[arg(long, default_value = "text")]
        format: String,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run simulated examinees through full adaptive sessions
    Simulate {
        /// Path to item bank file
        #[arg(long)]
        bank: PathBuf,

        /// True abilities to simulate (comma-separated, e.g. "-1,0,1.5")
        #[arg(long, allow_hyphen_values = true)]
        true_theta: String,

        /// Sessions per true ability
        #[arg(long, default_value = "10")]
        sessions: usize,

        /// Max concurrent sessions
        #[arg(long, default_value = "4")]
        parallelism: usize,

        /// Base random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Directory for final results and the simulation report
        #[arg(long)]
        output: Option<PathBuf>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create starter config and example item bank
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("adaptest=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { bank } => commands::validate::execute(bank),
        Commands::Items {
            bank,
            theta,
            topic,
            limit,
        } => commands::items::execute(bank, theta, topic, limit),
        Commands::Score {
            theta,
            se,
            format,
            config,
        } => commands::score::execute(theta, se, format, config),
        Commands::Simulate {
            bank,
            true_theta,
            sessions,
            parallelism,
            seed,
            output,
            config,
        } => {
            commands::simulate::execute(
                bank,
                true_theta,
                sessions,
                parallelism,
                seed,
                output,
                config,
            )
            .await
        }
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
