mod simulate;
mod workload;

use std::path::PathBuf;
use std::sync::Once;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use simulate::SimulateArgs;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var("GCCTL_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter.clone())
                .with_target(true)
                .json()
                .flatten_event(true)
                .with_writer(std::io::stderr)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .with_writer(std::io::stderr)
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "gcctl")]
#[command(about = "Moving garbage collector control and simulation utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fragment an in-memory cache set and run collection passes over it
    Simulate(SimulateArgs),
    /// Print the effective collector configuration as YAML
    Config {
        /// YAML file to load instead of MOVINGGC_* variables
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(num_cpus::get().max(1))
                .enable_all()
                .build()?;
            let report = runtime.block_on(simulate::run(&args))?;
            print!("{}", simulate::render(&report, args.format)?);
        }
        Commands::Config { config } => {
            let config = simulate::load_config(config.as_deref())?;
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
