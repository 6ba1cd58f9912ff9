//! Coin Harness CLI
//!
//! Entry point for the `coin-harness` command-line tool.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use coin_harness::harness::HarnessInfo;
use coin_harness::pool::PoolStats;
use coin_harness::sim::SimFailures;
use coin_harness::{SetupConfig, SimpleTestSetup};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coin-harness")]
#[command(about = "Node/wallet test harness pool", version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        overrides: ConfigArgs,
    },

    /// Spawn one harness per spawner on the simulated backend, then tear down
    Smoke {
        #[command(flatten)]
        overrides: ConfigArgs,

        /// Mature outputs required from every spawner
        #[arg(long)]
        mature_outputs: Option<u32>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Path to config file (TOML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// First port handed out
    #[arg(long)]
    base_port: Option<u16>,

    /// Network preset (simnet, regtest, testnet)
    #[arg(long)]
    network: Option<String>,

    /// Coinbase maturity override
    #[arg(long)]
    maturity: Option<u32>,

    /// Parent directory for the setup's temporary tree
    #[arg(long)]
    temp_root: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<SetupConfig, String> {
        let mut config = match &self.config {
            Some(path) => SetupConfig::load(path).map_err(|e| e.to_string())?,
            None => SetupConfig::default(),
        };
        if let Some(port) = self.base_port {
            config.base_port = port;
        }
        if let Some(network) = &self.network {
            config.network = network.clone();
        }
        if let Some(maturity) = self.maturity {
            config.coinbase_maturity = Some(maturity);
        }
        if let Some(root) = &self.temp_root {
            config.temp_root = Some(root.clone());
        }
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

#[derive(Serialize)]
struct SmokeEntry {
    harness: HarnessInfo,
    height: u64,
    mature_outputs: u32,
    mature_balance: u64,
}

#[derive(Serialize)]
struct SmokeReport {
    network: String,
    working_dir: PathBuf,
    harnesses: Vec<SmokeEntry>,
    pool: PoolStats,
    teardown_errors: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Config { overrides } => run_config(&overrides),
        Commands::Smoke {
            overrides,
            mature_outputs,
            json,
        } => run_smoke(&overrides, mature_outputs, json),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_config(overrides: &ConfigArgs) {
    let config = match overrides.load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }
}

fn run_smoke(overrides: &ConfigArgs, mature_outputs: Option<u32>, json: bool) {
    let mut config = match overrides.load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };
    if let Some(count) = mature_outputs {
        for spawner in &mut config.spawners {
            spawner.num_mature_outputs = count;
        }
    }

    let (mut setup, _network) = match SimpleTestSetup::simulated(&config, SimFailures::none()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Setup failed: {}", e);
            process::exit(2);
        }
    };

    let mut harnesses = Vec::new();
    let mut failed = None;
    let names: Vec<String> = setup.spawner_names().map(str::to_string).collect();
    for name in &names {
        let lease = match setup.checkout(name) {
            Ok(l) => l,
            Err(e) => {
                failed = Some(format!("spawner {}: {}", name, e));
                break;
            }
        };
        let entry = lease.with(|h| -> Result<SmokeEntry, String> {
            let height = h.node().best_height().map_err(|e| e.to_string())?;
            let mature_outputs = h.wallet().mature_outputs().map_err(|e| e.to_string())?;
            let mature_balance = h.wallet().mature_balance().map_err(|e| e.to_string())?;
            Ok(SmokeEntry {
                harness: h.info(),
                height,
                mature_outputs,
                mature_balance,
            })
        });
        match entry {
            Ok(entry) => harnesses.push(entry),
            Err(e) => {
                failed = Some(format!("spawner {}: {}", name, e));
                break;
            }
        }
        if let Err(e) = setup.checkin(lease) {
            failed = Some(format!("spawner {}: {}", name, e));
            break;
        }
    }

    let pool = setup.pool().stats();
    let working_dir = setup.working_dir().to_path_buf();
    let teardown_errors: Vec<String> = match setup.tear_down() {
        Ok(()) => Vec::new(),
        Err(e) => e.failures.iter().map(ToString::to_string).collect(),
    };

    let report = SmokeReport {
        network: setup.params().name.clone(),
        working_dir,
        harnesses,
        pool,
        teardown_errors,
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
    } else {
        println!("Network: {}", report.network);
        println!("Working dir: {}", report.working_dir.display());
        for entry in &report.harnesses {
            println!(
                "  {} ports {} height {} mature outputs {} ({} atoms)",
                entry.harness.id, entry.harness.ports, entry.height, entry.mature_outputs, entry.mature_balance
            );
        }
        for error in &report.teardown_errors {
            println!("  teardown: {}", error);
        }
    }

    if let Some(e) = failed {
        eprintln!("Smoke test failed: {}", e);
        process::exit(2);
    }
    if !report.teardown_errors.is_empty() {
        process::exit(3);
    }
}
