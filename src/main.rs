//! CLI entry point for the secure P2P broadcaster.
//!
//! This binary runs one node of a broadcast group: it performs the
//! handshake with every configured peer, then broadcasts a message or runs
//! a growing stress loop. It also manages configuration files.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use rand::Rng;
use secure_p2p_broadcast::{
    utils::{NodeConfig, DEFAULT_CONFIG_FILE},
    P2pError, Runner, TestMode, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Secure P2P Broadcast - one payload to every peer, one reply from each
#[derive(Parser)]
#[command(name = "broadcaster")]
#[command(about = "Broadcast encrypted payloads among a fixed group of peers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Own listening address (address:port)
    #[arg(long, value_name = "ADDR")]
    host: Option<String>,

    /// Peer address (address:port), repeat for every peer
    #[arg(short, long = "peer", value_name = "ADDR")]
    peers: Vec<String>,

    /// Shared password
    #[arg(long)]
    password: Option<String>,

    /// Use password-derived AES keys instead of RSA
    #[arg(long)]
    symmetric: bool,

    /// Treat undecryptable payloads as empty instead of aborting
    #[arg(long)]
    ignore_wrong_keys: bool,

    /// Run only one half of a round
    #[arg(long, value_enum)]
    test_mode: Option<TestMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the handshake, then broadcast one message
    Broadcast {
        /// Message to send to every peer
        #[arg(short, long)]
        message: String,
        /// Print the replies as JSON
        #[arg(long)]
        json: bool,
    },
    /// Broadcast growing maps until interrupted or a round fails
    Stress {
        /// Maximum number of rounds
        #[arg(short, long, default_value = "100")]
        rounds: usize,
        /// Entries added to the map each round
        #[arg(short, long, default_value = "25")]
        step: usize,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate the merged configuration or a file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show the merged configuration
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(cli.verbose, cli.quiet) {
        eprintln!("Cannot initialize logging: {e}");
    }

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        let code = e.downcast_ref::<P2pError>().map_or(1, P2pError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!(
        "broadcaster {} (protocol {PROTOCOL_VERSION})",
        env!("CARGO_PKG_VERSION")
    );
    let config = merge_arguments(NodeConfig::load(cli.config.as_deref())?, &cli);

    match cli.command {
        Commands::Broadcast { message, json } => handle_broadcast_command(config, message, json).await,
        Commands::Stress { rounds, step } => handle_stress_command(config, rounds, step).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool) -> Result<()> {
    let log_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .try_init()?;

    Ok(())
}

/// Command-line arguments take precedence over file and environment
fn merge_arguments(mut config: NodeConfig, cli: &Cli) -> NodeConfig {
    if let Some(host) = &cli.host {
        config.network.host = host.clone();
    }
    if !cli.peers.is_empty() {
        config.network.peers = cli.peers.clone();
    }
    if let Some(password) = &cli.password {
        config.crypto.password = Some(password.clone());
    }
    if cli.symmetric {
        config.crypto.asymmetric = false;
    }
    if cli.ignore_wrong_keys {
        config.crypto.ignore_wrong_keys = true;
    }
    if let Some(mode) = cli.test_mode {
        config.test_mode = mode;
    }
    if cli.verbose > 0 {
        config.logging.verbose = cli.verbose.min(3);
    }
    config
}

async fn handle_broadcast_command(config: NodeConfig, message: String, json: bool) -> Result<()> {
    info!("Starting node {}", config.network.host);
    info!("Peers: {:?}", config.network.peers);

    let mut runner = Runner::connect(config).await?;
    let replies: BTreeMap<u32, String> = runner.broadcast_str(&message).await?.into_iter().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&replies)?);
    } else {
        for (sender, reply) in &replies {
            println!("{sender}: {reply}");
        }
        println!("✓ {} replies received", replies.len());
    }

    Ok(())
}

async fn handle_stress_command(config: NodeConfig, rounds: usize, step: usize) -> Result<()> {
    let mut runner = Runner::connect(config).await?;
    let mut size = 50;

    for round in 1..=rounds {
        let payload = dump_data(size);
        let replies = match runner.broadcast_obj(&payload).await {
            Ok(replies) => replies,
            Err(P2pError::Interrupted) => {
                warn!("Closing at size {size}, round {round}");
                return Ok(());
            }
            Err(e) => {
                error!("Round {round} failed at size {size}: {e}");
                return Err(e.into());
            }
        };

        for (sender, reply) in &replies {
            if reply.len() != size {
                warn!("Reply from {sender} has {} entries, expected {size}", reply.len());
            }
        }
        println!("Round {round}: {} entries, {} replies", size, replies.len());
        size += step;
    }

    println!("✓ Completed {rounds} rounds");
    Ok(())
}

fn dump_data(size: usize) -> BTreeMap<String, u32> {
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|i| (format!("msg{i}"), rng.gen_range(1000..=9999)))
        .collect()
}

fn handle_config_commands(action: ConfigCommands, config: &NodeConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            NodeConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                NodeConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            let mut shown = config.clone();
            if shown.crypto.password.is_some() {
                shown.crypto.password = Some("********".to_string());
            }
            println!("{}", shown.to_toml_string()?);
        }
    }
    Ok(())
}
