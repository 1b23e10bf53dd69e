//! CLI entry point for the LAN mesh.
//!
//! This binary provides a command-line interface for the mesh library,
//! supporting key generation, trust management, configuration management and
//! running an interactive mesh node.

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use lan_mesh::{
    crypto::{Identity, KeyDecoder},
    utils::{BootstrapPeer, MeshConfig, TrustMode, DEFAULT_CONFIG_FILE},
    Mesh, MeshEvent,
};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

/// LAN Mesh - serverless encrypted messaging on the local network
#[derive(Parser)]
#[command(name = "mesh")]
#[command(about = "A serverless LAN mesh with broadcast discovery and encrypted messaging")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and trusted peers
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and show the node identity
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Manage trusted peer keys
    Trust {
        #[command(subcommand)]
        action: TrustCommands,
    },
    /// Run a mesh node
    Run {
        /// Port for discovery and connections
        #[arg(short, long)]
        port: Option<u16>,
        /// Display name announced to peers
        #[arg(short, long)]
        name: Option<String>,
        /// Peer to contact directly, as ADDRESS=BASE64KEY
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity key pair
    Generate {
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the current public key
    Show {
        /// Output format (hex, base64)
        #[arg(short, long, default_value = "base64")]
        format: String,
    },
}

#[derive(Subcommand)]
enum TrustCommands {
    /// Trust a peer's base64 public key
    Add {
        /// Base64 encoded public key
        key: String,
        /// File name inside the trust directory
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List trusted keys
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = MeshConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.identity.keys_dir = data_dir.join("keys");
        if config.trust.mode == TrustMode::Directory {
            config.trust.path = Some(data_dir.join("trusted"));
        }
    }

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Trust { action } => handle_trust_commands(action, &config),
        Commands::Run {
            port,
            name,
            bootstrap,
        } => handle_run_command(port, name, bootstrap, config).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn handle_key_commands(action: KeyCommands, config: &MeshConfig) -> Result<()> {
    let keys_dir = &config.identity.keys_dir;

    match action {
        KeyCommands::Generate { force } => {
            if keys_dir.join(lan_mesh::crypto::identity::PRIVATE_KEY_FILE).exists() && !force {
                return Err(anyhow::anyhow!(
                    "Identity already exists. Use --force to overwrite."
                ));
            }

            let identity = Identity::generate();
            identity.save(keys_dir)?;

            println!("✓ Identity generated successfully");
            println!("  ID: {}", identity.short_id());
            println!("  Public key: {}", identity.public_key_base64());
            println!("  Saved to: {}", keys_dir.display());
        }
        KeyCommands::Show { format } => {
            let identity = Identity::load(keys_dir)?;

            match format.as_str() {
                "hex" => println!("{}", hex::encode(identity.public_key_bytes())),
                "base64" => println!("{}", identity.public_key_base64()),
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
    }
    Ok(())
}

fn handle_trust_commands(action: TrustCommands, config: &MeshConfig) -> Result<()> {
    match action {
        TrustCommands::Add { key, name } => {
            let decoded = general_purpose::STANDARD.decode(key.trim())?;
            lan_mesh::crypto::RawKeyDecoder
                .decode_public_key(&decoded)
                .map_err(|e| anyhow::anyhow!("Not a valid public key: {}", e))?;
            let short_id = lan_mesh::crypto::short_id(&decoded);

            match (config.trust.mode, &config.trust.path) {
                (TrustMode::Directory, Some(dir)) => {
                    std::fs::create_dir_all(dir)?;
                    let file = dir.join(name.unwrap_or_else(|| format!("{}.pub", short_id)));
                    std::fs::write(&file, key.trim())?;
                    println!("✓ Trusted {} ({})", short_id, file.display());
                }
                (TrustMode::File, Some(path)) => {
                    use std::io::Write;
                    let mut file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?;
                    writeln!(file, "{}", key.trim())?;
                    println!("✓ Trusted {} ({})", short_id, path.display());
                }
                _ => {
                    warn!("Trust mode admits every key; nothing to record");
                }
            }
        }
        TrustCommands::List => {
            let Some(path) = &config.trust.path else {
                println!("Trust mode: allow all");
                return Ok(());
            };

            let keys: Vec<String> = match config.trust.mode {
                TrustMode::AllowAll => {
                    println!("Trust mode: allow all");
                    return Ok(());
                }
                TrustMode::File => std::fs::read_to_string(path)
                    .unwrap_or_default()
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string)
                    .collect(),
                TrustMode::Directory => std::fs::read_dir(path)?
                    .filter_map(std::result::Result::ok)
                    .filter(|entry| entry.path().is_file())
                    .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
                    .map(|content| content.trim().to_string())
                    .collect(),
            };

            println!("Trusted keys ({})", keys.len());
            for key in keys {
                match general_purpose::STANDARD.decode(&key) {
                    Ok(bytes) => println!("  {}  {}", lan_mesh::crypto::short_id(&bytes), key),
                    Err(_) => println!("  (unreadable)  {}", key),
                }
            }
        }
    }
    Ok(())
}

fn parse_bootstrap(entry: &str) -> Result<BootstrapPeer> {
    let (address, public_key) = entry
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected ADDRESS=BASE64KEY, got '{}'", entry))?;
    let address: SocketAddr = address.parse()?;

    Ok(BootstrapPeer {
        address,
        public_key: public_key.to_string(),
    })
}

async fn handle_run_command(
    port: Option<u16>,
    name: Option<String>,
    bootstrap: Vec<String>,
    mut config: MeshConfig,
) -> Result<()> {
    // Override config with command line options
    if let Some(port) = port {
        config.network.port = port;
    }
    if name.is_some() {
        config.identity.display_name = name;
    }
    for entry in &bootstrap {
        config.network.bootstrap_peers.push(parse_bootstrap(entry)?);
    }

    let mut mesh = Mesh::from_config(&config)?;
    let mut events = mesh
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("Event stream already taken"))?;
    let address = mesh.start().await?;

    info!("Node {} running on {}", mesh.identity().short_id(), address);
    println!("Public key: {}", mesh.identity().public_key_base64());
    println!("Type a line to send it to every peer, /peers (or /peers json) to list peers, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/peers json" => {
                        println!("{}", serde_json::to_string_pretty(&mesh.peers().await)?);
                    }
                    "/peers" => {
                        for peer in mesh.peers().await {
                            let session = if mesh.has_session(peer.public_key()).await {
                                "session"
                            } else {
                                "pending"
                            };
                            println!("  {} [{}]", peer, session);
                        }
                    }
                    text => {
                        for (peer, result) in mesh.send_to_all(text.as_bytes()).await {
                            if let Err(e) = result {
                                error!("Delivery to {} failed: {}", peer, e);
                            }
                        }
                    }
                },
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down gracefully...");
    mesh.shutdown().await?;
    Ok(())
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::PeerJoined(peer) => println!("+ {} joined", peer),
        MeshEvent::PeerLeft(peer) => println!("- {} left", peer),
        MeshEvent::ProfileUpdated(peer) => println!("* {} updated their profile", peer),
        MeshEvent::MessageReceived {
            sender,
            payload,
            received_at,
        } => println!(
            "[{}] {}: {}",
            received_at.format("%H:%M:%S"),
            sender,
            String::from_utf8_lossy(payload)
        ),
    }
}

fn handle_config_commands(action: ConfigCommands, config: &MeshConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = MeshConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                MeshConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            if let Some(section_name) = section {
                let table: toml::Table = toml::from_str(&config_str)?;
                let section = table
                    .get(&section_name)
                    .ok_or_else(|| anyhow::anyhow!("No section '{}'", section_name))?;
                println!("[{}]\n{}", section_name, toml::to_string_pretty(section)?);
            } else {
                println!("{}", config_str);
            }
        }
    }
    Ok(())
}
