//! Public rooms directory CLI
//!
//! Thin wrapper around publicrooms-core for inspecting and driving a
//! directory store from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Show directory information
//! publicrooms info
//!
//! # Count and list published rooms
//! publicrooms count --filter rust
//! publicrooms list --offset 0 --limit 20
//!
//! # Inspect one room
//! publicrooms show '!abc:example.org'
//!
//! # Publish or unpublish a room
//! publicrooms visibility set '!abc:example.org' true
//!
//! # Feed room events from a JSON file
//! publicrooms apply events.json --remove retracted.json
//!
//! # Join the gossip topic and exchange directory changes with peers
//! publicrooms serve --bootstrap <endpoint-id>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use publicrooms_core::{
    Database, DirectoryConfig, DistributionHandles, DistributionMode, GossipPubSub, PublicRoom,
    RoomEvent, RoomId,
};

/// Public rooms directory
#[derive(Parser)]
#[command(name = "publicrooms")]
#[command(version = "0.1.0")]
#[command(about = "Federated public rooms directory")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Storage connection string (default: ~/.publicrooms/rooms.redb)
    #[arg(short, long, global = true)]
    database: Option<String>,

    /// This server's federation name
    #[arg(short, long, global = true)]
    server_name: Option<String>,

    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show directory information
    Info,

    /// Count published rooms
    Count {
        /// Case-insensitive substring matched against name, topic and aliases
        #[arg(short, long, default_value = "")]
        filter: String,
    },

    /// List published rooms in directory order
    List {
        /// Rows to skip
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        offset: i64,
        /// Maximum rows to return
        #[arg(short, long, default_value = "20", allow_hyphen_values = true)]
        limit: i16,
        /// Case-insensitive substring matched against name, topic and aliases
        #[arg(short, long, default_value = "")]
        filter: String,
        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one room's directory record
    Show {
        /// Room ID (!opaque:server)
        room_id: String,
    },

    /// Directory visibility of a room
    Visibility {
        #[command(subcommand)]
        action: VisibilityAction,
    },

    /// Apply room events from a JSON file
    Apply {
        /// JSON array of events to add
        events: PathBuf,
        /// JSON array of events to retract
        #[arg(short, long)]
        remove: Option<PathBuf>,
    },

    /// Join the gossip topic and exchange directory changes until Ctrl+C
    Serve {
        /// Gossip topic name
        #[arg(short, long)]
        topic: Option<String>,
        /// Bootstrap peer endpoint IDs (hex)
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },
}

#[derive(Subcommand)]
enum VisibilityAction {
    /// Print whether a room is published
    Get {
        /// Room ID (!opaque:server)
        room_id: String,
    },
    /// Publish or unpublish a room
    Set {
        /// Room ID (!opaque:server)
        room_id: String,
        /// true to publish, false to unpublish
        #[arg(action = clap::ArgAction::Set)]
        visible: bool,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default store location (~/.publicrooms/rooms.redb)
fn default_database() -> String {
    let path = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".publicrooms")
        .join("rooms.redb");
    format!("redb://{}", path.display())
}

/// Merge the config file (if any) with command-line overrides
fn load_config(cli: &Cli) -> Result<DirectoryConfig> {
    let mut config = match &cli.config {
        Some(path) => DirectoryConfig::from_json_file(path)?,
        None => DirectoryConfig::default(),
    };

    if let Some(database) = &cli.database {
        config.data_source = database.clone();
    } else if config.data_source.is_empty() {
        config.data_source = default_database();
    }
    if let Some(server_name) = &cli.server_name {
        config.server_name = server_name.clone();
    }
    Ok(config)
}

/// Parse a room ID
fn parse_room_id(s: &str) -> Result<RoomId> {
    RoomId::parse(s).map_err(|e| anyhow::anyhow!("Invalid room ID '{}': {}", s, e))
}

/// Parse a peer endpoint ID from hex string
fn parse_endpoint_id(s: &str) -> Result<iroh::EndpointId> {
    let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("Invalid hex format: {}", e))?;
    if bytes.len() != 32 {
        anyhow::bail!("Endpoint ID must be 32 bytes (got {})", bytes.len());
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    iroh::EndpointId::from_bytes(&array).map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))
}

/// Read a JSON array of room events
fn read_events(path: &Path) -> Result<Vec<RoomEvent>> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("Invalid events in {}", path.display()))
}

/// Load the node's secret key from next to the store, creating it on first use
///
/// In-memory stores get a fresh key each run.
fn node_secret_key(config: &DirectoryConfig) -> Result<iroh::SecretKey> {
    let Some(path) = key_path(config) else {
        return Ok(iroh::SecretKey::generate(&mut rand::rng()));
    };

    if path.exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("Node key is not valid hex")?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Node key must be 32 bytes"))?;
        return Ok(iroh::SecretKey::from_bytes(&bytes));
    }

    let key = iroh::SecretKey::generate(&mut rand::rng());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, hex::encode(key.to_bytes()))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(key)
}

fn key_path(config: &DirectoryConfig) -> Option<PathBuf> {
    match config.data_source().ok()? {
        publicrooms_core::DataSource::File(path) => Some(path.with_extension("key")),
        publicrooms_core::DataSource::Memory => None,
    }
}

fn print_room_line(room: &PublicRoom) {
    println!(
        "{}  {} member(s)  {}",
        room.room_id,
        room.num_joined_members,
        room.name.as_deref().unwrap_or("(unnamed)")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Info => {
            let db = Database::open(config.clone(), DistributionHandles::none()).await?;

            println!("Public Rooms Directory v0.1.0");
            println!();
            println!("Server name: {}", config.server_name);
            println!("Database: {}", config.data_source);
            println!("Topic: {}", config.topic);
            println!("Published rooms: {}", db.count_public_rooms().await?);
        }

        Commands::Count { filter } => {
            let db = Database::open(config, DistributionHandles::none()).await?;
            println!("{}", db.count_public_rooms_matching(&filter).await?);
        }

        Commands::List {
            offset,
            limit,
            filter,
            json,
        } => {
            let db = Database::open(config, DistributionHandles::none()).await?;
            let rooms = db.get_public_rooms(offset, limit, &filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rooms)?);
            } else if rooms.is_empty() {
                println!("No published rooms.");
            } else {
                for room in &rooms {
                    print_room_line(room);
                }
            }
        }

        Commands::Show { room_id } => {
            let room_id = parse_room_id(&room_id)?;
            let db = Database::open(config, DistributionHandles::none()).await?;
            match db.room(&room_id).await? {
                Some(room) => println!("{}", serde_json::to_string_pretty(&room)?),
                None => anyhow::bail!("Room not found: {}", room_id),
            }
        }

        Commands::Visibility { action } => {
            let db = Database::open(config, DistributionHandles::none()).await?;
            match action {
                VisibilityAction::Get { room_id } => {
                    let room_id = parse_room_id(&room_id)?;
                    let visible = db.get_room_visibility(&room_id).await?;
                    println!("{}", if visible { "public" } else { "private" });
                }
                VisibilityAction::Set { room_id, visible } => {
                    let room_id = parse_room_id(&room_id)?;
                    db.set_room_visibility(visible, &room_id).await?;
                    println!(
                        "{} is now {}",
                        room_id,
                        if visible { "public" } else { "private" }
                    );
                }
            }
        }

        Commands::Apply { events, remove } => {
            let to_add = read_events(&events)?;
            let to_remove = match &remove {
                Some(path) => read_events(path)?,
                None => Vec::new(),
            };

            let db = Database::open(config, DistributionHandles::none()).await?;
            db.update_room_from_events(&to_add, &to_remove).await?;
            println!(
                "Applied {} event(s), retracted {} event(s)",
                to_add.len(),
                to_remove.len()
            );
        }

        Commands::Serve { topic, bootstrap } => {
            if let Some(topic) = topic {
                config.topic = topic;
            }
            config.mode = DistributionMode::PubSub;
            if config.republish_interval.is_none() {
                config.republish_interval = Some(Duration::from_secs(300));
            }

            let bootstrap = bootstrap
                .iter()
                .map(|s| parse_endpoint_id(s))
                .collect::<Result<Vec<_>>>()?;

            println!("Starting public rooms directory...");
            println!();

            let secret_key = node_secret_key(&config)?;
            let gossip = Arc::new(GossipPubSub::bind(Some(secret_key), bootstrap).await?);
            let db = Database::open(
                config.clone(),
                DistributionHandles::none().with_pubsub(gossip.clone()),
            )
            .await?;

            println!("Node:");
            println!("  ID: {}", gossip.endpoint_id());
            println!("  Server name: {}", config.server_name);
            println!("  Topic: {}", config.topic);
            println!();
            println!("Database: {}", config.data_source);
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            let status_interval = Duration::from_secs(60);
            let mut last_status = std::time::Instant::now();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if last_status.elapsed() >= status_interval {
                            last_status = std::time::Instant::now();

                            let stats = db.adapter_stats();
                            println!(
                                "[Status] {} published room(s), {} sent, {} applied from peers",
                                db.count_public_rooms().await?,
                                stats.published,
                                stats.peer_entries_applied,
                            );
                        }
                    }
                }
            }

            println!("Shutting down...");
            db.shutdown();
            gossip.shutdown().await;
            println!("Goodbye.");
        }
    }

    Ok(())
}
