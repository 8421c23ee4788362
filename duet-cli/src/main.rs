//! Duet CLI: call endpoints, signaling relay and call history

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{default_history_path, DuetConfig, DEFAULT_RELAY_URL};
use duet_core::{compute_stats, HistoryStore, JsonlHistoryStore, MediaType, UserId};
use endpoint::EndpointOptions;
use rand::Rng;
use simulate::{Scenario, Simulation};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod bell;
mod config;
mod endpoint;
mod relay;
mod report;
mod simulate;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Identity to register as; random four words if unset
    #[arg(short, long, env = "DUET_IDENTITY", global = true)]
    identity: Option<String>,

    /// Signaling relay URL
    #[arg(long, env = "DUET_RELAY", global = true)]
    relay: Option<String>,

    /// Call history file
    #[arg(long, env = "DUET_HISTORY", global = true)]
    history: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9470")]
        listen: SocketAddr,
    },

    /// Call a peer
    Call {
        /// Peer identity
        peer: String,

        /// Start with video
        #[arg(long)]
        video: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept incoming calls without prompting
        #[arg(long)]
        auto_accept: bool,
    },

    /// Run a scripted call between in-process endpoints
    Simulate {
        /// Scenario to run
        #[arg(value_enum, default_value = "answered")]
        scenario: Scenario,

        /// Seconds to stay connected in answered scenarios
        #[arg(long, default_value_t = 5)]
        talk_time: u64,

        /// Seconds before an unanswered call gives up
        #[arg(long, default_value_t = 10)]
        ring_timeout: u64,

        /// Use a video call
        #[arg(long)]
        video: bool,
    },

    /// Show call history
    History {
        /// Whose history to show; defaults to the identity
        #[arg(long)]
        owner: Option<String>,

        /// Maximum records to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Delete the record with this id instead of listing
        #[arg(long)]
        delete: Option<String>,
    },

    /// Show call statistics
    Stats {
        /// Whose statistics to show; defaults to the identity
        #[arg(long)]
        owner: Option<String>,
    },
}

fn media_type(video: bool) -> MediaType {
    if video {
        MediaType::Video
    } else {
        MediaType::Audio
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("duet=info,duet_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DuetConfig::load(path)?,
        None => DuetConfig::default(),
    };

    let identity = cli
        .identity
        .clone()
        .or_else(|| config.identity.clone())
        .unwrap_or_else(generate_random_identity);
    let relay_url = cli
        .relay
        .clone()
        .or_else(|| config.relay_url.clone())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
    let history_path = cli
        .history
        .clone()
        .or_else(|| config.history_path.clone())
        .unwrap_or_else(default_history_path);

    match cli.command {
        Commands::Relay { listen } => {
            println!("📡 Relay listening on ws://{listen}");
            relay::run(listen).await?;
        }
        Commands::Call { peer, video } => {
            println!("🔗 Using identity: {identity}");
            let options = EndpointOptions {
                identity: UserId::new(identity),
                relay_url,
                history_path,
                config,
            };
            let service = endpoint::connect(&options).await?;
            endpoint::run_call(&service, UserId::new(peer), media_type(video)).await?;
        }
        Commands::Listen { auto_accept } => {
            println!("🔗 Using identity: {identity}");
            let options = EndpointOptions {
                identity: UserId::new(identity),
                relay_url,
                history_path,
                config,
            };
            let service = endpoint::connect(&options).await?;
            endpoint::run_listen(&service, auto_accept).await?;
        }
        Commands::Simulate {
            scenario,
            talk_time,
            ring_timeout,
            video,
        } => {
            let mut call_config = config.call;
            call_config.ring_timeout = Duration::from_secs(ring_timeout);
            let simulation = Simulation::new(call_config);
            simulation
                .run(scenario, media_type(video), Duration::from_secs(talk_time))
                .await?;
            for owner in ["alice", "bob", "carol", "dave"] {
                let records = simulation.records_for(owner).await?;
                if !records.is_empty() {
                    println!();
                    println!("📒 History for {owner}");
                    report::print_records(&records);
                }
            }
        }
        Commands::History {
            owner,
            limit,
            delete,
        } => {
            let owner = owner.unwrap_or(identity);
            let store = JsonlHistoryStore::new(&history_path);
            if let Some(id) = delete {
                if store.delete(&owner, &id).await? {
                    println!("🗑  Deleted {id}");
                } else {
                    println!("No record {id} for {owner}");
                }
            } else {
                let records = store.list_by_owner(&owner).await?;
                let shown = &records[..records.len().min(limit)];
                report::print_records(shown);
            }
        }
        Commands::Stats { owner } => {
            let owner = owner.unwrap_or(identity);
            let records = JsonlHistoryStore::new(&history_path)
                .list_by_owner(&owner)
                .await?;
            report::print_stats(&owner, &compute_stats(&records));
        }
    }

    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "delta", "ember", "fjord", "grove", "harbor", "iris", "juniper",
        "kestrel", "lagoon", "maple", "nectar", "oak", "pebble", "quartz", "raven", "sable",
        "thistle", "umber", "violet", "willow", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join("-")
}
