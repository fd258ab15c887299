//! dignode — command-line front end for the blob distribution node.
//!
//! `start` runs a node in the foreground until interrupted. `stop` and
//! `status` talk to a running node through the small runtime-state file
//! it maintains under the platform data directory.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dignode_core::{Node, NodeConfig};

/// Exit code when a run ends on an interrupt signal.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "dignode", version, about = "Peer-to-peer .dig blob distribution node")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node in the foreground
    Start,
    /// Ask a running node to shut down
    Stop,
    /// Show a running node's status
    Status,
    /// Print the effective configuration
    Config,
}

/// What a running node publishes about itself for `status` and `stop`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeState {
    pid: u32,
    node_id: String,
    namespace: String,
    started_at: i64,
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
    dig_directory: PathBuf,
}

fn run_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("dignode")
        .join("run")
}

fn state_path() -> PathBuf {
    run_dir().join("state.json")
}

fn stop_marker_path() -> PathBuf {
    run_dir().join("dignode.stop")
}

fn load_config(path: &Option<PathBuf>) -> Result<NodeConfig, String> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&raw)
                .map_err(|e| format!("invalid config {}: {e}", path.display()))
        }
        None => Ok(NodeConfig::default()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit = match cli.command {
        Command::Start => cmd_start(&cli.config).await,
        Command::Stop => cmd_stop().await,
        Command::Status => cmd_status(),
        Command::Config => cmd_config(&cli.config),
    };
    std::process::exit(exit);
}

async fn cmd_start(config_path: &Option<PathBuf>) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    let node = match Node::new(config.clone()) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    if let Err(e) = node.start().await {
        eprintln!("error: {e}");
        return 1;
    }

    let status = node.status().await;
    let state = RuntimeState {
        pid: std::process::id(),
        node_id: node.id().to_hex(),
        namespace: config.namespace.clone(),
        started_at: dignode_core::time::now_timestamp_millis(),
        tcp_port: status.tcp_port,
        udp_port: status.udp_port,
        dig_directory: config.dig_directory.clone(),
    };
    if let Err(e) = write_state(&state) {
        tracing::warn!(error = %e, "could not write runtime state file");
    }
    let _ = std::fs::remove_file(stop_marker_path());

    tracing::info!(id = %node.id(), dir = %config.dig_directory.display(), "node started");

    // Run until interrupted or asked to stop via the marker file.
    let interrupted;
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                interrupted = true;
                break;
            }
            _ = poll.tick() => {
                if stop_marker_path().exists() {
                    tracing::info!("stop requested, shutting down");
                    interrupted = false;
                    break;
                }
            }
        }
    }

    let exit = match node.stop().await {
        Ok(()) => {
            if interrupted {
                EXIT_INTERRUPTED
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("error during shutdown: {e}");
            1
        }
    };
    let _ = std::fs::remove_file(state_path());
    let _ = std::fs::remove_file(stop_marker_path());
    exit
}

async fn cmd_stop() -> i32 {
    if !state_path().exists() {
        println!("dignode is not running");
        return 0;
    }
    if let Err(e) = std::fs::create_dir_all(run_dir())
        .and_then(|_| std::fs::write(stop_marker_path(), b""))
    {
        eprintln!("error: cannot request stop: {e}");
        return 1;
    }

    // Wait for the node to acknowledge by clearing its state file.
    for _ in 0..50 {
        if !state_path().exists() {
            println!("stopped");
            return 0;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    eprintln!("error: node did not stop within 10s");
    1
}

fn cmd_status() -> i32 {
    match read_state() {
        Some(state) => {
            println!("state:     running");
            println!("pid:       {}", state.pid);
            println!("node id:   {}", state.node_id);
            println!("namespace: {}", state.namespace);
            println!("directory: {}", state.dig_directory.display());
            if let Some(port) = state.tcp_port {
                println!("tcp port:  {port}");
            }
            if let Some(port) = state.udp_port {
                println!("udp port:  {port}");
            }
        }
        None => {
            println!("state:     stopped");
        }
    }
    0
}

fn cmd_config(config_path: &Option<PathBuf>) -> i32 {
    match load_config(config_path) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config).expect("config serializes")
                );
                0
            }
            Err(e) => {
                eprintln!("error: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn write_state(state: &RuntimeState) -> std::io::Result<()> {
    std::fs::create_dir_all(run_dir())?;
    std::fs::write(
        state_path(),
        serde_json::to_vec_pretty(state).expect("state serializes"),
    )
}

fn read_state() -> Option<RuntimeState> {
    let raw = std::fs::read(state_path()).ok()?;
    serde_json::from_slice(&raw).ok()
}
