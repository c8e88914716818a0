use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate configuration for a local network of nodes and clients.
    Bootstrap(BootstrapArgs),
    /// Run a replica node until interrupted.
    Node(NodeArgs),
    /// Submit requests to every node as one client.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BootstrapArgs {
    /// Directory to write the network into. Must be missing or empty.
    #[arg(long, default_value = "local-network")]
    pub dir: PathBuf,

    #[arg(long, default_value_t = 4)]
    pub nodes: u64,

    #[arg(long, default_value_t = 1)]
    pub clients: u64,

    /// Node i listens on base-port + i.
    #[arg(long, default_value_t = 7000)]
    pub base_port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Path to node-config.toml.
    #[arg(long)]
    pub config: PathBuf,

    /// Directory for the WAL, request store and event log.
    #[arg(long)]
    pub run_dir: PathBuf,

    /// Fan outbound sends out to a worker pool.
    #[arg(long)]
    pub parallel: bool,

    /// Record engine inputs and outputs to eventlog.gz in the run directory.
    #[arg(long)]
    pub event_log: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Path to client-config.toml.
    #[arg(long)]
    pub config: PathBuf,

    /// Requests to submit.
    #[arg(long, default_value_t = 100)]
    pub count: u64,

    /// Payload size in bytes; never less than 26.
    #[arg(long, default_value_t = 64)]
    pub request_size: usize,

    /// Ask nodes for their watermarks and resume from there.
    #[arg(long)]
    pub watermarks: bool,

    /// Milliseconds to wait after the last request before disconnecting.
    #[arg(long, default_value_t = 1000)]
    pub linger_ms: u64,
}
