use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use replicated_log::{
    bootstrap::LocalNetwork,
    cli::{BootstrapArgs, Cli, ClientArgs, Command, NodeArgs},
    client::{self, ClientOptions, Mode},
    config::{ClientConfig, NodeConfig},
    driver::{Replica, ReplicaConfig},
    eventlog::EVENT_LOG_FILE,
    signals::StopSignals,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Bootstrap(args) => bootstrap(args),
        Command::Node(args) => run_node(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

fn bootstrap(args: BootstrapArgs) -> Result<()> {
    let network = LocalNetwork {
        nodes: args.nodes,
        clients: args.clients,
        host: args.host,
        base_port: args.base_port,
        ..Default::default()
    };
    network.generate(&args.dir)
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let node = NodeConfig::load(&args.config)?;
    info!(node = node.id, listen = %node.listen_address, "starting replica");
    let replica = Arc::new(Replica::new(ReplicaConfig {
        node,
        wal_dir: args.run_dir.join("wal"),
        request_store_dir: args.run_dir.join("reqstore"),
        parallel: args.parallel,
        event_log: args.event_log.then(|| args.run_dir.join(EVENT_LOG_FILE)),
    }));

    let mut signals = StopSignals::install().context("failed to install signal handlers")?;
    let runner = Arc::clone(&replica);
    let mut run = tokio::task::spawn_blocking(move || runner.run());

    tokio::select! {
        result = &mut run => return result.context("replica thread panicked")?,
        signal = signals.recv() => match signal {
            Ok(name) => info!("{name} received, stopping replica"),
            Err(err) => {
                warn!("failed to listen for stop signals: {err:?}");
                return run.await.context("replica thread panicked")?;
            }
        },
    }

    let stopper = Arc::clone(&replica);
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("stop task panicked")?;
    run.await.context("replica thread panicked")?
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::load(&args.config)?;
    let options = ClientOptions {
        count: args.count,
        request_size: args.request_size,
        mode: if args.watermarks {
            Mode::Watermark
        } else {
            Mode::Fixed
        },
        linger: Duration::from_millis(args.linger_ms),
    };
    let sent = tokio::task::spawn_blocking(move || client::run(&config, options))
        .await
        .context("client thread panicked")??;
    info!(sent, "client finished");
    Ok(())
}
