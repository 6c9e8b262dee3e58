use clap::Parser;
use fleetwatch::{
    NodeRef, Role,
    actors::PollerHandle,
    config::{Config, read_config_file},
    probes::ProbeSet,
    rpc::mqtt::MqttTransport,
    util::{get_node_addr, get_segment},
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,

    /// Address to join the fleet under
    #[arg(long)]
    address: Option<String>,

    /// Network segment this poller serves
    #[arg(long)]
    segment: Option<String>,

    /// Log everything down to trace level
    #[arg(long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose || cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::DEBUG
    };
    let filter = filter::Targets::new()
        .with_targets(vec![("fleetwatch", level), ("fleetwatch_poller", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = match &args.file {
        Some(file) => read_config_file(file)?,
        None => Config::default(),
    };
    let node = NodeRef::poller(args.address.unwrap_or_else(|| get_node_addr(Role::Poller)));
    let segment = args
        .segment
        .or_else(get_segment)
        .unwrap_or_else(|| config.default_segment.clone());

    let connection = MqttTransport::connect(&config.broker, node.clone()).await?;
    let poller = PollerHandle::spawn(
        connection,
        segment.clone(),
        config.scheduler.settings(),
        ProbeSet::system(),
    );
    info!("poller {node} running in segment {segment}");

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    poller.shutdown().await
}
