use clap::Parser;
use fleetwatch::{
    NodeRef, Role,
    actors::AggregatorHandle,
    alerts::AlertManager,
    config::{Config, read_config_file},
    rpc::mqtt::MqttTransport,
    storage,
    util::get_node_addr,
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
        .with_targets(vec![("fleetwatch", level), ("fleetwatch_aggregator", level)]);
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
    let node = NodeRef::aggregator(
        args.address
            .unwrap_or_else(|| get_node_addr(Role::Aggregator)),
    );

    let storage = storage::open(config.storage.as_ref()).await?;
    let alerts = AlertManager::new(config.alert.clone(), node.clone());
    let connection = MqttTransport::connect(&config.broker, node.clone()).await?;
    let aggregator = AggregatorHandle::spawn(
        connection,
        NodeRef::controller(&config.controller),
        config.scheduler.settings(),
        storage,
        alerts,
    );
    info!("aggregator {node} running");

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    aggregator.shutdown().await
}
