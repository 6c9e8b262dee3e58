use clap::Parser;
use fleetwatch::{
    NodeRef,
    actors::ControllerHandle,
    config::{Config, read_config_file},
    rpc::mqtt::MqttTransport,
    storage,
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,

    /// Address to join the fleet under, overrides the configured controller
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
        .with_targets(vec![("fleetwatch", level), ("fleetwatch_controller", level)]);
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
    let address = args.address.unwrap_or_else(|| config.controller.clone());

    let storage = storage::open(config.storage.as_ref()).await?;
    let connection = MqttTransport::connect(&config.broker, NodeRef::controller(&address)).await?;
    let controller = ControllerHandle::spawn(
        connection,
        config.default_segment.clone(),
        config.scheduler.settings(),
        storage,
    );
    info!("controller {address} running");

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    controller.shutdown().await
}
