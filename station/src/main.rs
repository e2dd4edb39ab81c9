use anyhow::Context;
use clap::Parser;
use generator::profile::feed;
use groundlink::diagnostics::LinkMetrics;
use groundlink::network::NetworkRelay;
use groundlink::serial::{MemoryPort, SerialLinkReader};
use groundlink::FusionEngine;
use gui_bridge::bridge::GuiBridge;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::{Overrides, StationConfig};
use workflow::pipeline::Station;

mod generator;
mod gui_bridge;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Ground-station link: radio modem to partner station")]
struct Args {
    /// Load a station config from YAML
    #[arg(long)]
    config: Option<PathBuf>,
    /// Serial device of the radio modem
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// Partner station host
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    partner_port: Option<u16>,
    /// Fusion window in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,
    /// Run the modem configuration sequence on startup
    #[arg(long, default_value_t = false)]
    configure_radio: bool,
    /// Skip the rfcfg command when configuring
    #[arg(long, default_value_t = false)]
    skip_rfcfg: bool,
    /// Feed the pipeline from a simulated modem instead of hardware
    #[arg(long, default_value_t = false)]
    simulate: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Serve the GUI bridge over HTTP
    #[arg(long, default_value_t = false)]
    serve: bool,
    #[arg(long)]
    bridge_addr: Option<SocketAddr>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port.clone(),
            baud_rate: self.baud,
            host: self.host.clone(),
            partner_port: self.partner_port,
            window_ms: self.window_ms,
            configure_radio: self.configure_radio,
            skip_rfcfg: self.skip_rfcfg,
            simulate: self.simulate,
            seed: self.seed,
            serve: self.serve,
            bridge_bind: self.bridge_addr,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = if let Some(path) = &args.config {
        StationConfig::load(path)?
    } else {
        StationConfig::default()
    };
    config.apply(&args.overrides());
    config.validate()?;

    let runtime = TokioBuilder::new_multi_thread()
        .enable_all()
        .thread_name("groundlink")
        .build()
        .context("creating tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: StationConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(LinkMetrics::new());

    let (reader, simulated_port) = if config.simulation.enabled {
        info!("Simulation mode: modem output is synthetic");
        let (port, handle) = MemoryPort::new();
        let reader =
            SerialLinkReader::with_port(Box::new(port), config.serial.clone(), metrics.clone());
        (reader, Some(handle))
    } else {
        (
            SerialLinkReader::open(config.serial.clone(), metrics.clone()),
            None,
        )
    };

    let fusion = FusionEngine::from_current(&config.fusion, metrics.clone())
        .context("creating fusion engine")?;
    let relay = NetworkRelay::from_current(config.network.clone(), metrics.clone())
        .context("creating network relay")?;
    let station = Station::new(Arc::new(reader), fusion, relay, metrics);

    let bridge_task = if config.bridge.enabled {
        let bridge = GuiBridge::new(station.metrics(), station.command_sink());
        station.attach_bridge(&bridge);
        let (_, task) = bridge.spawn(config.bridge.bind)?;
        Some(task)
    } else {
        None
    };

    station.start(&config).await?;
    let feed_task = simulated_port.map(|port| tokio::spawn(feed(port, config.simulation.clone())));

    info!("Station running (Ctrl+C to stop)...");
    signal::ctrl_c().await.context("awaiting Ctrl+C to exit")?;
    info!("Shutting down");

    if let Some(task) = feed_task {
        task.abort();
    }
    station.shutdown().await;
    if let Some(task) = bridge_task {
        task.abort();
    }
    Ok(())
}
