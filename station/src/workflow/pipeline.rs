use crate::gui_bridge::bridge::{BridgeCommand, CommandSink, GuiBridge};
use crate::workflow::config::StationConfig;
use anyhow::Context;
use groundlink::diagnostics::LinkMetrics;
use groundlink::network::NetworkRelay;
use groundlink::packets::FusedRecord;
use groundlink::serial::{SerialLinkReader, ABORT_COMMAND};
use groundlink::{FusionEngine, LinkResult};
use log::{info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Explicitly wired link layer: reader -> fusion -> relay, and relay -> reader
/// for partner commands.
///
/// Partner commands are queued and written to the radio one at a time on the
/// blocking pool.
#[derive(Clone)]
pub struct Station {
    reader: Arc<SerialLinkReader>,
    fusion: FusionEngine,
    relay: NetworkRelay,
    metrics: Arc<LinkMetrics>,
    commands: mpsc::UnboundedSender<String>,
    pending_commands: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    forwarder: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Station {
    pub fn new(
        reader: Arc<SerialLinkReader>,
        fusion: FusionEngine,
        relay: NetworkRelay,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        let (commands, pending_commands) = mpsc::unbounded_channel();
        let station = Self {
            reader,
            fusion,
            relay,
            metrics,
            commands,
            pending_commands: Arc::new(Mutex::new(Some(pending_commands))),
            forwarder: Arc::new(Mutex::new(None)),
        };
        station.wire();
        station
    }

    fn wire(&self) {
        let fusion = self.fusion.clone();
        self.reader
            .telemetry()
            .subscribe(move |packet| fusion.handle_telemetry(packet.clone()));
        let fusion = self.fusion.clone();
        self.reader
            .auxiliary()
            .subscribe(move |packet| fusion.handle_auxiliary(packet.clone()));
        let fusion = self.fusion.clone();
        self.reader
            .transmission()
            .subscribe(move |info| fusion.handle_transmission(*info));

        let relay = self.relay.clone();
        self.fusion.records().subscribe(move |record: &FusedRecord| {
            if let Err(err) = relay.submit(&record.to_outbound()) {
                warn!("Could not queue record for partner station: {}", err);
            }
        });

        let commands = self.commands.clone();
        self.relay
            .data_received()
            .subscribe(move |message| queue_command(&commands, message));
    }

    /// Mirrors fused records and link state into the dashboard.
    pub fn attach_bridge(&self, bridge: &GuiBridge) {
        let records = bridge.clone();
        self.fusion
            .records()
            .subscribe(move |record| records.publish_record(record));
        let states = bridge.clone();
        self.relay
            .state_changed()
            .subscribe(move |state| states.publish_state(*state));
    }

    pub fn command_sink(&self) -> CommandSink {
        let reader = Arc::downgrade(&self.reader);
        Arc::new(move |command: BridgeCommand| {
            let Some(reader) = reader.upgrade() else {
                return Ok(());
            };
            match command {
                BridgeCommand::Raw(text) => reader.send_raw(&text),
                BridgeCommand::Abort => abort_radio(&reader),
            }
        })
    }

    pub fn metrics(&self) -> Arc<LinkMetrics> {
        self.metrics.clone()
    }

    #[cfg(test)]
    pub fn reader(&self) -> &Arc<SerialLinkReader> {
        &self.reader
    }

    #[cfg(test)]
    pub fn fusion(&self) -> &FusionEngine {
        &self.fusion
    }

    #[cfg(test)]
    pub fn relay(&self) -> &NetworkRelay {
        &self.relay
    }

    /// Starts reading, configures the modem if asked to and starts the relay.
    pub async fn start(&self, config: &StationConfig) -> anyhow::Result<()> {
        self.reader.start().context("starting serial reader")?;
        self.start_forwarder();

        if let Some(radio) = config.radio.clone() {
            let reader = self.reader.clone();
            let apply = config.apply_radio_params;
            let settle = config.settle_delay();
            tokio::task::spawn_blocking(move || reader.configure(&radio, apply, settle))
                .await
                .context("configuring radio modem")?;
        }

        self.relay.start();
        Ok(())
    }

    fn start_forwarder(&self) {
        let Ok(mut forwarder) = self.forwarder.lock() else {
            return;
        };
        if forwarder.is_some() {
            return;
        }
        let pending = self
            .pending_commands
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        if let Some(pending) = pending {
            let reader = Arc::downgrade(&self.reader);
            *forwarder = Some(tokio::spawn(forward_commands(reader, pending)));
        }
    }

    /// Stops the reader, forwards any held packets to the partner and closes
    /// the relay.
    pub async fn shutdown(&self) {
        let reader = self.reader.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || reader.stop()).await {
            warn!("Serial reader shutdown task failed: {}", err);
        }
        self.fusion.flush();
        self.relay.close().await;
        let forwarder = self.forwarder.lock().ok().and_then(|mut f| f.take());
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        info!("Station stopped; {:?}", self.metrics.snapshot());
    }
}

/// Sends the abort command to the radio.
fn abort_radio(reader: &SerialLinkReader) -> LinkResult<()> {
    info!("Abort requested");
    reader.send_raw(ABORT_COMMAND)
}

/// Queues a partner message for the radio as one command line.
fn queue_command(commands: &mpsc::UnboundedSender<String>, message: &Value) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if commands.send(line).is_err() {
                warn!("Command forwarder stopped; partner command dropped");
            }
        }
        Err(err) => warn!("Partner command could not be serialized: {}", err),
    }
}

async fn forward_commands(
    reader: Weak<SerialLinkReader>,
    mut commands: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = commands.recv().await {
        let Some(reader) = reader.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || reader.send_raw(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Forwarding partner command failed: {}", err),
            Err(err) => warn!("Command forwarding task failed: {}", err),
        }
    }
}
