use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::SubscriptionRegistry;
use crate::codec::line::try_decode_line;
use crate::diagnostics::LinkMetrics;
use crate::packets::{AuxiliaryPacket, Frame, SlotPacket, TelemetryPacket, TransmissionInfo};
use crate::prelude::{LinkError, LinkResult, SerialSettings};
use crate::serial::commands::{configuration_sequence, terminated, RadioParams};
use crate::serial::port::{RadioPort, SerialDevice};

const READ_CHUNK: usize = 256;

/// Owns the modem's serial port, decodes its output and publishes packets.
///
/// Without a port the reader is inert: `start` does nothing and sends are
/// dropped with a warning.
pub struct SerialLinkReader {
    shared: Arc<ReaderShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct ReaderShared {
    port: Option<Mutex<Box<dyn RadioPort>>>,
    running: AtomicBool,
    settings: SerialSettings,
    telemetry: SubscriptionRegistry<TelemetryPacket>,
    auxiliary: SubscriptionRegistry<AuxiliaryPacket>,
    transmission: SubscriptionRegistry<TransmissionInfo>,
    last_transmission: Mutex<Option<TransmissionInfo>>,
    metrics: Arc<LinkMetrics>,
}

impl SerialLinkReader {
    /// Opens the configured device, falling back to an inert reader.
    pub fn open(settings: SerialSettings, metrics: Arc<LinkMetrics>) -> Self {
        let port = match settings.port.as_deref() {
            Some(path) => match SerialDevice::open(path, &settings) {
                Ok(device) => Some(Box::new(device) as Box<dyn RadioPort>),
                Err(err) => {
                    error!("Cannot open serial port {}: {}; reader disabled", path, err);
                    None
                }
            },
            None => {
                warn!("No serial port configured; reader disabled");
                None
            }
        };
        Self::build(port, settings, metrics)
    }

    pub fn with_port(
        port: Box<dyn RadioPort>,
        settings: SerialSettings,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        Self::build(Some(port), settings, metrics)
    }

    pub fn inert(settings: SerialSettings, metrics: Arc<LinkMetrics>) -> Self {
        Self::build(None, settings, metrics)
    }

    fn build(
        port: Option<Box<dyn RadioPort>>,
        settings: SerialSettings,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(ReaderShared {
                port: port.map(Mutex::new),
                running: AtomicBool::new(false),
                settings,
                telemetry: SubscriptionRegistry::new("telemetry"),
                auxiliary: SubscriptionRegistry::new("auxiliary"),
                transmission: SubscriptionRegistry::new("transmission"),
                last_transmission: Mutex::new(None),
                metrics,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn has_device(&self) -> bool {
        self.shared.port.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn telemetry(&self) -> &SubscriptionRegistry<TelemetryPacket> {
        &self.shared.telemetry
    }

    pub fn auxiliary(&self) -> &SubscriptionRegistry<AuxiliaryPacket> {
        &self.shared.auxiliary
    }

    pub fn transmission(&self) -> &SubscriptionRegistry<TransmissionInfo> {
        &self.shared.transmission
    }

    /// Spawns the read loop. Calling it again while running does nothing.
    pub fn start(&self) -> LinkResult<()> {
        if !self.has_device() {
            warn!("Serial reader has no device; not starting read loop");
            return Ok(());
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("start() called while the read loop is already running");
            return Ok(());
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || shared.read_loop());
        match spawned {
            Ok(handle) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(handle);
                }
                info!("Serial read loop started");
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(LinkError::Io(err))
            }
        }
    }

    /// Stops the read loop and waits for it up to the configured join timeout.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        let Some(handle) = handle else {
            return;
        };

        let deadline = Instant::now() + self.shared.settings.join_timeout();
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("Serial read loop panicked");
            }
            info!("Serial read loop stopped");
        } else {
            warn!(
                "Serial read loop did not stop within {:?}; detaching",
                self.shared.settings.join_timeout()
            );
        }
    }

    /// Writes one command line, appending CRLF when missing.
    pub fn send_raw(&self, text: &str) -> LinkResult<()> {
        let Some(port) = self.shared.port.as_ref() else {
            warn!("Serial port unavailable; not sending {:?}", text);
            return Ok(());
        };
        let line = terminated(text);
        let mut port = port.lock().map_err(|_| poisoned())?;
        match port.write_all(line.as_bytes()) {
            Ok(()) => {
                info!("Sent over UART: {}", line.trim_end());
                Ok(())
            }
            Err(err) => {
                error!("UART write of {:?} failed: {}", line.trim_end(), err);
                Err(err.into())
            }
        }
    }

    /// Puts the modem into receive mode, optionally applying radio parameters.
    ///
    /// Each command is followed by `settle`; a failed write is logged and the
    /// remaining commands are still sent.
    pub fn configure(&self, params: &RadioParams, apply_params: bool, settle: Duration) {
        let Some(port) = self.shared.port.as_ref() else {
            warn!("Serial port unavailable; skipping radio configuration");
            return;
        };
        info!("Configuring radio (apply parameters: {})", apply_params);

        for command in configuration_sequence(params, apply_params) {
            let written = port
                .lock()
                .map_err(|_| poisoned())
                .and_then(|mut p| p.write_all(command.as_bytes()));
            match written {
                Ok(()) => debug!("Sent radio command {}", command.trim_end()),
                Err(err) => error!("Radio command {} failed: {}", command.trim_end(), err),
            }
            if !settle.is_zero() {
                thread::sleep(settle);
            }
        }

        match port.lock() {
            Ok(mut p) => {
                if let Err(err) = p.clear_input() {
                    error!("Clearing serial input failed: {}", err);
                }
            }
            Err(_) => error!("Serial port lock poisoned while clearing input"),
        }
        info!("Radio configuration finished");
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "serial port lock poisoned")
}

impl Drop for SerialLinkReader {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

impl ReaderShared {
    fn read_loop(&self) {
        let Some(port) = self.port.as_ref() else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            let read = match port.lock() {
                Ok(mut p) => p.read(&mut chunk),
                Err(_) => {
                    error!("Serial port lock poisoned; read loop exiting");
                    break;
                }
            };
            match read {
                Ok(0) => thread::sleep(self.settings.idle_poll()),
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(end) = pending.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = pending.drain(..=end).collect();
                        let text = String::from_utf8_lossy(&raw);
                        let line = text.trim();
                        if !line.is_empty() {
                            self.handle_line(line);
                        }
                    }
                    if pending.len() > self.settings.max_line_bytes {
                        warn!(
                            "Discarding {} bytes of serial input with no line end",
                            pending.len()
                        );
                        self.metrics.record_decode_error();
                        pending.clear();
                    }
                }
                Err(err) => {
                    error!("Serial read failed: {}; read loop exiting", err);
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn handle_line(&self, line: &str) {
        self.metrics.record_line();
        debug!("Serial line: {}", line);

        match try_decode_line(line) {
            Ok(Some(Frame::Telemetry(mut packet))) => {
                self.stamp(&mut packet);
                self.metrics.record_frame();
                info!(
                    "Telemetry A: P={} R={} Y={} VV={} ALT={} BAT={}",
                    packet.pitch,
                    packet.roll,
                    packet.yaw,
                    packet.vertical_velocity,
                    packet.altitude,
                    packet.battery_level
                );
                self.telemetry.publish(&packet);
            }
            Ok(Some(Frame::Auxiliary(mut packet))) => {
                self.stamp(&mut packet);
                self.metrics.record_frame();
                info!(
                    "Auxiliary B: LAT={} LON={} STS={}",
                    packet.latitude, packet.longitude, packet.status
                );
                self.auxiliary.publish(&packet);
            }
            Ok(Some(Frame::Transmission(info))) => {
                self.metrics.record_transmission();
                debug!(
                    "Transmission LEN={} RSSI={} SNR={}",
                    info.len, info.rssi, info.snr
                );
                if let Ok(mut last) = self.last_transmission.lock() {
                    *last = Some(info);
                }
                self.transmission.publish(&info);
            }
            Ok(None) => {}
            Err(err) => {
                self.metrics.record_decode_error();
                warn!("Dropping radio frame: {} (line {:?})", err, line);
            }
        }
    }

    /// Applies the diagnostics line that preceded this frame, consuming it.
    fn stamp<P: SlotPacket>(&self, packet: &mut P) {
        let info = self.last_transmission.lock().ok().and_then(|mut l| l.take());
        if let Some(info) = info {
            packet.stamp(&info);
        }
    }
}
