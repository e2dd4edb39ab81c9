use anyhow::{bail, Context};
use groundlink::prelude::{FusionConfig, RelayConfig, SerialSettings};
use groundlink::serial::RadioParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::generator::profile::SimulationConfig;

/// Everything the station needs to wire the link layer together.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub serial: SerialSettings,
    /// Radio parameters to configure the modem with. `None` leaves the modem as is.
    pub radio: Option<RadioParams>,
    /// Sends the `rfcfg` command as part of the configuration sequence.
    pub apply_radio_params: bool,
    pub settle_delay_ms: u64,
    pub fusion: FusionConfig,
    pub network: RelayConfig,
    pub bridge: BridgeConfig,
    pub simulation: SimulationConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([127, 0, 0, 1], 9000)),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            radio: None,
            apply_radio_params: true,
            settle_delay_ms: 500,
            fusion: FusionConfig::default(),
            network: RelayConfig::default(),
            bridge: BridgeConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub host: Option<String>,
    pub partner_port: Option<u16>,
    pub window_ms: Option<u64>,
    pub configure_radio: bool,
    pub skip_rfcfg: bool,
    pub simulate: bool,
    pub seed: Option<u64>,
    pub serve: bool,
    pub bridge_bind: Option<SocketAddr>,
}

impl StationConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading station config {}", path_ref.display()))?;
        let config: StationConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing station config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(port) = &overrides.port {
            self.serial.port = Some(port.clone());
        }
        if let Some(baud_rate) = overrides.baud_rate {
            self.serial.baud_rate = baud_rate;
        }
        if let Some(host) = &overrides.host {
            self.network.host = host.clone();
        }
        if let Some(port) = overrides.partner_port {
            self.network.port = port;
        }
        if let Some(window_ms) = overrides.window_ms {
            self.fusion.window_ms = window_ms;
        }
        if overrides.configure_radio && self.radio.is_none() {
            self.radio = Some(RadioParams::default());
        }
        if overrides.skip_rfcfg {
            self.apply_radio_params = false;
        }
        if overrides.simulate {
            self.simulation.enabled = true;
        }
        if let Some(seed) = overrides.seed {
            self.simulation.seed = seed;
        }
        if overrides.serve {
            self.bridge.enabled = true;
        }
        if let Some(bind) = overrides.bridge_bind {
            self.bridge.bind = bind;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fusion.window_ms == 0 {
            bail!("fusion.window_ms must be greater than zero");
        }
        if self.network.host.trim().is_empty() {
            bail!("network.host must not be empty");
        }
        if self.network.max_retries == Some(0) {
            bail!("network.max_retries must be at least 1 when set");
        }
        if self.serial.max_line_bytes == 0 || self.network.max_frame_bytes == 0 {
            bail!("serial.max_line_bytes and network.max_frame_bytes must be greater than zero");
        }
        if self.simulation.enabled {
            let sim = &self.simulation;
            if sim.interval_ms == 0 {
                bail!("simulation.interval_ms must be greater than zero");
            }
            if !sim.noise.is_finite() || sim.noise < 0.0 {
                bail!("simulation.noise must be a finite, non-negative number");
            }
            if !sim.launch_velocity.is_finite() || sim.launch_velocity <= 0.0 {
                bail!("simulation.launch_velocity must be a finite, positive number");
            }
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_follow_field_setup() {
        let cfg = StationConfig::default();
        assert_eq!(cfg.serial.baud_rate, 9600);
        assert_eq!(cfg.network.port, 65432);
        assert_eq!(cfg.fusion.window_ms, 500);
        assert_eq!(cfg.settle_delay(), Duration::from_millis(500));
        assert!(cfg.radio.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_load_reads_partial_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"serial:\n  port: /dev/ttyUSB0\nradio:\n  spreading_factor: 9\nnetwork:\n  host: 10.0.0.2\n  max_retries: 5\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = StationConfig::load(&path).unwrap();

        assert_eq!(cfg.serial.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cfg.serial.baud_rate, 9600);
        let radio = cfg.radio.unwrap();
        assert_eq!(radio.spreading_factor, 9);
        assert_eq!(radio.frequency_mhz, 868);
        assert_eq!(cfg.network.host, "10.0.0.2");
        assert_eq!(cfg.network.max_retries, Some(5));
        assert_eq!(cfg.network.heartbeat_interval_ms, 500);
    }

    #[test]
    fn config_load_reports_bad_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"fusion: [not, a, map]\n").unwrap();
        let path = temp.into_temp_path();
        let err = StationConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("parsing station config"));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut cfg = StationConfig::default();
        cfg.apply(&Overrides {
            port: Some("COM3".into()),
            partner_port: Some(7000),
            window_ms: Some(250),
            configure_radio: true,
            skip_rfcfg: true,
            simulate: true,
            seed: Some(42),
            ..Overrides::default()
        });

        assert_eq!(cfg.serial.port.as_deref(), Some("COM3"));
        assert_eq!(cfg.network.port, 7000);
        assert_eq!(cfg.fusion.window_ms, 250);
        assert_eq!(cfg.radio, Some(RadioParams::default()));
        assert!(!cfg.apply_radio_params);
        assert!(cfg.simulation.enabled);
        assert_eq!(cfg.simulation.seed, 42);
        assert!(!cfg.bridge.enabled);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut cfg = StationConfig::default();
        cfg.fusion.window_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unusable_simulation() {
        let mut cfg = StationConfig::default();
        cfg.simulation.enabled = true;
        assert!(cfg.validate().is_ok());

        cfg.simulation.noise = f64::NAN;
        assert!(cfg.validate().is_err());
        cfg.simulation.noise = -1.0;
        assert!(cfg.validate().is_err());

        cfg.simulation.noise = 0.5;
        cfg.simulation.launch_velocity = f64::INFINITY;
        assert!(cfg.validate().is_err());
    }
}
