//! AT command strings understood by the LoRa modem.

use serde::{Deserialize, Serialize};

pub const LINE_TERMINATOR: &str = "\r\n";
pub const WAKE_COMMAND: &str = "at\r\n";
pub const TEST_MODE_COMMAND: &str = "at+mode=test\r\n";
pub const LISTEN_COMMAND: &str = "at+test=rxlrpkt\r\n";
pub const ABORT_COMMAND: &str = "abort";

/// Radio parameters written with the `rfcfg` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioParams {
    pub frequency_mhz: u32,
    pub spreading_factor: u8,
    pub bandwidth_khz: u32,
    pub tx_preamble: u8,
    pub rx_preamble: u8,
    pub power_dbm: i8,
    pub crc: bool,
    pub iq_invert: bool,
    pub lorawan_mode: bool,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            frequency_mhz: 868,
            spreading_factor: 7,
            bandwidth_khz: 125,
            tx_preamble: 8,
            rx_preamble: 8,
            power_dbm: 14,
            crc: true,
            iq_invert: false,
            lorawan_mode: false,
        }
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "ON"
    } else {
        "OFF"
    }
}

impl RadioParams {
    pub fn rfcfg_command(&self) -> String {
        format!(
            "at+test=rfcfg,{}.000,{},{},{},{},{},{},{},{}{}",
            self.frequency_mhz,
            self.spreading_factor,
            self.bandwidth_khz,
            self.tx_preamble,
            self.rx_preamble,
            self.power_dbm,
            on_off(self.crc),
            on_off(self.iq_invert),
            on_off(self.lorawan_mode),
            LINE_TERMINATOR
        )
    }
}

/// Ordered commands that put the modem into receive mode.
pub fn configuration_sequence(params: &RadioParams, apply_params: bool) -> Vec<String> {
    let mut commands = vec![WAKE_COMMAND.to_string(), TEST_MODE_COMMAND.to_string()];
    if apply_params {
        commands.push(params.rfcfg_command());
    }
    commands.push(LISTEN_COMMAND.to_string());
    commands
}

/// Appends CRLF unless the text already ends with a line terminator.
pub fn terminated(text: &str) -> String {
    if text.ends_with(LINE_TERMINATOR) {
        text.to_string()
    } else {
        format!("{}{}", text.trim_end_matches(['\r', '\n']), LINE_TERMINATOR)
    }
}
