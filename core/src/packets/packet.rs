use serde::{Deserialize, Serialize};

/// Attitude and flight-state packet (`A` prefix on the radio link).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
    pub vertical_velocity: f64,
    pub altitude: f64,
    pub battery_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<i32>,
}

/// Position and status packet (`B` prefix on the radio link).
///
/// Coordinates are kept as the decimal strings the flight computer sent so no
/// precision is lost before the record reaches its consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryPacket {
    pub latitude: String,
    pub longitude: String,
    pub status: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<i32>,
}

/// Radio diagnostics reported by the modem for the frame that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionInfo {
    pub len: u32,
    pub rssi: i32,
    pub snr: i32,
}

/// Which pending slot a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Telemetry,
    Auxiliary,
}

/// One decoded serial line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Telemetry(TelemetryPacket),
    Auxiliary(AuxiliaryPacket),
    Transmission(TransmissionInfo),
}

/// Packets that can occupy a fusion slot.
pub trait SlotPacket: Serialize + Clone + Send + 'static {
    const KIND: PacketKind;

    fn snr(&self) -> Option<i32>;

    /// Copies link quality from the preceding diagnostic line when the packet
    /// carries none of its own.
    fn stamp(&mut self, info: &TransmissionInfo);
}

impl SlotPacket for TelemetryPacket {
    const KIND: PacketKind = PacketKind::Telemetry;

    fn snr(&self) -> Option<i32> {
        self.snr
    }

    fn stamp(&mut self, info: &TransmissionInfo) {
        self.rssi.get_or_insert(info.rssi);
        self.snr.get_or_insert(info.snr);
    }
}

impl SlotPacket for AuxiliaryPacket {
    const KIND: PacketKind = PacketKind::Auxiliary;

    fn snr(&self) -> Option<i32> {
        self.snr
    }

    fn stamp(&mut self, info: &TransmissionInfo) {
        self.rssi.get_or_insert(info.rssi);
        self.snr.get_or_insert(info.snr);
    }
}
