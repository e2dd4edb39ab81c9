use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::packets::packet::{AuxiliaryPacket, TelemetryPacket, TransmissionInfo};

/// Merged view of the packets held when a fusion window closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedRecord {
    pub produced_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
    /// Last diagnostic line seen by the engine at flush time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transmission: Option<TransmissionInfo>,
}

impl FusedRecord {
    /// Merges the held packets; auxiliary keys overwrite telemetry keys.
    ///
    /// Returns `None` when neither packet is present.
    pub fn merge(
        telemetry: Option<&TelemetryPacket>,
        auxiliary: Option<&AuxiliaryPacket>,
    ) -> Option<Self> {
        let base = telemetry.map(to_fields);
        let overlay = auxiliary.map(to_fields);
        Self::from_fields(base, overlay)
    }

    pub fn from_fields(
        base: Option<Map<String, Value>>,
        overlay: Option<Map<String, Value>>,
    ) -> Option<Self> {
        let fields = match (base, overlay) {
            (None, None) => return None,
            (Some(fields), None) | (None, Some(fields)) => fields,
            (Some(mut fields), Some(overlay)) => {
                fields.extend(overlay);
                fields
            }
        };
        Some(Self {
            produced_at: Utc::now(),
            fields,
            transmission: None,
        })
    }

    pub fn with_transmission(mut self, transmission: Option<TransmissionInfo>) -> Self {
        self.transmission = transmission;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// ISO-8601 production time, UTC with microseconds.
    pub fn timestamp(&self) -> String {
        self.produced_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Numeric view of a field; decimal strings are parsed.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("field {} is not numeric: {:?}", key, s);
                    None
                }
            },
            _ => None,
        }
    }

    /// Builds the partner-station message for this record.
    pub fn to_outbound(&self) -> OutboundMessage {
        let number = |key: &str| self.number(key).unwrap_or(0.0);
        let link = |key: &str, fallback: Option<i32>| {
            self.number(key)
                .map(|v| v as i32)
                .or(fallback)
                .unwrap_or(0)
        };

        OutboundMessage {
            timestamp: self.timestamp(),
            telemetry: OutboundTelemetry {
                velocity: number("vertical_velocity"),
                altitude: number("altitude"),
                latitude: number("latitude"),
                longitude: number("longitude"),
                pitch: number("pitch"),
                roll: number("roll"),
                yaw: number("yaw"),
                status: self.number("status").map(|v| v as i64).unwrap_or(0),
            },
            transmission: OutboundTransmission {
                rssi: link("rssi", self.transmission.map(|t| t.rssi)),
                snr: link("snr", self.transmission.map(|t| t.snr)),
            },
        }
    }
}

fn to_fields<T: Serialize>(packet: &T) -> Map<String, Value> {
    match serde_json::to_value(packet) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Canonical message relayed to the partner station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub timestamp: String,
    pub telemetry: OutboundTelemetry,
    pub transmission: OutboundTransmission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundTelemetry {
    pub velocity: f64,
    pub altitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
    pub status: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutboundTransmission {
    pub rssi: i32,
    pub snr: i32,
}
