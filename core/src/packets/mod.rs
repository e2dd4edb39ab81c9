pub mod packet;
pub mod record;

pub use packet::{AuxiliaryPacket, Frame, PacketKind, SlotPacket, TelemetryPacket, TransmissionInfo};
pub use record::{FusedRecord, OutboundMessage, OutboundTelemetry, OutboundTransmission};
