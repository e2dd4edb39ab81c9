use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::packets::SlotPacket;

/// Holds the best packet of one kind while its fusion window is open.
pub struct PendingSlot<P> {
    packet: Option<P>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl<P: SlotPacket> PendingSlot<P> {
    pub fn new() -> Self {
        Self {
            packet: None,
            deadline: None,
            timer: None,
            generation: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.packet.is_some()
    }

    pub fn packet(&self) -> Option<&P> {
        self.packet.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Identifies the current window; a timer carrying an older value is stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stores the first packet of a window and returns the window's generation.
    pub fn open(&mut self, packet: P, deadline: Instant) -> u64 {
        self.generation += 1;
        self.packet = Some(packet);
        self.deadline = Some(deadline);
        self.generation
    }

    pub fn arm(&mut self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    /// Keeps whichever packet has the higher SNR. Returns true if `packet` replaced
    /// the stored one; ties keep the stored packet.
    pub fn offer(&mut self, packet: P) -> bool {
        let stronger = match &self.packet {
            Some(current) => is_stronger(packet.snr(), current.snr()),
            None => true,
        };
        if stronger {
            self.packet = Some(packet);
        }
        stronger
    }

    /// Empties the slot and cancels its timer.
    pub fn clear(&mut self) -> Option<P> {
        self.generation += 1;
        self.deadline = None;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.packet.take()
    }
}

impl<P: SlotPacket> Default for PendingSlot<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// A missing SNR ranks below any reported value.
fn is_stronger(candidate: Option<i32>, current: Option<i32>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate > current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
