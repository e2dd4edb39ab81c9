use serde::Serialize;
use std::sync::Mutex;

/// Counters shared by the reader, the fusion engine and the relay.
pub struct LinkMetrics {
    inner: Mutex<MetricsSnapshot>,
}

/// Point-in-time copy of [`LinkMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub transmission_infos: u64,
    pub records_fused: u64,
    pub connect_attempts: u64,
    pub connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    fn bump(&self, field: impl FnOnce(&mut MetricsSnapshot) -> &mut u64) {
        if let Ok(mut metrics) = self.inner.lock() {
            *field(&mut *metrics) += 1;
        }
    }

    pub fn record_line(&self) {
        self.bump(|m| &mut m.lines_read);
    }

    pub fn record_frame(&self) {
        self.bump(|m| &mut m.frames_decoded);
    }

    pub fn record_decode_error(&self) {
        self.bump(|m| &mut m.decode_errors);
    }

    pub fn record_transmission(&self) {
        self.bump(|m| &mut m.transmission_infos);
    }

    pub fn record_fused(&self) {
        self.bump(|m| &mut m.records_fused);
    }

    pub fn record_connect_attempt(&self) {
        self.bump(|m| &mut m.connect_attempts);
    }

    pub fn record_connection(&self) {
        self.bump(|m| &mut m.connections);
    }

    pub fn record_sent(&self) {
        self.bump(|m| &mut m.messages_sent);
    }

    pub fn record_received(&self) {
        self.bump(|m| &mut m.messages_received);
    }

    pub fn record_dropped(&self) {
        self.bump(|m| &mut m.messages_dropped);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            *metrics
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}
