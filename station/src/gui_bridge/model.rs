use groundlink::diagnostics::MetricsSnapshot;
use groundlink::network::ConnectionState;
use groundlink::packets::FusedRecord;
use serde::Serialize;

/// What the dashboard shows: the newest record and the partner link state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardModel {
    pub latest: Option<FusedRecord>,
    pub connection: ConnectionState,
    pub records_seen: u64,
}

impl DashboardModel {
    pub fn apply_record(&mut self, record: &FusedRecord) {
        self.latest = Some(record.clone());
        self.records_seen += 1;
    }

    pub fn apply_state(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    pub fn status(&self, metrics: MetricsSnapshot) -> StatusReport {
        StatusReport {
            connection: self.connection,
            records_seen: self.records_seen,
            last_record_at: self.latest.as_ref().map(|r| r.timestamp()),
            metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub connection: ConnectionState,
    pub records_seen: u64,
    pub last_record_at: Option<String>,
    pub metrics: MetricsSnapshot,
}
