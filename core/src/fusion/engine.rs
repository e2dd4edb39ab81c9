use log::{debug, error};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::bus::SubscriptionRegistry;
use crate::diagnostics::LinkMetrics;
use crate::fusion::slot::PendingSlot;
use crate::packets::{
    AuxiliaryPacket, FusedRecord, PacketKind, SlotPacket, TelemetryPacket, TransmissionInfo,
};
use crate::prelude::{FusionConfig, LinkError, LinkResult};

/// Pairs telemetry and auxiliary packets that arrive within one window.
///
/// Each kind has its own slot. The first packet of a kind opens a window; a
/// second packet of the same kind before the deadline keeps the stronger of the
/// two and flushes at once. When the deadline passes, whatever is held is
/// flushed. Every flush empties both slots.
///
/// Records are published while the engine's lock is held, so record
/// subscribers must not call back into the engine.
#[derive(Clone)]
pub struct FusionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    window: Duration,
    runtime: Handle,
    state: Mutex<FusionState>,
    records: SubscriptionRegistry<FusedRecord>,
    metrics: Arc<LinkMetrics>,
}

struct FusionState {
    telemetry: PendingSlot<TelemetryPacket>,
    auxiliary: PendingSlot<AuxiliaryPacket>,
    last_transmission: Option<TransmissionInfo>,
}

trait SlotAccess: SlotPacket + Sized {
    fn slot(state: &mut FusionState) -> &mut PendingSlot<Self>;
}

impl SlotAccess for TelemetryPacket {
    fn slot(state: &mut FusionState) -> &mut PendingSlot<Self> {
        &mut state.telemetry
    }
}

impl SlotAccess for AuxiliaryPacket {
    fn slot(state: &mut FusionState) -> &mut PendingSlot<Self> {
        &mut state.auxiliary
    }
}

impl FusionEngine {
    /// Creates an engine whose deadline timers run on `runtime`.
    pub fn new(config: &FusionConfig, runtime: Handle, metrics: Arc<LinkMetrics>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                window: config.window(),
                runtime,
                state: Mutex::new(FusionState {
                    telemetry: PendingSlot::new(),
                    auxiliary: PendingSlot::new(),
                    last_transmission: None,
                }),
                records: SubscriptionRegistry::new("fused-records"),
                metrics,
            }),
        }
    }

    /// Creates an engine on the runtime of the calling context.
    pub fn from_current(config: &FusionConfig, metrics: Arc<LinkMetrics>) -> LinkResult<Self> {
        let runtime = Handle::try_current().map_err(|e| LinkError::Runtime(e.to_string()))?;
        Ok(Self::new(config, runtime, metrics))
    }

    pub fn records(&self) -> &SubscriptionRegistry<FusedRecord> {
        &self.inner.records
    }

    pub fn handle_telemetry(&self, packet: TelemetryPacket) {
        self.inner.ingest(packet);
    }

    pub fn handle_auxiliary(&self, packet: AuxiliaryPacket) {
        self.inner.ingest(packet);
    }

    /// Remembers the latest diagnostics; never opens or closes a window.
    pub fn handle_transmission(&self, info: TransmissionInfo) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.last_transmission = Some(info);
        }
    }

    pub fn last_transmission(&self) -> Option<TransmissionInfo> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.last_transmission)
    }

    pub fn is_pending(&self, kind: PacketKind) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| match kind {
                PacketKind::Telemetry => state.telemetry.is_pending(),
                PacketKind::Auxiliary => state.auxiliary.is_pending(),
            })
            .unwrap_or(false)
    }

    /// Flushes whatever is held without waiting for the deadline.
    pub fn flush(&self) -> Option<FusedRecord> {
        let mut state = self.inner.state.lock().ok()?;
        self.inner.flush_locked(&mut state)
    }
}

impl EngineInner {
    fn ingest<P: SlotAccess>(self: &Arc<Self>, packet: P) {
        let Ok(mut state) = self.state.lock() else {
            error!("Fusion state poisoned; dropping {:?} packet", P::KIND);
            return;
        };

        let slot = P::slot(&mut state);
        if slot.is_pending() {
            if slot.offer(packet) {
                debug!("{:?}: stronger duplicate replaces held packet", P::KIND);
            } else {
                debug!("{:?}: duplicate discarded, held packet is stronger", P::KIND);
            }
            self.flush_locked(&mut state);
            return;
        }

        let deadline = Instant::now() + self.window;
        let generation = slot.open(packet, deadline);
        let timer = self.spawn_deadline(P::KIND, generation, deadline);
        P::slot(&mut state).arm(timer);
        debug!("{:?}: window opened", P::KIND);
    }

    fn spawn_deadline(
        self: &Arc<Self>,
        kind: PacketKind,
        generation: u64,
        deadline: Instant,
    ) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            sleep_until(deadline).await;
            if let Some(engine) = engine.upgrade() {
                engine.on_deadline(kind, generation);
            }
        })
    }

    fn on_deadline(&self, kind: PacketKind, generation: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let (current, pending) = match kind {
            PacketKind::Telemetry => (state.telemetry.generation(), state.telemetry.is_pending()),
            PacketKind::Auxiliary => (state.auxiliary.generation(), state.auxiliary.is_pending()),
        };
        if current != generation || !pending {
            debug!("{:?}: stale deadline ignored", kind);
            return;
        }
        debug!("{:?}: window expired", kind);
        self.flush_locked(&mut state);
    }

    fn flush_locked(&self, state: &mut FusionState) -> Option<FusedRecord> {
        let telemetry = state.telemetry.clear();
        let auxiliary = state.auxiliary.clear();
        let record = FusedRecord::merge(telemetry.as_ref(), auxiliary.as_ref())?
            .with_transmission(state.last_transmission);

        self.metrics.record_fused();
        debug!(
            "Fused record (telemetry: {}, auxiliary: {})",
            telemetry.is_some(),
            auxiliary.is_some()
        );
        self.records.publish(&record);
        Some(record)
    }
}
