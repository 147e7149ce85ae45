//! Merges inbound deltas into the in-memory entity view.
//!
//! Positions and device statuses are keyed by device id and ordered by the
//! server-reported observation time. A live snapshot is never replaced by an
//! older observation; equal times overwrite. Events are append-only.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use fleetsync_protocol::messages::{
    DeviceStatusPayload, EntityId, EventPayload, PositionPayload,
};

use crate::buffer::RingBuffer;
use crate::config::SyncConfig;
use crate::types::SyncUpdate;

/// The current position of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub device_id: EntityId,
    /// Server-reported fix time.
    pub observed_at: DateTime<Utc>,
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
    pub position: PositionPayload,
}

/// The current status of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: EntityId,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub status: DeviceStatusPayload,
}

/// An entry of the recent-events feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub received_at: DateTime<Utc>,
    pub event: EventPayload,
}

/// Outcome of applying one delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Inserted,
    Replaced,
    /// Same observation time and identical content.
    Duplicate,
    /// Older than the live snapshot.
    Stale,
}

impl Applied {
    fn changed(self) -> bool {
        matches!(self, Applied::Inserted | Applied::Replaced)
    }
}

fn verdict<T: PartialEq>(
    stored: Option<(&DateTime<Utc>, &T)>,
    observed_at: &DateTime<Utc>,
    incoming: &T,
) -> Applied {
    match stored {
        None => Applied::Inserted,
        Some((at, _)) if observed_at < at => Applied::Stale,
        Some((at, payload)) if observed_at == at && payload == incoming => Applied::Duplicate,
        Some(_) => Applied::Replaced,
    }
}

/// Authoritative entity state.
#[derive(Debug)]
pub(crate) struct EntityStore {
    positions: HashMap<EntityId, PositionSnapshot>,
    devices: HashMap<EntityId, DeviceSnapshot>,
    events: RingBuffer<EventRecord>,
    stale_positions: RingBuffer<PositionSnapshot>,
    seen_event_ids: HashSet<EntityId>,
    event_id_order: RingBuffer<EntityId>,
}

impl EntityStore {
    pub(crate) fn new(config: &SyncConfig) -> Self {
        Self {
            positions: HashMap::new(),
            devices: HashMap::new(),
            events: RingBuffer::new(config.recent_events_capacity),
            stale_positions: RingBuffer::new(config.stale_history_capacity),
            seen_event_ids: HashSet::new(),
            event_id_order: RingBuffer::new(config.event_id_memory),
        }
    }

    pub(crate) fn apply_position(
        &mut self,
        position: PositionPayload,
        received_at: DateTime<Utc>,
    ) -> (Applied, PositionSnapshot) {
        let device_id = position.device_id.clone();
        let observed_at = position.fix_time;
        let applied = verdict(
            self.positions
                .get(&device_id)
                .map(|s| (&s.observed_at, &s.position)),
            &observed_at,
            &position,
        );
        let snapshot = PositionSnapshot {
            device_id: device_id.clone(),
            observed_at,
            received_at,
            position,
        };
        match applied {
            Applied::Inserted | Applied::Replaced => {
                self.positions.insert(device_id, snapshot.clone());
            }
            Applied::Stale => {
                self.stale_positions.push(snapshot.clone());
                debug!(
                    device_id = %device_id,
                    %observed_at,
                    history = self.stale_positions.len(),
                    "stale position kept in side history"
                );
            }
            Applied::Duplicate => {
                trace!(device_id = %device_id, "duplicate position");
            }
        }
        (applied, snapshot)
    }

    pub(crate) fn apply_status(
        &mut self,
        status: DeviceStatusPayload,
        received_at: DateTime<Utc>,
    ) -> (Applied, DeviceSnapshot) {
        let device_id = status.device_id.clone();
        let observed_at = status.last_update;
        let applied = verdict(
            self.devices
                .get(&device_id)
                .map(|s| (&s.observed_at, &s.status)),
            &observed_at,
            &status,
        );
        let snapshot = DeviceSnapshot {
            device_id: device_id.clone(),
            observed_at,
            received_at,
            status,
        };
        match applied {
            Applied::Inserted | Applied::Replaced => {
                self.devices.insert(device_id, snapshot.clone());
            }
            Applied::Stale => {
                debug!(device_id = %device_id, %observed_at, "ignoring stale device status");
            }
            Applied::Duplicate => {}
        }
        (applied, snapshot)
    }

    /// Appends an event unless its id was seen recently. Returns the record
    /// when appended.
    pub(crate) fn append_event(
        &mut self,
        event: EventPayload,
        received_at: DateTime<Utc>,
    ) -> Option<EventRecord> {
        if let Some(id) = &event.id {
            if self.seen_event_ids.contains(id) {
                trace!(event_id = %id, "duplicate event suppressed");
                return None;
            }
            self.seen_event_ids.insert(id.clone());
            if let Some(forgotten) = self.event_id_order.push(id.clone()) {
                self.seen_event_ids.remove(&forgotten);
            }
        }
        let record = EventRecord { received_at, event };
        self.events.push(record.clone());
        Some(record)
    }

    pub(crate) fn position_of(&self, device_id: &EntityId) -> Option<PositionSnapshot> {
        self.positions.get(device_id).cloned()
    }

    pub(crate) fn status_of(&self, device_id: &EntityId) -> Option<DeviceSnapshot> {
        self.devices.get(device_id).cloned()
    }

    /// Oldest first.
    pub(crate) fn recent_events(&self) -> Vec<EventRecord> {
        self.events.iter().cloned().collect()
    }

    /// Oldest first.
    pub(crate) fn stale_positions(&self) -> Vec<PositionSnapshot> {
        self.stale_positions.iter().cloned().collect()
    }
}

/// Shared handle to the entity store.
///
/// Only the event loop writes; facade accessors take short read locks.
#[derive(Debug, Clone)]
pub(crate) struct Reconciler {
    store: Arc<RwLock<EntityStore>>,
}

impl Reconciler {
    pub(crate) fn new(config: &SyncConfig) -> Self {
        Self {
            store: Arc::new(RwLock::new(EntityStore::new(config))),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityStore> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies positions in order; returns updates for snapshots that changed.
    pub(crate) fn positions(&self, batch: Vec<PositionPayload>) -> Vec<SyncUpdate> {
        let now = Utc::now();
        let mut store = self.write();
        batch
            .into_iter()
            .filter_map(|p| {
                let (applied, snapshot) = store.apply_position(p, now);
                applied.changed().then_some(SyncUpdate::Position(snapshot))
            })
            .collect()
    }

    pub(crate) fn device_statuses(&self, batch: Vec<DeviceStatusPayload>) -> Vec<SyncUpdate> {
        let now = Utc::now();
        let mut store = self.write();
        batch
            .into_iter()
            .filter_map(|s| {
                let (applied, snapshot) = store.apply_status(s, now);
                applied.changed().then_some(SyncUpdate::DeviceStatus(snapshot))
            })
            .collect()
    }

    pub(crate) fn events(&self, batch: Vec<EventPayload>) -> Vec<SyncUpdate> {
        let now = Utc::now();
        let mut store = self.write();
        batch
            .into_iter()
            .filter_map(|e| store.append_event(e, now).map(SyncUpdate::Event))
            .collect()
    }
}
