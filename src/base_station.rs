//! Shared storage for base-station telemetry.
//!
//! One ring and one backing stream serve every open base-station tag; the
//! tag registry refcounts them and tears both down when the last tag
//! closes.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::reactor::{ReactorAssociation, ReactorId, StreamReactor};
use crate::storage::BaseStationStore;
use crate::types::{BaseStationData, DataResponse};

pub(crate) struct BaseStationStorage {
    store: BaseStationStore,
    stream: Mutex<Option<Arc<StreamReactor>>>,
}

impl BaseStationStorage {
    pub(crate) fn new(ring_capacity: usize) -> Self {
        Self { store: BaseStationStore::new(ring_capacity), stream: Mutex::new(None) }
    }

    /// Sink for the base-station stream.
    pub(crate) fn push_data(&self, data: BaseStationData) {
        self.store.push(data);
    }

    pub(crate) fn latest(&self) -> DataResponse<BaseStationData> {
        self.store.latest()
    }

    pub(crate) fn latest_n(&self, count: usize) -> DataResponse<BaseStationData> {
        self.store.latest_n(count)
    }

    pub(crate) fn since_index(&self, start: u64) -> DataResponse<BaseStationData> {
        self.store.since_index(start)
    }

    pub(crate) fn set_stream(&self, reactor: Arc<StreamReactor>) {
        *self.stream.lock() = Some(reactor);
    }

    /// Detach the reactor so the caller can cancel it without holding the
    /// slot lock.
    pub(crate) fn take_stream(&self) -> Option<Arc<StreamReactor>> {
        self.stream.lock().take()
    }

    /// Whether a backing stream is currently attached. The channel monitor
    /// re-opens detached streams when the transport recovers.
    pub(crate) fn has_stream(&self) -> bool {
        self.stream.lock().is_some()
    }
}

impl ReactorAssociation for BaseStationStorage {
    fn clear_association(&self, reactor: ReactorId) -> bool {
        let mut stream = self.stream.lock();
        if stream.as_ref().is_some_and(|r| r.id() == reactor) {
            *stream = None;
            debug!("base-station stream detached after finish");
            return true;
        }
        false
    }
}
