//! Per-subscription state: rings, streams, and the user callback.
//!
//! A [`DataManager`] backs one open request. In device-data mode it owns
//! one ring and one stream reactor per matching connected device; in
//! data-frame mode it owns the same ring map but a single combined-frame
//! reactor whose payloads fan out into the rings. Either way the manager is
//! the reactor sink: packets are pushed into the matching ring first, then
//! the per-subscription callback (if any) runs with no core lock held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::reactor::{ReactorAssociation, ReactorId, StreamReactor};
use crate::storage::{system_now_ms, PacketStore};
use crate::types::{
    DataFrame, DataRequest, DataResponse, DeviceDescriptor, DeviceId, TrackingDeviceData,
};

/// Which shape of stream a subscription consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    /// One per-device stream per matching connected device
    DeviceData,
    /// A single combined stream carrying multi-device frames
    DataFrame,
}

type DeviceDataCallback = Arc<dyn Fn(&TrackingDeviceData) + Send + Sync>;
type DataFrameCallback = Arc<dyn Fn(&DataFrame) + Send + Sync>;

struct DeviceStorage {
    descriptor: DeviceDescriptor,
    store: PacketStore<TrackingDeviceData>,
}

/// State for one DeviceData or DataFrame subscription.
pub(crate) struct DataManager {
    request: DataRequest,
    kind: StreamKind,
    ring_capacity: usize,

    /// Device key to ring. Shared-locked on the packet path, exclusive on
    /// storage add/remove.
    storages: RwLock<HashMap<u64, DeviceStorage>>,

    /// Device key to per-device stream reactor (device-data mode).
    device_streams: Mutex<HashMap<u64, Arc<StreamReactor>>>,

    /// The combined-frame reactor (data-frame mode).
    frame_stream: Mutex<Option<Arc<StreamReactor>>>,

    device_data_callback: RwLock<Option<DeviceDataCallback>>,
    data_frame_callback: RwLock<Option<DataFrameCallback>>,

    /// Set when the subscription is being closed. A device event already in
    /// flight must not reopen streams for a closed subscription.
    closed: AtomicBool,
}

impl DataManager {
    pub(crate) fn new(request: DataRequest, kind: StreamKind, ring_capacity: usize) -> Self {
        Self {
            request,
            kind,
            ring_capacity,
            storages: RwLock::new(HashMap::new()),
            device_streams: Mutex::new(HashMap::new()),
            frame_stream: Mutex::new(None),
            device_data_callback: RwLock::new(None),
            data_frame_callback: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn request(&self) -> &DataRequest {
        &self.request
    }

    pub(crate) fn kind(&self) -> StreamKind {
        self.kind
    }

    /// An empty device filter requests every device.
    pub(crate) fn is_requested(&self, device_id: DeviceId) -> bool {
        self.request.requested_devices.is_empty()
            || self.request.requested_devices.contains(&device_id)
    }

    /// Create the ring for `descriptor` if it does not exist yet.
    pub(crate) fn ensure_storage(&self, descriptor: &DeviceDescriptor) {
        let key = descriptor.device_id().key();
        let mut storages = self.storages.write();
        if !storages.contains_key(&key) {
            info!(
                siu_uuid = descriptor.siu_uuid,
                port_id = descriptor.port_id,
                "adding data storage for device"
            );
            storages.insert(
                key,
                DeviceStorage {
                    descriptor: descriptor.clone(),
                    store: PacketStore::new(self.ring_capacity),
                },
            );
        }
    }

    pub(crate) fn remove_storage(&self, device_id: DeviceId) {
        let mut storages = self.storages.write();
        if storages.remove(&device_id.key()).is_some() {
            info!(
                siu_uuid = device_id.siu_uuid,
                port_id = device_id.port_id,
                "removed data storage for device"
            );
        }
    }

    /// Devices that currently have a ring in this subscription.
    pub(crate) fn storage_list(&self) -> Vec<DeviceId> {
        self.storages.read().values().map(|s| s.descriptor.device_id()).collect()
    }

    /// Sink for the per-device streams: stamp, push, then callback.
    pub(crate) fn update_device_data(&self, mut packet: TrackingDeviceData) {
        packet.stamp_sdk_received(system_now_ms());
        let key = packet.device_id().key();

        let callback = self.device_data_callback.read().clone();
        {
            let storages = self.storages.read();
            match (storages.get(&key), &callback) {
                (Some(storage), Some(_)) => {
                    storage.store.push(packet.clone());
                }
                (Some(storage), None) => {
                    storage.store.push(packet);
                    return;
                }
                (None, None) => return,
                (None, Some(_)) => {}
            }
        }

        if let Some(callback) = callback {
            callback(&packet);
        }
    }

    /// Sink for the combined-frame stream: fan payloads into rings by
    /// device key, then run the frame callback once.
    pub(crate) fn update_data_frame(&self, mut frame: DataFrame) {
        let now_ms = system_now_ms();
        for payload in &mut frame.device_data {
            payload.stamp_sdk_received(now_ms);
        }

        {
            let storages = self.storages.read();
            for payload in &frame.device_data {
                if let Some(storage) = storages.get(&payload.device_id().key()) {
                    storage.store.push(payload.clone());
                }
            }
        }

        let callback = self.data_frame_callback.read().clone();
        if let Some(callback) = callback {
            callback(&frame);
        }
    }

    /// At most one callback at a time; registering replaces the previous
    /// one. No-op with a warning when the subscription is not device-data.
    pub(crate) fn register_device_data_callback(&self, callback: DeviceDataCallback) {
        if self.kind != StreamKind::DeviceData {
            warn!("cannot register a device-data callback on a data-frame subscription");
            return;
        }
        *self.device_data_callback.write() = Some(callback);
    }

    pub(crate) fn reset_device_data_callback(&self) {
        *self.device_data_callback.write() = None;
    }

    /// At most one callback at a time; registering replaces the previous
    /// one. No-op with a warning when the subscription is not data-frame.
    pub(crate) fn register_data_frame_callback(&self, callback: DataFrameCallback) {
        if self.kind != StreamKind::DataFrame {
            warn!("cannot register a data-frame callback on a device-data subscription");
            return;
        }
        *self.data_frame_callback.write() = Some(callback);
    }

    pub(crate) fn reset_data_frame_callback(&self) {
        *self.data_frame_callback.write() = None;
    }

    pub(crate) fn latest(&self, device_id: DeviceId) -> DataResponse<TrackingDeviceData> {
        self.with_store(device_id, |store| store.latest())
    }

    pub(crate) fn latest_n(
        &self,
        device_id: DeviceId,
        count: usize,
    ) -> DataResponse<TrackingDeviceData> {
        self.with_store(device_id, |store| store.latest_n(count))
    }

    pub(crate) fn latest_within(
        &self,
        device_id: DeviceId,
        timeout: Duration,
    ) -> DataResponse<TrackingDeviceData> {
        self.with_store(device_id, |store| store.latest_within(timeout))
    }

    pub(crate) fn with_max_age(
        &self,
        device_id: DeviceId,
        max_age: Duration,
    ) -> DataResponse<TrackingDeviceData> {
        self.with_store(device_id, |store| store.with_max_age(max_age))
    }

    pub(crate) fn since_index(
        &self,
        device_id: DeviceId,
        start: u64,
    ) -> DataResponse<TrackingDeviceData> {
        self.with_store(device_id, |store| store.since_index(start))
    }

    fn with_store<R>(
        &self,
        device_id: DeviceId,
        read: impl FnOnce(&PacketStore<TrackingDeviceData>) -> R,
    ) -> R
    where
        R: Default,
    {
        let storages = self.storages.read();
        match storages.get(&device_id.key()) {
            Some(storage) => read(&storage.store),
            None => R::default(),
        }
    }

    /// Register the per-device stream reactor. Refused (with a warning)
    /// when one is already registered for the device.
    pub(crate) fn add_stream(&self, device_id: DeviceId, reactor: Arc<StreamReactor>) -> bool {
        let mut streams = self.device_streams.lock();
        if streams.contains_key(&device_id.key()) {
            warn!(
                siu_uuid = device_id.siu_uuid,
                port_id = device_id.port_id,
                "device stream already exists"
            );
            return false;
        }
        streams.insert(device_id.key(), reactor);
        true
    }

    pub(crate) fn has_stream(&self, device_id: DeviceId) -> bool {
        self.device_streams.lock().contains_key(&device_id.key())
    }

    /// Detach the per-device stream reactor so the caller can cancel it
    /// without holding the map lock.
    pub(crate) fn take_stream(&self, device_id: DeviceId) -> Option<Arc<StreamReactor>> {
        self.device_streams.lock().remove(&device_id.key())
    }

    /// Detach every per-device stream reactor.
    pub(crate) fn drain_streams(&self) -> Vec<Arc<StreamReactor>> {
        self.device_streams.lock().drain().map(|(_, reactor)| reactor).collect()
    }

    pub(crate) fn set_frame_stream(&self, reactor: Arc<StreamReactor>) {
        *self.frame_stream.lock() = Some(reactor);
    }

    /// Detach the combined-frame reactor for out-of-lock cancellation.
    pub(crate) fn take_frame_stream(&self) -> Option<Arc<StreamReactor>> {
        self.frame_stream.lock().take()
    }
}

impl ReactorAssociation for DataManager {
    /// A reactor that finished on its own (peer close, transport failure)
    /// detaches itself here so the subscription holds no dangling pointer.
    fn clear_association(&self, reactor: ReactorId) -> bool {
        {
            let mut frame_stream = self.frame_stream.lock();
            if frame_stream.as_ref().is_some_and(|r| r.id() == reactor) {
                *frame_stream = None;
                debug!("frame stream detached after finish");
                return true;
            }
        }

        let mut streams = self.device_streams.lock();
        let key = streams
            .iter()
            .find(|(_, candidate)| candidate.id() == reactor)
            .map(|(key, _)| *key);
        match key {
            Some(key) => {
                streams.remove(&key);
                debug!("device stream detached after finish");
                true
            }
            None => false,
        }
    }
}
