//! Supervisor for the transport channel and every background stream.
//!
//! The [`Driver`] owns the service handle, the device inventory, and the
//! lists of live subscriptions. Its monitor task polls the channel state:
//! when the channel becomes ready it opens the device-event stream (plus
//! the reference-device-state stream) and re-opens any detached
//! base-station or wireless reactors; when the channel drops out of ready
//! the event streams are cancelled and the inventory is cleared: every
//! device is considered disconnected until the service reports otherwise.
//!
//! Device events are processed strictly in order on a single dispatcher
//! task: inventory first, then every open subscription's streams and rings,
//! then the user's device-event callback.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::base_station::BaseStationStorage;
use crate::config::ClientConfig;
use crate::manager::{DataManager, StreamKind};
use crate::reactor::{ReactorAssociation, ReactorId, StreamReactor};
use crate::service::{
    ChannelState, CoreService, DataFrameDeviceRequest, DataFrameStreamRequest,
    DataLoggingRequest, DeviceDataStreamRequest, DeviceEventStreamRequest,
};
use crate::types::{
    DataLogState, DeviceDescriptor, DeviceEvent, DeviceId, HardwareStates, ReferenceDeviceState,
};
use crate::wireless::WirelessManager;

type DeviceEventCallback = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;
type ChannelStateCallback = Arc<dyn Fn(ChannelState) + Send + Sync>;
type ReferenceStateCallback = Arc<dyn Fn(&ReferenceDeviceState) + Send + Sync>;

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct Driver {
    service: Arc<dyn CoreService>,
    config: ClientConfig,

    /// Connected devices, keyed by `DeviceId::key()`. Mutated only from the
    /// device-event dispatcher and the not-ready transition.
    inventory: Mutex<HashMap<u64, DeviceDescriptor>>,

    managers: Mutex<Vec<Arc<DataManager>>>,
    base_stations: Mutex<Vec<Arc<BaseStationStorage>>>,
    wireless_managers: Mutex<Vec<Arc<WirelessManager>>>,

    device_event_stream: Mutex<Option<Arc<StreamReactor>>>,
    reference_stream: Mutex<Option<Arc<StreamReactor>>>,
    reference_state: Mutex<ReferenceDeviceState>,

    device_event_callback: RwLock<Option<DeviceEventCallback>>,
    channel_state_callback: RwLock<Option<ChannelStateCallback>>,
    reference_state_callback: RwLock<Option<ReferenceStateCallback>>,

    monitor: Mutex<Option<MonitorHandle>>,
}

impl Driver {
    pub(crate) fn new(service: Arc<dyn CoreService>, config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            service,
            config,
            inventory: Mutex::new(HashMap::new()),
            managers: Mutex::new(Vec::new()),
            base_stations: Mutex::new(Vec::new()),
            wireless_managers: Mutex::new(Vec::new()),
            device_event_stream: Mutex::new(None),
            reference_stream: Mutex::new(None),
            reference_state: Mutex::new(ReferenceDeviceState::default()),
            device_event_callback: RwLock::new(None),
            channel_state_callback: RwLock::new(None),
            reference_state_callback: RwLock::new(None),
            monitor: Mutex::new(None),
        })
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Launch the channel monitor. Idempotent; requires a tokio runtime.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        info!(endpoint = %self.config.endpoint, "starting channel monitor");
        let cancel = CancellationToken::new();
        let driver = Arc::clone(self);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            driver.monitor_loop(task_cancel).await;
        });
        *monitor = Some(MonitorHandle { cancel, task });
    }

    /// Cancel every stream, stop the monitor, and drop all subscriptions.
    /// Idempotent: a second call finds nothing left to tear down.
    pub(crate) async fn shutdown(&self) {
        info!("cancelling all device and frame streams");
        let managers: Vec<_> = std::mem::take(&mut *self.managers.lock());
        for manager in managers {
            manager.mark_closed();
            self.close_manager_streams(&manager).await;
        }

        info!("cancelling base-station streams");
        let storages: Vec<_> = std::mem::take(&mut *self.base_stations.lock());
        for storage in storages {
            let reactor = storage.take_stream();
            if let Some(reactor) = reactor {
                reactor.cancel().await;
            }
        }

        info!("cancelling wireless sessions");
        let wireless: Vec<_> = std::mem::take(&mut *self.wireless_managers.lock());
        for manager in wireless {
            let session = manager.take_session();
            if let Some(session) = session {
                session.cancel().await;
            }
        }

        info!("stopping channel monitor");
        let monitor = self.monitor.lock().take();
        if let Some(MonitorHandle { cancel, task }) = monitor {
            cancel.cancel();
            let _ = task.await;
        }

        // The monitor cancels these on its way out; cover the case where it
        // was never started.
        let reactor = self.device_event_stream.lock().take();
        if let Some(reactor) = reactor {
            reactor.cancel().await;
        }
        let reactor = self.reference_stream.lock().take();
        if let Some(reactor) = reactor {
            reactor.cancel().await;
        }
    }

    async fn monitor_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // None is the never-observed sentinel: the first observation always
        // counts as a transition.
        let mut previous: Option<ChannelState> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let state = self.service.channel_state();
            if previous == Some(state) {
                continue;
            }

            if state == ChannelState::Ready {
                info!("channel is ready");
                self.on_channel_ready(&cancel).await;
            } else {
                info!(state = ?state, "channel is not ready");
                self.on_channel_not_ready(previous).await;
            }
            previous = Some(state);

            let callback = self.channel_state_callback.read().clone();
            if let Some(callback) = callback {
                callback(state);
            }
        }

        info!("channel monitor stopped");
        let reactor = self.device_event_stream.lock().take();
        if let Some(reactor) = reactor {
            reactor.cancel().await;
        }
        let reactor = self.reference_stream.lock().take();
        if let Some(reactor) = reactor {
            reactor.cancel().await;
        }
    }

    async fn on_channel_ready(self: &Arc<Self>, cancel: &CancellationToken) {
        self.open_device_event_stream(cancel).await;
        self.open_reference_state_stream().await;

        // Re-open base-station streams detached by an earlier outage.
        let storages: Vec<_> = self.base_stations.lock().clone();
        for storage in storages {
            if !storage.has_stream() {
                self.open_base_station_stream(&storage).await;
            }
        }

        // Likewise for wireless sessions.
        let wireless: Vec<_> = self.wireless_managers.lock().clone();
        for manager in wireless {
            if !manager.is_stream_active() {
                self.open_wireless_session(&manager).await;
            }
        }
    }

    async fn on_channel_not_ready(&self, previous: Option<ChannelState>) {
        let reactor = self.device_event_stream.lock().take();
        if let Some(reactor) = reactor {
            info!("stopping device event stream");
            reactor.cancel().await;
        }
        let reactor = self.reference_stream.lock().take();
        if let Some(reactor) = reactor {
            reactor.cancel().await;
        }

        // Ready was lost: the service is assumed offline and every device
        // disconnected.
        if previous == Some(ChannelState::Ready) {
            let mut inventory = self.inventory.lock();
            if !inventory.is_empty() {
                info!(devices = inventory.len(), "clearing device inventory");
                inventory.clear();
            }
        }
    }

    async fn open_device_event_stream(self: &Arc<Self>, cancel: &CancellationToken) {
        let request = DeviceEventStreamRequest::default();
        let stream = match self.service.open_device_event_stream(request).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "failed to open device event stream");
                return;
            }
        };

        info!("opening device event stream");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DeviceEvent>();
        let association_arc: Arc<dyn ReactorAssociation> = self.clone();
        let association: Weak<dyn ReactorAssociation> = Arc::downgrade(&association_arc);
        let reactor = StreamReactor::spawn(
            "device-events",
            stream,
            move |event| {
                let _ = event_tx.send(event);
            },
            association,
        );
        *self.device_event_stream.lock() = Some(reactor);

        // One dispatcher per stream incarnation keeps event handling
        // serialized; it drains and exits when the reactor finishes.
        let driver = Arc::clone(self);
        let dispatcher_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = dispatcher_cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                driver.process_device_event(event).await;
            }
            debug!("device event dispatcher stopped");
        });
    }

    async fn open_reference_state_stream(self: &Arc<Self>) {
        let stream = match self.service.open_reference_device_state_stream().await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "failed to open reference device state stream");
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let association_arc: Arc<dyn ReactorAssociation> = self.clone();
        let association: Weak<dyn ReactorAssociation> = Arc::downgrade(&association_arc);
        let reactor = StreamReactor::spawn(
            "reference-device-state",
            stream,
            move |state: ReferenceDeviceState| {
                if let Some(driver) = weak.upgrade() {
                    *driver.reference_state.lock() = state;
                    let callback = driver.reference_state_callback.read().clone();
                    if let Some(callback) = callback {
                        callback(&state);
                    }
                }
            },
            association,
        );
        *self.reference_stream.lock() = Some(reactor);
    }

    /// Apply one device event: inventory, then every subscription, then the
    /// user callback.
    async fn process_device_event(self: &Arc<Self>, event: DeviceEvent) {
        let device_id = event.device.device_id();
        let key = device_id.key();

        {
            let mut inventory = self.inventory.lock();
            if inventory.contains_key(&key) {
                if event.connected {
                    // Descriptor refresh for a device we already track.
                    inventory.insert(key, event.device.clone());
                } else {
                    info!(
                        siu_uuid = device_id.siu_uuid,
                        port_id = device_id.port_id,
                        "device removal detected"
                    );
                    inventory.remove(&key);
                }
            } else if event.connected {
                info!(
                    siu_uuid = device_id.siu_uuid,
                    port_id = device_id.port_id,
                    "device connected"
                );
                inventory.insert(key, event.device.clone());
            }
        }

        let managers: Vec<_> = self.managers.lock().clone();
        for manager in managers {
            match manager.kind() {
                StreamKind::DeviceData => {
                    self.update_device_stream(&manager, &event.device, event.connected).await;
                }
                StreamKind::DataFrame => {
                    self.update_frame_stream(&manager, &event.device, event.connected).await;
                }
            }
        }

        let callback = self.device_event_callback.read().clone();
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    /// Bring one subscription's per-device stream and ring in line with a
    /// device's connection state.
    async fn update_device_stream(
        self: &Arc<Self>,
        manager: &Arc<DataManager>,
        device: &DeviceDescriptor,
        connected: bool,
    ) {
        let device_id = device.device_id();
        if manager.is_closed() || !manager.is_requested(device_id) {
            return;
        }

        if !connected {
            info!(
                siu_uuid = device_id.siu_uuid,
                port_id = device_id.port_id,
                "cancelling data stream for disconnected device"
            );
            let reactor = manager.take_stream(device_id);
            if let Some(reactor) = reactor {
                reactor.cancel().await;
            }
            manager.remove_storage(device_id);
            return;
        }

        manager.ensure_storage(device);
        if manager.has_stream(device_id) {
            return;
        }

        info!(
            siu_uuid = device_id.siu_uuid,
            port_id = device_id.port_id,
            "opening data stream for device"
        );
        let request = device_stream_request(manager, device_id);
        match self.service.open_device_data_stream(request).await {
            Ok(stream) => {
                let sink_manager = Arc::downgrade(manager);
                let association_arc: Arc<dyn ReactorAssociation> = manager.clone();
                let association: Weak<dyn ReactorAssociation> = Arc::downgrade(&association_arc);
                let reactor = StreamReactor::spawn(
                    "device-data",
                    stream,
                    move |packet| {
                        if let Some(manager) = sink_manager.upgrade() {
                            manager.update_device_data(packet);
                        }
                    },
                    association,
                );
                if !manager.add_stream(device_id, Arc::clone(&reactor)) {
                    reactor.cancel().await;
                }
            }
            Err(error) => {
                warn!(
                    siu_uuid = device_id.siu_uuid,
                    port_id = device_id.port_id,
                    %error,
                    "failed to open device data stream"
                );
            }
        }
    }

    /// React to a device event on a frame subscription: adjust rings, then
    /// tear down and reopen the combined stream against the current device
    /// set, since frame streams fix their device list at open time.
    async fn update_frame_stream(
        self: &Arc<Self>,
        manager: &Arc<DataManager>,
        device: &DeviceDescriptor,
        connected: bool,
    ) {
        let device_id = device.device_id();
        if manager.is_closed() || !manager.is_requested(device_id) {
            return;
        }

        if !connected {
            info!(
                siu_uuid = device_id.siu_uuid,
                port_id = device_id.port_id,
                "removing frame storage for disconnected device"
            );
            manager.remove_storage(device_id);
        }

        let reactor = manager.take_frame_stream();
        if let Some(reactor) = reactor {
            reactor.cancel().await;
        }
        self.open_data_frame(manager).await;
    }

    /// Open the combined-frame stream for every requested connected device.
    pub(crate) async fn open_data_frame(self: &Arc<Self>, manager: &Arc<DataManager>) {
        if manager.kind() != StreamKind::DataFrame {
            warn!("subscription is not for data frames; frame stream will not be opened");
            return;
        }
        if manager.is_closed() {
            return;
        }

        let devices: Vec<DeviceDescriptor> = {
            let inventory = self.inventory.lock();
            inventory
                .values()
                .filter(|descriptor| manager.is_requested(descriptor.device_id()))
                .cloned()
                .collect()
        };

        let data_request = manager.request();
        let mut request = DataFrameStreamRequest {
            report_interval_ms: data_request.report_interval_ms,
            buffer_depth: data_request.buffer_depth,
            devices: Vec::with_capacity(devices.len()),
        };
        for descriptor in &devices {
            manager.ensure_storage(descriptor);
            request.devices.push(DataFrameDeviceRequest {
                device: descriptor.device_id(),
                field_mask: data_request.field_mask,
                include_raw_sensor_data: data_request.include_raw_sensor_data,
                fusion_mode: data_request.fusion_mode,
            });
        }

        match self.service.open_data_frame_stream(request).await {
            Ok(stream) => {
                let sink_manager = Arc::downgrade(manager);
                let association_arc: Arc<dyn ReactorAssociation> = manager.clone();
                let association: Weak<dyn ReactorAssociation> = Arc::downgrade(&association_arc);
                let reactor = StreamReactor::spawn(
                    "data-frame",
                    stream,
                    move |frame| {
                        if let Some(manager) = sink_manager.upgrade() {
                            manager.update_data_frame(frame);
                        }
                    },
                    association,
                );
                manager.set_frame_stream(reactor);
            }
            Err(error) => {
                warn!(%error, "failed to open data frame stream");
            }
        }
    }

    /// Open per-device streams for a fresh DeviceData subscription against
    /// the currently connected devices.
    pub(crate) async fn open_device_streams(self: &Arc<Self>, manager: &Arc<DataManager>) {
        if manager.kind() != StreamKind::DeviceData {
            warn!("subscription is not for device data; streams will not be opened");
            return;
        }
        let devices: Vec<DeviceDescriptor> = self.inventory.lock().values().cloned().collect();
        for descriptor in devices {
            self.update_device_stream(manager, &descriptor, true).await;
        }
    }

    pub(crate) fn register_manager(&self, manager: Arc<DataManager>) {
        self.managers.lock().push(manager);
    }

    /// Cancel a subscription's streams and forget it. Once this returns no
    /// further packets enter the subscription's rings and no further
    /// callbacks fire for it.
    pub(crate) async fn close_request(&self, manager: &Arc<DataManager>) {
        manager.mark_closed();
        self.close_manager_streams(manager).await;

        let mut managers = self.managers.lock();
        if let Some(position) = managers.iter().position(|m| Arc::ptr_eq(m, manager)) {
            managers.remove(position);
        }
    }

    async fn close_manager_streams(&self, manager: &Arc<DataManager>) {
        match manager.kind() {
            StreamKind::DeviceData => {
                for reactor in manager.drain_streams() {
                    reactor.cancel().await;
                }
            }
            StreamKind::DataFrame => {
                let reactor = manager.take_frame_stream();
                if let Some(reactor) = reactor {
                    reactor.cancel().await;
                }
            }
        }
    }

    /// Create the shared base-station storage and open its stream. If the
    /// open fails the storage stays registered with a detached stream; the
    /// monitor re-opens it when the channel is ready.
    pub(crate) async fn request_base_station_storage(self: &Arc<Self>) -> Arc<BaseStationStorage> {
        let storage = Arc::new(BaseStationStorage::new(self.config.ring_capacity));
        self.open_base_station_stream(&storage).await;
        self.base_stations.lock().push(Arc::clone(&storage));
        storage
    }

    async fn open_base_station_stream(self: &Arc<Self>, storage: &Arc<BaseStationStorage>) {
        match self.service.open_base_station_stream().await {
            Ok(stream) => {
                let sink_storage = Arc::downgrade(storage);
                let association_arc: Arc<dyn ReactorAssociation> = storage.clone();
                let association: Weak<dyn ReactorAssociation> = Arc::downgrade(&association_arc);
                let reactor = StreamReactor::spawn(
                    "base-station-data",
                    stream,
                    move |data| {
                        if let Some(storage) = sink_storage.upgrade() {
                            storage.push_data(data);
                        }
                    },
                    association,
                );
                storage.set_stream(reactor);
            }
            Err(error) => {
                warn!(%error, "failed to open base station stream");
            }
        }
    }

    /// Cancel the base-station stream and forget the storage.
    pub(crate) async fn close_base_station(&self, storage: &Arc<BaseStationStorage>) {
        {
            let mut storages = self.base_stations.lock();
            if let Some(position) = storages.iter().position(|s| Arc::ptr_eq(s, storage)) {
                storages.remove(position);
            }
        }
        let reactor = storage.take_stream();
        if let Some(reactor) = reactor {
            reactor.cancel().await;
        }
    }

    pub(crate) async fn create_wireless_manager(self: &Arc<Self>) -> Arc<WirelessManager> {
        let manager = WirelessManager::new();
        self.open_wireless_session(&manager).await;
        self.wireless_managers.lock().push(Arc::clone(&manager));
        manager
    }

    async fn open_wireless_session(&self, manager: &Arc<WirelessManager>) {
        match self.service.open_wireless_stream().await {
            Ok(streams) => {
                manager.attach_session(streams);
            }
            Err(error) => {
                warn!(%error, "failed to open wireless management stream");
            }
        }
    }

    pub(crate) async fn delete_wireless_manager(&self, manager: &Arc<WirelessManager>) {
        {
            let mut wireless = self.wireless_managers.lock();
            if let Some(position) = wireless.iter().position(|m| Arc::ptr_eq(m, manager)) {
                wireless.remove(position);
            }
        }
        let session = manager.take_session();
        if let Some(session) = session {
            session.cancel().await;
        }
    }

    pub(crate) fn register_device_event_callback(&self, callback: DeviceEventCallback) {
        *self.device_event_callback.write() = Some(callback);
    }

    pub(crate) fn reset_device_event_callback(&self) {
        *self.device_event_callback.write() = None;
    }

    pub(crate) fn register_channel_state_callback(&self, callback: ChannelStateCallback) {
        *self.channel_state_callback.write() = Some(callback);
    }

    pub(crate) fn reset_channel_state_callback(&self) {
        *self.channel_state_callback.write() = None;
    }

    pub(crate) fn register_reference_state_callback(&self, callback: ReferenceStateCallback) {
        *self.reference_state_callback.write() = Some(callback);
    }

    pub(crate) fn reset_reference_state_callback(&self) {
        *self.reference_state_callback.write() = None;
    }

    pub(crate) fn current_reference_device_state(&self) -> ReferenceDeviceState {
        *self.reference_state.lock()
    }

    /// Unary RPC failures map to empty results; the service being away is
    /// not an error the inventory API surfaces.
    pub(crate) async fn get_tracking_devices(&self) -> Vec<DeviceDescriptor> {
        match self.service.get_tracking_devices().await {
            Ok(devices) => devices,
            Err(error) => {
                warn!(%error, "GetTrackingDevices RPC failed");
                Vec::new()
            }
        }
    }

    pub(crate) async fn get_hardware_states(&self) -> HardwareStates {
        match self.service.get_hardware_states().await {
            Ok(states) => states,
            Err(error) => {
                warn!(%error, "GetHardwareStates RPC failed");
                HardwareStates::default()
            }
        }
    }

    pub(crate) async fn set_base_station_motor_running(&self, active: bool) -> bool {
        match self.service.set_base_station_motor_running(active).await {
            Ok(success) => success,
            Err(error) => {
                warn!(%error, "SetBaseStationMotorRunning RPC failed");
                false
            }
        }
    }

    pub(crate) async fn select_reference_device(
        &self,
        enabled: bool,
        siu_uuid: u32,
        port_num: u32,
    ) -> bool {
        match self.service.select_reference_device(enabled, siu_uuid, port_num).await {
            Ok(success) => success,
            Err(error) => {
                warn!(%error, "SelectReferenceDevice RPC failed");
                false
            }
        }
    }

    pub(crate) async fn send_data_logging_request(
        &self,
        request: DataLoggingRequest,
    ) -> DataLogState {
        match self.service.send_data_logging_request(request).await {
            Ok(state) => state,
            Err(error) => {
                warn!(%error, "SendDataLoggingRequest RPC failed");
                DataLogState::RpcFail
            }
        }
    }
}

fn device_stream_request(manager: &DataManager, device: DeviceId) -> DeviceDataStreamRequest {
    let request = manager.request();
    DeviceDataStreamRequest {
        device,
        field_mask: request.field_mask,
        include_raw_sensor_data: request.include_raw_sensor_data,
        report_interval_ms: request.report_interval_ms,
        buffer_depth: request.buffer_depth,
        fusion_mode: request.fusion_mode,
    }
}

impl ReactorAssociation for Driver {
    fn clear_association(&self, reactor: ReactorId) -> bool {
        {
            let mut stream = self.device_event_stream.lock();
            if stream.as_ref().is_some_and(|r| r.id() == reactor) {
                *stream = None;
                debug!("device event stream detached after finish");
                return true;
            }
        }
        let mut stream = self.reference_stream.lock();
        if stream.as_ref().is_some_and(|r| r.id() == reactor) {
            *stream = None;
            debug!("reference device state stream detached after finish");
            return true;
        }
        false
    }
}
