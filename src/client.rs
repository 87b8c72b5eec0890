//! The client facade and tag registry.
//!
//! [`Client`] is the single point of user interaction: it allocates opaque
//! tags for subscriptions, routes pull reads and callback registrations to
//! the right manager, refcounts the shared base-station storage, and owns
//! startup/shutdown ordering. Unknown tags are harmless: reads come back
//! empty, closes and registrations are no-ops.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::base_station::BaseStationStorage;
use crate::config::ClientConfig;
use crate::driver::Driver;
use crate::manager::{DataManager, StreamKind};
use crate::service::{ChannelState, CoreService, DataLoggingRequest};
use crate::types::{
    BaseStationData, DataFrame, DataLogState, DataRequest, DataResponse, DeviceDescriptor,
    DeviceEvent, DeviceId, HardwareStates, ReferenceDeviceState, TrackingDeviceData,
};
use crate::wireless::WirelessManager;

/// Tag value that is never handed out; returned nowhere but reserved as
/// "invalid" in wire-compatible layers.
pub const INVALID_TAG: u32 = 0;

#[derive(Default)]
struct BaseStationRegistry {
    storage: Option<Arc<BaseStationStorage>>,
    tags: HashSet<u32>,
}

/// Client for the Lodestar tracking service.
///
/// Construct with a transport adapter implementing [`CoreService`] (the
/// IDL-generated stub in production, an in-memory service in tests), then
/// [`start`](Self::start) it. Subscriptions are identified by opaque tags;
/// pull reads are synchronous and never issue network I/O.
pub struct Client {
    driver: Arc<Driver>,
    next_tag: AtomicU32,
    subscriptions: RwLock<HashMap<u32, Arc<DataManager>>>,
    base_station: Mutex<BaseStationRegistry>,
}

impl Client {
    /// Client with default configuration (endpoint
    /// [`DEFAULT_ENDPOINT`](crate::config::DEFAULT_ENDPOINT) for adapters
    /// that read it, 1 s channel polling, rings of 500).
    pub fn new(service: Arc<dyn CoreService>) -> Self {
        Self::with_config(service, ClientConfig::default())
    }

    pub fn with_config(service: Arc<dyn CoreService>, config: ClientConfig) -> Self {
        Self {
            driver: Driver::new(service, config),
            next_tag: AtomicU32::new(1),
            subscriptions: RwLock::new(HashMap::new()),
            base_station: Mutex::new(BaseStationRegistry::default()),
        }
    }

    /// Launch the channel monitor and begin processing streams. Idempotent.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.driver.start();
    }

    /// Cancel every stream and subscription and stop the monitor. After
    /// this returns no callback will fire and every reactor has released
    /// its resources. Idempotent.
    pub async fn shutdown(&self) {
        self.driver.shutdown().await;

        self.subscriptions.write().clear();
        let mut registry = self.base_station.lock();
        registry.storage = None;
        registry.tags.clear();
        info!("client shut down");
    }

    fn allocate_tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn subscription(&self, tag: u32) -> Option<Arc<DataManager>> {
        self.subscriptions.read().get(&tag).cloned()
    }

    // --- Inventory and unary controls -----------------------------------

    /// Devices currently connected and available from the service. Empty on
    /// RPC failure.
    pub async fn get_tracking_devices(&self) -> Vec<DeviceDescriptor> {
        self.driver.get_tracking_devices().await
    }

    /// Hardware states for everything the service has seen since startup.
    /// Default-empty on RPC failure.
    pub async fn get_hardware_states(&self) -> HardwareStates {
        self.driver.get_hardware_states().await
    }

    /// Turn the base-station motor on or off. `false` on RPC failure or
    /// service-side refusal.
    pub async fn set_base_station_motor_running(&self, active: bool) -> bool {
        self.driver.set_base_station_motor_running(active).await
    }

    /// Select (or clear) the reference device.
    pub async fn select_reference_device(
        &self,
        enabled: bool,
        siu_uuid: u32,
        port_num: u32,
    ) -> bool {
        self.driver.select_reference_device(enabled, siu_uuid, port_num).await
    }

    /// Latest reference-device state observed on the event stream.
    pub fn current_reference_device_state(&self) -> ReferenceDeviceState {
        self.driver.current_reference_device_state()
    }

    /// Ask the service to start logging captured data. Refused locally with
    /// [`DataLogState::Error`] when the target file exists and `overwrite`
    /// is false.
    pub async fn enable_data_logging(
        &self,
        directory: &str,
        file_name: &str,
        overwrite: bool,
    ) -> DataLogState {
        if !overwrite {
            let full_path = Path::new(directory).join(file_name);
            if full_path.exists() {
                error!(
                    path = %full_path.display(),
                    "log file exists and overwrite is disabled; logging request not sent"
                );
                return DataLogState::Error;
            }
        }

        self.driver
            .send_data_logging_request(DataLoggingRequest {
                enable_logging: true,
                directory: directory.to_string(),
                file_name: file_name.to_string(),
                overwrite,
            })
            .await
    }

    pub async fn disable_data_logging(&self) -> DataLogState {
        self.driver
            .send_data_logging_request(DataLoggingRequest {
                enable_logging: false,
                ..Default::default()
            })
            .await
    }

    // --- Event callbacks -------------------------------------------------

    /// At most one device-event callback; registering replaces it.
    pub fn register_device_event_callback(
        &self,
        callback: impl Fn(&DeviceEvent) + Send + Sync + 'static,
    ) {
        self.driver.register_device_event_callback(Arc::new(callback));
    }

    pub fn reset_device_event_callback(&self) {
        self.driver.reset_device_event_callback();
    }

    /// Channel-state callback, fired once per observed transition.
    pub fn register_channel_state_callback(
        &self,
        callback: impl Fn(ChannelState) + Send + Sync + 'static,
    ) {
        self.driver.register_channel_state_callback(Arc::new(callback));
    }

    pub fn reset_channel_state_callback(&self) {
        self.driver.reset_channel_state_callback();
    }

    pub fn register_reference_device_state_event_callback(
        &self,
        callback: impl Fn(&ReferenceDeviceState) + Send + Sync + 'static,
    ) {
        self.driver.register_reference_state_callback(Arc::new(callback));
    }

    pub fn reset_reference_device_state_event_callback(&self) {
        self.driver.reset_reference_state_callback();
    }

    // --- Subscriptions ---------------------------------------------------

    /// Open a per-device data subscription (~1 kHz per device). Returns the
    /// tag identifying it.
    pub async fn request_device_data(&self, request: DataRequest) -> u32 {
        let manager = Arc::new(DataManager::new(
            request,
            StreamKind::DeviceData,
            self.driver.config().ring_capacity,
        ));
        self.driver.register_manager(Arc::clone(&manager));
        self.driver.open_device_streams(&manager).await;

        let tag = self.allocate_tag();
        self.subscriptions.write().insert(tag, manager);
        info!(tag, "opened device data request");
        tag
    }

    /// Open a combined-frame subscription: one synchronized frame across
    /// the matching devices per report interval.
    pub async fn request_data_frame(&self, request: DataRequest) -> u32 {
        let manager = Arc::new(DataManager::new(
            request,
            StreamKind::DataFrame,
            self.driver.config().ring_capacity,
        ));
        self.driver.register_manager(Arc::clone(&manager));
        self.driver.open_data_frame(&manager).await;

        let tag = self.allocate_tag();
        self.subscriptions.write().insert(tag, manager);
        info!(tag, "opened data frame request");
        tag
    }

    /// Close a DeviceData or DataFrame subscription. Once this returns no
    /// further callbacks fire for the tag and no new packets enter its
    /// rings. Unknown tags are a no-op.
    pub async fn close_request(&self, tag: u32) {
        let manager = self.subscriptions.write().remove(&tag);
        match manager {
            Some(manager) => {
                info!(tag, "closing request");
                self.driver.close_request(&manager).await;
                // No callback may fire for this tag once close returns.
                manager.reset_device_data_callback();
                manager.reset_data_frame_callback();
            }
            None => {
                warn!(tag, "close_request: unknown tag");
            }
        }
    }

    /// Open a base-station telemetry tag (~4 Hz). All open tags share one
    /// storage and one backing stream.
    pub async fn request_base_station_data(&self) -> u32 {
        {
            let mut registry = self.base_station.lock();
            if registry.storage.is_some() {
                let tag = self.allocate_tag();
                registry.tags.insert(tag);
                return tag;
            }
        }

        let created = self.driver.request_base_station_storage().await;

        let (tag, duplicate) = {
            let mut registry = self.base_station.lock();
            let duplicate = if registry.storage.is_none() {
                registry.storage = Some(created);
                None
            } else {
                // Another request won the creation race; ours is redundant.
                Some(created)
            };
            let tag = self.allocate_tag();
            registry.tags.insert(tag);
            (tag, duplicate)
        };

        if let Some(storage) = duplicate {
            self.driver.close_base_station(&storage).await;
        }
        info!(tag, "opened base station data request");
        tag
    }

    /// Close one base-station tag. The storage and its stream are torn
    /// down when the last tag closes.
    pub async fn close_base_station_data_request(&self, tag: u32) {
        let to_close = {
            let mut registry = self.base_station.lock();
            if !registry.tags.remove(&tag) {
                warn!(tag, "close_base_station_data_request: unknown tag");
                return;
            }
            if registry.tags.is_empty() {
                registry.storage.take()
            } else {
                None
            }
        };

        if let Some(storage) = to_close {
            info!(tag, "last base station tag closed; cancelling stream");
            self.driver.close_base_station(&storage).await;
        }
    }

    // --- Pull reads ------------------------------------------------------

    /// Devices that currently have storage in the subscription. Empty for
    /// unknown tags.
    pub fn available_device_list(&self, tag: u32) -> Vec<DeviceId> {
        self.subscription(tag).map(|m| m.storage_list()).unwrap_or_default()
    }

    /// The single most recent packet for `device_id`.
    pub fn latest_data(&self, tag: u32, device_id: DeviceId) -> DataResponse<TrackingDeviceData> {
        self.subscription(tag).map(|m| m.latest(device_id)).unwrap_or_default()
    }

    /// The most recent `count` packets, oldest first.
    pub fn latest_data_n(
        &self,
        tag: u32,
        device_id: DeviceId,
        count: usize,
    ) -> DataResponse<TrackingDeviceData> {
        self.subscription(tag).map(|m| m.latest_n(device_id, count)).unwrap_or_default()
    }

    /// The most recent packet, but only if it was received within
    /// `timeout`. A zero timeout disables the age check.
    pub fn latest_data_within(
        &self,
        tag: u32,
        device_id: DeviceId,
        timeout: Duration,
    ) -> DataResponse<TrackingDeviceData> {
        self.subscription(tag).map(|m| m.latest_within(device_id, timeout)).unwrap_or_default()
    }

    /// All packets received within `max_age`, oldest first.
    pub fn data_with_max_age(
        &self,
        tag: u32,
        device_id: DeviceId,
        max_age: Duration,
    ) -> DataResponse<TrackingDeviceData> {
        self.subscription(tag).map(|m| m.with_max_age(device_id, max_age)).unwrap_or_default()
    }

    /// All retained packets with index at or above `start_index`.
    pub fn data_since_index(
        &self,
        tag: u32,
        device_id: DeviceId,
        start_index: u64,
    ) -> DataResponse<TrackingDeviceData> {
        self.subscription(tag).map(|m| m.since_index(device_id, start_index)).unwrap_or_default()
    }

    fn base_station_storage(&self, tag: u32) -> Option<Arc<BaseStationStorage>> {
        let registry = self.base_station.lock();
        if registry.tags.contains(&tag) {
            registry.storage.clone()
        } else {
            None
        }
    }

    pub fn latest_base_station_data(&self, tag: u32) -> DataResponse<BaseStationData> {
        self.base_station_storage(tag).map(|s| s.latest()).unwrap_or_default()
    }

    pub fn latest_base_station_data_n(&self, tag: u32, count: usize) -> DataResponse<BaseStationData> {
        self.base_station_storage(tag).map(|s| s.latest_n(count)).unwrap_or_default()
    }

    pub fn base_station_data_since_index(
        &self,
        tag: u32,
        start_index: u64,
    ) -> DataResponse<BaseStationData> {
        self.base_station_storage(tag).map(|s| s.since_index(start_index)).unwrap_or_default()
    }

    // --- Per-tag callbacks -----------------------------------------------

    /// Register the per-packet callback for a DeviceData subscription. A
    /// no-op for unknown tags and for DataFrame subscriptions.
    pub fn register_tracking_device_data_callback(
        &self,
        tag: u32,
        callback: impl Fn(&TrackingDeviceData) + Send + Sync + 'static,
    ) {
        if let Some(manager) = self.subscription(tag) {
            manager.register_device_data_callback(Arc::new(callback));
        }
    }

    pub fn reset_tracking_device_data_callback(&self, tag: u32) {
        if let Some(manager) = self.subscription(tag) {
            manager.reset_device_data_callback();
        }
    }

    /// Register the per-frame callback for a DataFrame subscription. A
    /// no-op for unknown tags and for DeviceData subscriptions.
    pub fn register_data_frame_callback(
        &self,
        tag: u32,
        callback: impl Fn(&DataFrame) + Send + Sync + 'static,
    ) {
        if let Some(manager) = self.subscription(tag) {
            manager.register_data_frame_callback(Arc::new(callback));
        }
    }

    pub fn reset_data_frame_callback(&self, tag: u32) {
        if let Some(manager) = self.subscription(tag) {
            manager.reset_data_frame_callback();
        }
    }

    // --- Wireless --------------------------------------------------------

    /// Create a wireless-management handle backed by its own bidi stream.
    pub async fn create_wireless_manager(&self) -> Arc<WirelessManager> {
        self.driver.create_wireless_manager().await
    }

    /// Tear down a wireless-management handle and its stream.
    pub async fn delete_wireless_manager(&self, manager: &Arc<WirelessManager>) {
        self.driver.delete_wireless_manager(manager).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use crate::service::{
        DataFrameStreamRequest, DeviceDataStreamRequest, DeviceEventStreamRequest, PacketStream,
        WirelessStreams,
    };
    use crate::types::ResponseState;
    use async_trait::async_trait;

    /// A service with no transport behind it: every RPC fails, every
    /// stream open is refused.
    struct OfflineService;

    #[async_trait]
    impl CoreService for OfflineService {
        async fn get_tracking_devices(&self) -> crate::Result<Vec<DeviceDescriptor>> {
            Err(TrackerError::rpc("GetTrackingDevices", "offline"))
        }

        async fn get_hardware_states(&self) -> crate::Result<HardwareStates> {
            Err(TrackerError::rpc("GetHardwareStates", "offline"))
        }

        async fn set_base_station_motor_running(&self, _active: bool) -> crate::Result<bool> {
            Err(TrackerError::rpc("SetBaseStationMotorRunning", "offline"))
        }

        async fn send_data_logging_request(
            &self,
            _request: DataLoggingRequest,
        ) -> crate::Result<DataLogState> {
            Err(TrackerError::rpc("SendDataLoggingRequest", "offline"))
        }

        async fn select_reference_device(
            &self,
            _enabled: bool,
            _siu_uuid: u32,
            _port_num: u32,
        ) -> crate::Result<bool> {
            Err(TrackerError::rpc("SelectReferenceDevice", "offline"))
        }

        async fn open_device_event_stream(
            &self,
            _request: DeviceEventStreamRequest,
        ) -> crate::Result<PacketStream<DeviceEvent>> {
            Err(TrackerError::stream_open("device-events", "offline"))
        }

        async fn open_device_data_stream(
            &self,
            _request: DeviceDataStreamRequest,
        ) -> crate::Result<PacketStream<TrackingDeviceData>> {
            Err(TrackerError::stream_open("device-data", "offline"))
        }

        async fn open_data_frame_stream(
            &self,
            _request: DataFrameStreamRequest,
        ) -> crate::Result<PacketStream<DataFrame>> {
            Err(TrackerError::stream_open("data-frame", "offline"))
        }

        async fn open_base_station_stream(
            &self,
        ) -> crate::Result<PacketStream<BaseStationData>> {
            Err(TrackerError::stream_open("base-station-data", "offline"))
        }

        async fn open_reference_device_state_stream(
            &self,
        ) -> crate::Result<PacketStream<ReferenceDeviceState>> {
            Err(TrackerError::stream_open("reference-device-state", "offline"))
        }

        async fn open_wireless_stream(&self) -> crate::Result<WirelessStreams> {
            Err(TrackerError::stream_open("wireless-management", "offline"))
        }

        fn channel_state(&self) -> ChannelState {
            ChannelState::Idle
        }
    }

    fn offline_client() -> Client {
        Client::new(Arc::new(OfflineService))
    }

    #[tokio::test]
    async fn tags_are_monotonic_and_never_zero() {
        let client = offline_client();
        let first = client.request_device_data(DataRequest::default()).await;
        let second = client.request_data_frame(DataRequest::default()).await;
        let third = client.request_base_station_data().await;

        assert_ne!(first, INVALID_TAG);
        assert!(second > first);
        assert!(third > second);
    }

    #[tokio::test]
    async fn unknown_tag_reads_are_empty() {
        let client = offline_client();
        let device = DeviceId::new(1, 1);

        assert!(client.available_device_list(99).is_empty());
        assert_eq!(client.latest_data(99, device).state, ResponseState::NoData);
        assert_eq!(client.data_since_index(99, device, 0).state, ResponseState::NoData);
        assert_eq!(client.latest_base_station_data(99).state, ResponseState::NoData);
    }

    #[tokio::test]
    async fn unknown_tag_closes_and_registrations_are_no_ops() {
        let client = offline_client();
        client.close_request(12345).await;
        client.close_base_station_data_request(12345).await;
        client.register_tracking_device_data_callback(12345, |_| {});
        client.register_data_frame_callback(12345, |_| {});
        client.reset_tracking_device_data_callback(12345);
    }

    #[tokio::test]
    async fn unary_failures_map_to_defaults() {
        let client = offline_client();
        assert!(client.get_tracking_devices().await.is_empty());
        assert!(!client.set_base_station_motor_running(true).await);
        assert!(!client.select_reference_device(true, 1, 1).await);
        assert_eq!(client.disable_data_logging().await, DataLogState::RpcFail);
    }

    #[tokio::test]
    async fn enable_data_logging_refuses_existing_file_without_overwrite() {
        let client = offline_client();
        let dir = std::env::temp_dir();
        let file_name = format!("lodestar-log-test-{}.bin", std::process::id());
        let full_path = dir.join(&file_name);
        std::fs::write(&full_path, b"existing").expect("create test file");

        let state = client
            .enable_data_logging(dir.to_str().expect("utf-8 temp dir"), &file_name, false)
            .await;
        assert_eq!(state, DataLogState::Error);

        // With overwrite the request goes out and fails at the RPC layer.
        let state = client
            .enable_data_logging(dir.to_str().expect("utf-8 temp dir"), &file_name, true)
            .await;
        assert_eq!(state, DataLogState::RpcFail);

        std::fs::remove_file(&full_path).expect("remove test file");
    }

    #[tokio::test]
    async fn base_station_tags_share_one_storage() {
        let client = offline_client();
        let first = client.request_base_station_data().await;
        let second = client.request_base_station_data().await;

        let storage_a = client.base_station_storage(first).expect("storage for first tag");
        let storage_b = client.base_station_storage(second).expect("storage for second tag");
        assert!(Arc::ptr_eq(&storage_a, &storage_b));

        client.close_base_station_data_request(first).await;
        assert!(client.base_station_storage(second).is_some());

        client.close_base_station_data_request(second).await;
        assert_eq!(client.latest_base_station_data(second).state, ResponseState::NoData);

        // A fresh request builds a fresh storage.
        let third = client.request_base_station_data().await;
        let storage_c = client.base_station_storage(third).expect("storage for third tag");
        assert!(!Arc::ptr_eq(&storage_a, &storage_c));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let client = offline_client();
        client.start();
        let tag = client.request_device_data(DataRequest::default()).await;
        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(client.latest_data(tag, DeviceId::new(1, 1)).state, ResponseState::NoData);
    }
}
