//! Transport seam between the SDK core and the tracking service.
//!
//! The wire protocol is owned by an IDL-generated stub; the core only sees
//! it through [`CoreService`]. Adapters implement the trait over whatever
//! transport is at hand (a generated gRPC client in production, an
//! in-memory scripted service in tests), and the rest of the crate is
//! indifferent to the choice.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{
    BaseStationData, DataFrame, DataLogState, DeviceDescriptor, DeviceEvent, DeviceId, FusionMode,
    HardwareStates, ReferenceDeviceState, TrackingDeviceData, WirelessEvent, WirelessRequest,
};

/// A server-streaming RPC as the core consumes it: an async sequence of
/// messages, terminated by `None` (peer closed) or an `Err` item (transport
/// failure).
pub type PacketStream<T> = BoxStream<'static, Result<T>>;

/// Observable transport channel states, passed through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Parameters for the device-event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEventStreamRequest {
    pub buffer_depth: u32,
    /// Replay a connect event for every already-connected device on open
    pub include_all_connected_devices: bool,
}

impl Default for DeviceEventStreamRequest {
    fn default() -> Self {
        Self { buffer_depth: 100, include_all_connected_devices: true }
    }
}

/// Parameters for one per-device data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDataStreamRequest {
    pub device: DeviceId,
    pub field_mask: u32,
    pub include_raw_sensor_data: bool,
    pub report_interval_ms: u32,
    pub buffer_depth: u32,
    pub fusion_mode: FusionMode,
}

/// One device entry inside a combined-frame stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrameDeviceRequest {
    pub device: DeviceId,
    pub field_mask: u32,
    pub include_raw_sensor_data: bool,
    pub fusion_mode: FusionMode,
}

/// Parameters for the combined-frame stream. Frame streams are structured
/// around the device list fixed at open time; membership changes require a
/// reopen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataFrameStreamRequest {
    pub report_interval_ms: u32,
    pub buffer_depth: u32,
    pub devices: Vec<DataFrameDeviceRequest>,
}

/// Parameters for the data-logging control RPC.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataLoggingRequest {
    pub enable_logging: bool,
    pub directory: String,
    pub file_name: String,
    pub overwrite: bool,
}

/// The two halves of an open wireless-management bidi stream.
///
/// `requests` is bounded to a single slot: the transport accepts one write
/// at a time, and the session's FIFO dispatches the next request only once
/// the in-flight write completes.
pub struct WirelessStreams {
    pub requests: mpsc::Sender<WirelessRequest>,
    pub events: PacketStream<WirelessEvent>,
}

/// Client-side view of the tracking service.
///
/// Object-safe so the core can hold `Arc<dyn CoreService>`; all streaming
/// opens resolve immediately and report transport failure either as an
/// `Err` return or as the first item of the returned stream.
#[async_trait]
pub trait CoreService: Send + Sync + 'static {
    /// Devices currently connected and available.
    async fn get_tracking_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// States of every hardware unit the service has seen since startup.
    async fn get_hardware_states(&self) -> Result<HardwareStates>;

    /// Turn the base-station motor on or off. `Ok(true)` means the service
    /// accepted and succeeded.
    async fn set_base_station_motor_running(&self, active: bool) -> Result<bool>;

    /// Enable or disable service-side data capture.
    async fn send_data_logging_request(&self, request: DataLoggingRequest) -> Result<DataLogState>;

    /// Select or clear the reference device.
    async fn select_reference_device(
        &self,
        enabled: bool,
        siu_uuid: u32,
        port_num: u32,
    ) -> Result<bool>;

    async fn open_device_event_stream(
        &self,
        request: DeviceEventStreamRequest,
    ) -> Result<PacketStream<DeviceEvent>>;

    async fn open_device_data_stream(
        &self,
        request: DeviceDataStreamRequest,
    ) -> Result<PacketStream<TrackingDeviceData>>;

    async fn open_data_frame_stream(
        &self,
        request: DataFrameStreamRequest,
    ) -> Result<PacketStream<DataFrame>>;

    async fn open_base_station_stream(&self) -> Result<PacketStream<BaseStationData>>;

    async fn open_reference_device_state_stream(
        &self,
    ) -> Result<PacketStream<ReferenceDeviceState>>;

    async fn open_wireless_stream(&self) -> Result<WirelessStreams>;

    /// Current transport channel state. Must not block.
    fn channel_state(&self) -> ChannelState;
}
