//! Shared test support: a scriptable in-memory tracking service.
//!
//! `MockCoreService` stands in for the IDL-generated stub. Tests flip the
//! channel state, emit device events and packets, and inspect the stream
//! requests the SDK issued. Dropping the channel to a not-ready state
//! closes every open stream, the way a real transport outage would.

// Not every integration test binary uses every helper here.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use lodestar::{
    BaseStationData, ChannelState, CoreService, DataFrame, DataFrameStreamRequest, DataLogState,
    DataLoggingRequest, DeviceDataStreamRequest, DeviceDescriptor, DeviceEvent,
    DeviceEventStreamRequest, DeviceId, HardwareStates, PacketStream, ReferenceDeviceState,
    Result, TrackerError, TrackingDeviceData, WirelessEvent, WirelessRequest, WirelessStreams,
};

/// Install a test subscriber once per process.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or the timeout expires.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct MockState {
    channel: Option<ChannelState>,
    event_streams: Vec<mpsc::UnboundedSender<Result<DeviceEvent>>>,
    device_streams: Vec<(DeviceId, mpsc::UnboundedSender<Result<TrackingDeviceData>>)>,
    frame_streams: Vec<mpsc::UnboundedSender<Result<DataFrame>>>,
    base_station_streams: Vec<mpsc::UnboundedSender<Result<BaseStationData>>>,
    reference_streams: Vec<mpsc::UnboundedSender<Result<ReferenceDeviceState>>>,
    wireless_event_streams: Vec<mpsc::UnboundedSender<Result<WirelessEvent>>>,

    device_stream_requests: Vec<DeviceDataStreamRequest>,
    frame_stream_requests: Vec<DataFrameStreamRequest>,
    wireless_requests: Arc<Mutex<Vec<WirelessRequest>>>,
    tracking_devices: Vec<DeviceDescriptor>,
}

pub struct MockCoreService {
    state: Mutex<MockState>,
}

impl MockCoreService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                channel: Some(ChannelState::Ready),
                wireless_requests: Arc::new(Mutex::new(Vec::new())),
                ..Default::default()
            }),
        })
    }

    /// Set the observable channel state. Leaving `Ready` closes every open
    /// stream, as a transport outage would.
    pub fn set_channel_state(&self, channel: ChannelState) {
        let mut state = self.state.lock();
        state.channel = Some(channel);
        if channel != ChannelState::Ready {
            state.event_streams.clear();
            state.device_streams.clear();
            state.frame_streams.clear();
            state.base_station_streams.clear();
            state.reference_streams.clear();
            state.wireless_event_streams.clear();
        }
    }

    pub fn set_tracking_devices(&self, devices: Vec<DeviceDescriptor>) {
        self.state.lock().tracking_devices = devices;
    }

    pub fn emit_device_event(&self, event: DeviceEvent) {
        let mut state = self.state.lock();
        state.event_streams.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Deliver one packet on every device stream opened for its device.
    pub fn emit_device_data(&self, packet: TrackingDeviceData) {
        let device = packet.device_id();
        let mut state = self.state.lock();
        state
            .device_streams
            .retain(|(id, tx)| *id != device || tx.send(Ok(packet.clone())).is_ok());
    }

    pub fn emit_frame(&self, frame: DataFrame) {
        let mut state = self.state.lock();
        state.frame_streams.retain(|tx| tx.send(Ok(frame.clone())).is_ok());
    }

    pub fn emit_base_station_data(&self, data: BaseStationData) {
        let mut state = self.state.lock();
        state.base_station_streams.retain(|tx| tx.send(Ok(data)).is_ok());
    }

    pub fn emit_reference_state(&self, state_value: ReferenceDeviceState) {
        let mut state = self.state.lock();
        state.reference_streams.retain(|tx| tx.send(Ok(state_value)).is_ok());
    }

    pub fn emit_wireless_event(&self, event: WirelessEvent) {
        let mut state = self.state.lock();
        state.wireless_event_streams.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Fail one device's streams in place, as a per-stream transport error.
    pub fn fail_device_streams(&self, device: DeviceId) {
        let mut state = self.state.lock();
        state.device_streams.retain(|(id, tx)| {
            if *id != device {
                return true;
            }
            let _ = tx.send(Err(TrackerError::stream_closed("device-data", "reset")));
            false
        });
    }

    pub fn open_event_stream_count(&self) -> usize {
        self.state.lock().event_streams.len()
    }

    pub fn open_device_stream_count(&self, device: DeviceId) -> usize {
        self.state.lock().device_streams.iter().filter(|(id, _)| *id == device).count()
    }

    pub fn open_base_station_stream_count(&self) -> usize {
        self.state.lock().base_station_streams.len()
    }

    pub fn open_reference_stream_count(&self) -> usize {
        self.state.lock().reference_streams.len()
    }

    /// Every combined-frame request the SDK has issued, in order.
    pub fn frame_stream_requests(&self) -> Vec<DataFrameStreamRequest> {
        self.state.lock().frame_stream_requests.clone()
    }

    pub fn device_stream_requests(&self) -> Vec<DeviceDataStreamRequest> {
        self.state.lock().device_stream_requests.clone()
    }

    /// Wireless requests the SDK wrote to the bidi stream, in order.
    pub fn wireless_requests(&self) -> Vec<WirelessRequest> {
        self.state.lock().wireless_requests.lock().clone()
    }
}

fn open_stream<T: Send + 'static>(
    registry: &mut Vec<mpsc::UnboundedSender<Result<T>>>,
) -> PacketStream<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    registry.push(tx);
    Box::pin(UnboundedReceiverStream::new(rx))
}

#[async_trait]
impl CoreService for MockCoreService {
    async fn get_tracking_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.state.lock().tracking_devices.clone())
    }

    async fn get_hardware_states(&self) -> Result<HardwareStates> {
        Ok(HardwareStates::default())
    }

    async fn set_base_station_motor_running(&self, _active: bool) -> Result<bool> {
        Ok(true)
    }

    async fn send_data_logging_request(
        &self,
        request: DataLoggingRequest,
    ) -> Result<DataLogState> {
        Ok(if request.enable_logging { DataLogState::Enabled } else { DataLogState::Disabled })
    }

    async fn select_reference_device(
        &self,
        _enabled: bool,
        _siu_uuid: u32,
        _port_num: u32,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn open_device_event_stream(
        &self,
        _request: DeviceEventStreamRequest,
    ) -> Result<PacketStream<DeviceEvent>> {
        let mut state = self.state.lock();
        Ok(open_stream(&mut state.event_streams))
    }

    async fn open_device_data_stream(
        &self,
        request: DeviceDataStreamRequest,
    ) -> Result<PacketStream<TrackingDeviceData>> {
        let mut state = self.state.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        state.device_streams.push((request.device, tx));
        state.device_stream_requests.push(request);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn open_data_frame_stream(
        &self,
        request: DataFrameStreamRequest,
    ) -> Result<PacketStream<DataFrame>> {
        let mut state = self.state.lock();
        state.frame_stream_requests.push(request);
        Ok(open_stream(&mut state.frame_streams))
    }

    async fn open_base_station_stream(&self) -> Result<PacketStream<BaseStationData>> {
        let mut state = self.state.lock();
        Ok(open_stream(&mut state.base_station_streams))
    }

    async fn open_reference_device_state_stream(
        &self,
    ) -> Result<PacketStream<ReferenceDeviceState>> {
        let mut state = self.state.lock();
        Ok(open_stream(&mut state.reference_streams))
    }

    async fn open_wireless_stream(&self) -> Result<WirelessStreams> {
        let (request_tx, mut request_rx) = mpsc::channel::<WirelessRequest>(1);
        let events = {
            let mut state = self.state.lock();
            let recorded = Arc::clone(&state.wireless_requests);
            tokio::spawn(async move {
                while let Some(request) = request_rx.recv().await {
                    recorded.lock().push(request);
                }
            });
            open_stream(&mut state.wireless_event_streams)
        };
        Ok(WirelessStreams { requests: request_tx, events })
    }

    fn channel_state(&self) -> ChannelState {
        self.state.lock().channel.unwrap_or(ChannelState::Idle)
    }
}

/// A connected-device event for `device`.
pub fn connect_event(device: DeviceId) -> DeviceEvent {
    DeviceEvent { connected: true, device: descriptor(device) }
}

/// A disconnected-device event for `device`.
pub fn disconnect_event(device: DeviceId) -> DeviceEvent {
    DeviceEvent { connected: false, device: descriptor(device) }
}

pub fn descriptor(device: DeviceId) -> DeviceDescriptor {
    DeviceDescriptor {
        siu_uuid: device.siu_uuid,
        port_id: device.port_id,
        button_count: 2,
        ..Default::default()
    }
}

pub fn packet(device: DeviceId, seq: u32) -> TrackingDeviceData {
    TrackingDeviceData {
        siu_uuid: device.siu_uuid,
        port_id: device.port_id,
        timestamp: seq,
        ..Default::default()
    }
}
