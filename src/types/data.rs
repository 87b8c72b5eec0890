//! Packet payloads, subscription requests, and read responses

use serde::{Deserialize, Serialize};

use super::device::{DeviceId, FusionMode, Vector3f, Vector3i, Vector4f};

/// One raw magnetometer/IMU reading from a single sensor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawSensorData {
    pub mag: Vector3i,
    pub gyro: Vector3i,
    pub accel: Vector3i,
}

/// One tracked pose, ordered by pose index within the packet.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseData {
    pub position: Vector3f,
    pub quaternion: Vector4f,
    pub indicator_value: f32,
    pub motion_indicator: f32,
    pub bad_data_indicator: f32,
}

/// Reported state of a single device button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ButtonState {
    #[default]
    Unknown,
    Idle,
    Up,
    Down,
    Left,
    Right,
    Pressed,
}

/// Which hop of the pipeline a latency timestamp was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimestampType {
    #[default]
    Unknown,
    /// Stamped at the sensor sample
    Sample,
    /// Stamped when the service received the sample
    ServiceReceived,
    /// Stamped when the service sent the packet
    ServiceSent,
    /// Stamped when this SDK received the packet
    SdkReceived,
}

/// One latency measurement point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimestampData {
    pub timestamp_type: TimestampType,
    pub steady_timestamp_ms: u64,
    pub system_timestamp_ms: u64,
}

/// Battery telemetry for wireless devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryState {
    pub state_of_charge: i32,
    pub current: i32,
    pub remaining_capacity: i32,
}

/// One sample for one device. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingDeviceData {
    pub siu_uuid: u32,
    pub port_id: u32,
    pub basestation_angle: u32,
    pub basestation_speed: u32,
    pub timestamp: u32,
    pub raw_sensor_data: Vec<RawSensorData>,
    /// Poses ordered by pose index
    pub poses: Vec<PoseData>,
    /// Button states ordered by button index
    pub buttons: Vec<ButtonState>,
    pub latency_timestamps: Vec<TimestampData>,
    pub battery_state: BatteryState,
}

impl TrackingDeviceData {
    /// The device identity carried by this packet.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.siu_uuid, self.port_id)
    }

    /// System-clock milliseconds at which this SDK received the packet, if
    /// an `SdkReceived` latency stamp is present.
    pub fn sdk_received_ms(&self) -> Option<u64> {
        self.latency_timestamps
            .iter()
            .find(|t| t.timestamp_type == TimestampType::SdkReceived)
            .map(|t| t.system_timestamp_ms)
    }

    /// Append the `SdkReceived` latency stamp if the packet does not carry
    /// one yet. The delivery path applies this before storage insert.
    pub fn stamp_sdk_received(&mut self, system_ms: u64) {
        if self.sdk_received_ms().is_none() {
            self.latency_timestamps.push(TimestampData {
                timestamp_type: TimestampType::SdkReceived,
                steady_timestamp_ms: system_ms,
                system_timestamp_ms: system_ms,
            });
        }
    }
}

/// A synchronized snapshot of samples for several devices.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataFrame {
    pub device_data: Vec<TrackingDeviceData>,
}

/// Bit selectors for the optional packet fields a subscription wants.
pub mod field_mask {
    pub const SIU_UUID: u32 = 1 << 0;
    pub const PORT_ID: u32 = 1 << 1;
    pub const BASESTATION_ANGLE: u32 = 1 << 2;
    pub const BASESTATION_SPEED: u32 = 1 << 3;
    pub const TIMESTAMP: u32 = 1 << 4;
    pub const BUTTON_STATUS: u32 = 1 << 5;
    pub const BATTERY_STATUS: u32 = 1 << 6;

    pub const ALL: u32 = SIU_UUID
        | PORT_ID
        | BASESTATION_ANGLE
        | BASESTATION_SPEED
        | TIMESTAMP
        | BUTTON_STATUS
        | BATTERY_STATUS;
}

/// Parameters for a DeviceData or DataFrame subscription.
///
/// An empty `requested_devices` list subscribes to every connected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub field_mask: u32,
    pub report_interval_ms: u32,
    pub buffer_depth: u32,
    pub fusion_mode: FusionMode,
    pub include_raw_sensor_data: bool,
    pub requested_devices: Vec<DeviceId>,
}

impl Default for DataRequest {
    fn default() -> Self {
        Self {
            field_mask: field_mask::ALL,
            report_interval_ms: 1,
            buffer_depth: 100,
            fusion_mode: FusionMode::Default,
            include_raw_sensor_data: false,
            requested_devices: Vec::new(),
        }
    }
}

/// Outcome classification for a pull read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseState {
    /// Nothing matched; the packet list is empty
    NoData,
    /// Fewer packets than requested were still retained
    PartialData,
    /// The full requested window was returned
    Success,
}

/// A packet as retained by a ring: the payload plus the insert-time index.
///
/// `index` is assigned by the owning ring as a dense monotonic counter
/// starting at 0; the service does not produce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPacket<T> {
    pub index: u64,
    pub data: T,
}

/// Result of a pull read: a state plus packets in oldest-to-newest order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse<T> {
    pub state: ResponseState,
    pub packets: Vec<StoredPacket<T>>,
}

impl<T> DataResponse<T> {
    /// The empty `NoData` response.
    pub fn no_data() -> Self {
        Self { state: ResponseState::NoData, packets: Vec::new() }
    }

    /// The most recent packet in the response, if any.
    pub fn latest(&self) -> Option<&StoredPacket<T>> {
        self.packets.last()
    }
}

impl<T> Default for DataResponse<T> {
    fn default() -> Self {
        Self::no_data()
    }
}

/// Result of a data-logging control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataLogState {
    #[default]
    Unknown,
    Enabled,
    Disabled,
    /// The request was refused before or by the service
    Error,
    /// The RPC itself failed
    RpcFail,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(kind: TimestampType, ms: u64) -> TimestampData {
        TimestampData {
            timestamp_type: kind,
            steady_timestamp_ms: ms,
            system_timestamp_ms: ms,
        }
    }

    #[test]
    fn sdk_received_stamp_is_found_among_other_stamps() {
        let packet = TrackingDeviceData {
            latency_timestamps: vec![
                stamped(TimestampType::Sample, 10),
                stamped(TimestampType::ServiceSent, 12),
                stamped(TimestampType::SdkReceived, 15),
            ],
            ..Default::default()
        };
        assert_eq!(packet.sdk_received_ms(), Some(15));
    }

    #[test]
    fn missing_sdk_received_stamp_yields_none() {
        let packet = TrackingDeviceData {
            latency_timestamps: vec![stamped(TimestampType::Sample, 10)],
            ..Default::default()
        };
        assert_eq!(packet.sdk_received_ms(), None);
    }

    #[test]
    fn default_request_selects_all_devices() {
        let request = DataRequest::default();
        assert!(request.requested_devices.is_empty());
        assert_eq!(request.field_mask, field_mask::ALL);
    }
}
