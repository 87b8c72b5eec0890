//! Hardware inventory state as reported by the service

use serde::{Deserialize, Serialize};

/// Coarse operating status of a hardware unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HardwareStatus {
    #[default]
    Unknown,
    Idle,
    SettingUp,
    WaitingOnCommand,
    Running,
    Error,
}

/// Direct-communication link status for a base station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectCommStatus {
    #[default]
    None,
    Idle,
    Connected,
    DescriptorRequest,
    ChannelSearch,
}

/// Fields shared by every hardware unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommonHardwareState {
    pub connected: bool,
    pub serial_number: String,
    pub uuid: u32,
    pub usb_port_name: String,
    pub hardware_status: HardwareStatus,
}

/// Sensor population on one SIU port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorDeviceState {
    pub port_number: u32,
    pub mag_sensor_count: u32,
}

/// A wireless SIU currently attached to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReceiverConnection {
    pub uuid: u32,
    pub time_slot: u32,
}

/// State of one base station.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BaseStationHardwareState {
    pub common: CommonHardwareState,
    pub sync_channel: u32,
    pub direct_comm_status: DirectCommStatus,
    pub direct_comm_uuid: u32,
    pub motor_running: bool,
}

/// State of one sensor interface unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SiuHardwareState {
    pub common: CommonHardwareState,
    pub wireless: bool,
    pub sync_channel: u32,
    pub data_channel: u32,
    pub sensor_devices: Vec<SensorDeviceState>,
}

/// State of one wireless receiver.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WirelessReceiverHardwareState {
    pub common: CommonHardwareState,
    pub data_channel: u32,
    pub connected_sius: Vec<ReceiverConnection>,
}

/// Everything the service has seen since startup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HardwareStates {
    pub base_stations: Vec<BaseStationHardwareState>,
    pub sius: Vec<SiuHardwareState>,
    pub wireless_receivers: Vec<WirelessReceiverHardwareState>,
}
