//! Core value types for the tracking data plane.
//!
//! Everything the service reports or a subscription returns is an owned
//! value type here: device descriptors and events, per-sample packets,
//! subscription requests, windowed read responses, hardware inventory,
//! base-station telemetry, and wireless-management messages. Packets are
//! immutable once stored and copied on delivery; readers never alias ring
//! memory.

mod base_station;
mod data;
mod device;
mod hardware;
mod wireless;

pub use base_station::{BaseStationData, SpecParam};
pub use data::{
    field_mask, BatteryState, ButtonState, DataFrame, DataLogState, DataRequest, DataResponse,
    PoseData, RawSensorData, ResponseState, StoredPacket, TimestampData, TimestampType,
    TrackingDeviceData,
};
pub use device::{
    DeviceDescriptor, DeviceEvent, DeviceId, FusionMode, ReferenceDeviceState,
    SensorUnitDescriptor, Vector3f, Vector3i, Vector4f,
};
pub use hardware::{
    BaseStationHardwareState, CommonHardwareState, DirectCommStatus, HardwareStates,
    HardwareStatus, ReceiverConnection, SensorDeviceState, SiuHardwareState,
    WirelessReceiverHardwareState,
};
pub use wireless::{
    DevicePairingInformation, PairingInformation, WirelessError, WirelessEvent,
    WirelessEventKind, WirelessRequest, WirelessRequestKind,
};
