//! Wireless-management request and event types

use serde::{Deserialize, Serialize};

/// The kind of control request sent over the wireless-management stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WirelessRequestKind {
    #[default]
    None,
    EnablePairingMode,
    DisablePairingMode,
    GetPairingApprovedList,
    ApprovePairing,
    DenyPairing,
    Unpair,
    GetPairingBlockedList,
    BlockPairing,
    UnblockPairing,
    ClearBlockedList,
    ClearApprovedList,
    ResetWirelessConfig,
    SetIntervalLength,
    ApproveIntervalPairing,
    SleepDevice,
    WakeDevice,
    GetPairingApprovedIntervalList,
}

/// One outbound wireless-management request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WirelessRequest {
    pub kind: WirelessRequestKind,
    pub siu_uuid: u32,
    pub interval_length: u32,
}

impl WirelessRequest {
    /// A request carrying only its kind.
    pub fn of_kind(kind: WirelessRequestKind) -> Self {
        Self { kind, ..Default::default() }
    }

    /// A request targeting a specific SIU.
    pub fn for_siu(kind: WirelessRequestKind, siu_uuid: u32) -> Self {
        Self { kind, siu_uuid, ..Default::default() }
    }
}

/// The kind of event received from the wireless-management stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WirelessEventKind {
    #[default]
    None,
    PairingRequest,
    PairingTimeout,
    PairingApprovedList,
    PairingBlockedList,
    RequestAck,
    RequestError,
    PairingApprovedIntervalList,
}

/// Failure detail attached to a `RequestError` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WirelessError {
    #[default]
    None,
    UuidNotFound,
    SettingsSaveFailed,
    CouldNotRemoveFromPreviousList,
    UuidAlreadyExists,
    FailedToClearLists,
    SleepNotSupportedInCurrentMode,
    DeviceAlreadySleeping,
    DeviceAlreadyAwake,
}

/// Device part numbers eligible for pairing on one SIU.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevicePairingInformation {
    pub device_part_numbers: Vec<u32>,
}

/// Pairing detail attached to pairing-request events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PairingInformation {
    pub siu_uuid: u32,
    pub device_pairing_information: Vec<DevicePairingInformation>,
}

/// One inbound wireless-management event.
///
/// Delivered by value to the registered callback; the receiver owns it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WirelessEvent {
    pub kind: WirelessEventKind,
    /// Kind of the client request this event answers, when applicable
    pub client_request_kind: WirelessRequestKind,
    pub siu_uuids: Vec<u32>,
    pub request_error: WirelessError,
    pub pairing_information: PairingInformation,
}
