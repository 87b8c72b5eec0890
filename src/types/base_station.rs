//! Base-station telemetry payloads

use serde::{Deserialize, Serialize};

/// A measured parameter together with its in-spec verdict.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpecParam {
    pub value: f32,
    pub out_of_spec: bool,
}

/// One low-rate (~4 Hz) base-station telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BaseStationData {
    pub accel_figure_of_merit: SpecParam,
    pub max_phase_std: SpecParam,
    pub max_phase_drift: SpecParam,
    pub temp_diff_from_calib_c: SpecParam,
    pub mean_rotation_rate_hz: SpecParam,
    pub tilt_angle_deg: SpecParam,
    pub max_mag_rms_res: SpecParam,
    pub accel_dc_magnitude_g: SpecParam,
}
