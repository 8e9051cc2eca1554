//! Platform info store: per-model tuning constants and the capture-profile
//! table. Immutable after construction and injected into every stream as a
//! read-only dependency.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::device::DeviceId;

/// PCM media format of a stream or device path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaConfig {
    pub sample_rate: u32,
    pub bit_width: u16,
    pub channels: u16,
}

impl MediaConfig {
    /// The fixed format of detection notifications: 16 kHz / 16-bit / mono.
    pub fn detection_default() -> Self {
        MediaConfig {
            sample_rate: 16_000,
            bit_width: 16,
            channels: 1,
        }
    }

    pub fn is_sample_rate_supported(rate: u32) -> bool {
        matches!(
            rate,
            8_000 | 16_000 | 32_000 | 44_100 | 48_000 | 96_000 | 192_000 | 384_000
        )
    }

    pub fn is_channel_count_supported(channels: u16) -> bool {
        (1..=8).contains(&channels)
    }

    pub fn is_bit_width_supported(bit_width: u16) -> bool {
        matches!(bit_width, 16 | 24 | 32)
    }
}

/// Power mode of the capture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperatingMode {
    LowPower,
    HighPerf,
    HighPerfAndCharging,
}

/// Which microphone path feeds the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InputMode {
    Handset,
    Headset,
}

/// Immutable tuple of device + audio format + pre-processing tuning,
/// selected from the platform table by (operating mode, input mode).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureProfile {
    pub name: String,
    pub device_id: DeviceId,
    pub channels: u16,
    pub sample_rate: u32,
    pub bit_width: u16,
    pub snd_name: String,
    /// Pre-processing key/value tuning applied to the device path.
    pub device_pp_kv: Vec<(u32, u32)>,
}

/// Per-model tuning record, keyed by the model's vendor UUID.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub vendor_uuid: Uuid,
    /// Default history-buffer length when the client config carries none.
    pub kw_duration_ms: u32,
    /// Extra ring-buffer headroom for a slow client reader.
    pub capture_read_delay_ms: u32,
    /// Media format the first-stage engine writes into the ring buffer.
    pub media: MediaConfig,
    /// Stream-config key/value registered with the resource manager.
    pub stream_config_kv: (u32, u32),
    profiles: HashMap<(OperatingMode, InputMode), CaptureProfile>,
}

impl ModelInfo {
    pub fn new(
        vendor_uuid: Uuid,
        kw_duration_ms: u32,
        capture_read_delay_ms: u32,
        media: MediaConfig,
        stream_config_kv: (u32, u32),
        profiles: Vec<((OperatingMode, InputMode), CaptureProfile)>,
    ) -> Self {
        ModelInfo {
            vendor_uuid,
            kw_duration_ms,
            capture_read_delay_ms,
            media,
            stream_config_kv,
            profiles: profiles.into_iter().collect(),
        }
    }

    pub fn capture_profile(&self, op: OperatingMode, input: InputMode) -> Option<&CaptureProfile> {
        self.profiles.get(&(op, input))
    }
}

/// Process-wide platform description. Built once at init, then read-only.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    support_dev_switch: bool,
    models: HashMap<Uuid, ModelInfo>,
}

impl PlatformInfo {
    pub fn new(support_dev_switch: bool, models: Vec<ModelInfo>) -> Self {
        PlatformInfo {
            support_dev_switch,
            models: models.into_iter().map(|m| (m.vendor_uuid, m)).collect(),
        }
    }

    /// Whether switching to a wired headset mic is permitted on this platform.
    pub fn support_dev_switch(&self) -> bool {
        self.support_dev_switch
    }

    pub fn model(&self, vendor_uuid: &Uuid) -> Option<&ModelInfo> {
        self.models.get(vendor_uuid)
    }
}
