//! Capture-device contract. Devices live in a process-wide registry owned by
//! the resource manager; a stream only holds a shared handle plus open/start
//! reference semantics.

use serde::Serialize;

use crate::error::Result;

/// Platform device identifiers the voice-activation path cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceId {
    HandsetMic,
    SpeakerMic,
    WiredHeadset,
    /// Voice-activation mic routed through the handset path.
    HandsetVaMic,
    /// Voice-activation mic routed through a wired headset.
    HeadsetVaMic,
}

impl DeviceId {
    /// Map a generic platform capture device onto the voice-activation mic
    /// it implies, if any.
    pub fn va_mic(self) -> Option<DeviceId> {
        match self {
            DeviceId::HandsetMic | DeviceId::SpeakerMic => Some(DeviceId::HandsetVaMic),
            DeviceId::WiredHeadset => Some(DeviceId::HeadsetVaMic),
            _ => None,
        }
    }
}

/// Attributes applied to a capture device before starting it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub sample_rate: u32,
    pub bit_width: u16,
    pub channels: u16,
    pub snd_name: String,
}

/// A capture device fetched from the shared registry. All methods take
/// `&self`; implementations carry their own interior state.
pub trait CaptureDevice: Send + Sync {
    fn id(&self) -> DeviceId;
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn set_attributes(&self, config: &DeviceConfig) -> Result<()>;
}
