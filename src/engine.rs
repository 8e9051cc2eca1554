//! Detection-engine contract and per-stage bindings. The first stage is the
//! always-present GMM keyword spotter that owns the ring buffer; second
//! stages are cascaded verifiers reading from it after a trigger.

use std::sync::Arc;

use serde::Serialize;

use crate::device::{DeviceConfig, DeviceId};
use crate::error::Result;

/// Closed set of engine stages a sound model may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageId {
    /// First-stage GMM keyword detector.
    Gmm,
    /// Second-stage keyword verifier.
    KeywordVerifier,
    /// Second-stage user (speaker) verifier.
    UserVerifier,
}

impl StageId {
    /// Wire id used in model containers and confidence-level payloads.
    pub fn raw(self) -> u32 {
        match self {
            StageId::Gmm => 0x1,
            StageId::KeywordVerifier => 0x2,
            StageId::UserVerifier => 0x4,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x1 => Some(StageId::Gmm),
            0x2 => Some(StageId::KeywordVerifier),
            0x4 => Some(StageId::UserVerifier),
            _ => None,
        }
    }
}

/// First-stage detection result pulled from the engine when assembling the
/// client notification.
#[derive(Debug, Clone, Default)]
pub struct DetectionEventInfo {
    /// Keyword confidence per configured entry, 0..=100.
    pub confidence_levels: Vec<u8>,
    /// Detection time, microseconds, split into 32-bit words.
    pub timestamp_lsw: u32,
    pub timestamp_msw: u32,
}

impl DetectionEventInfo {
    pub fn timestamp_us(&self) -> u64 {
        ((self.timestamp_msw as u64) << 32) | self.timestamp_lsw as u64
    }
}

/// Cursor into the first-stage engine's ring buffer. Reader 0 serves the
/// client read path; the rest feed second-stage engines.
pub trait BufferReader: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Drop unread data and catch up to the writer.
    fn reset(&mut self);
    /// Keyword start/end byte offsets of the last detection.
    fn indices(&self) -> (u32, u32);
}

/// Contract every detection engine implements. Methods take `&self`;
/// engines run their own sessions and threads internally.
pub trait Engine: Send + Sync {
    fn load_sound_model(&self, data: &[u8]) -> Result<()>;
    fn unload_sound_model(&self) -> Result<()>;

    fn start_recognition(&self) -> Result<()>;
    fn restart_recognition(&self) -> Result<()>;
    fn stop_recognition(&self) -> Result<()>;
    fn stop_buffering(&self) -> Result<()>;

    /// First-stage trigger notification fanned out to second stages.
    fn set_detected(&self, detected: bool);

    fn update_conf_levels(&self, levels: &[u8]) -> Result<()>;
    fn update_buf_config(&self, hist_duration_ms: u32, pre_roll_ms: u32) -> Result<()>;
    fn set_capture_requested(&self, requested: bool);

    /// Size the ring buffer and hand out `num_readers` cursors.
    fn create_buffer(&self, size: usize, num_readers: usize) -> Result<Vec<Box<dyn BufferReader>>>;
    /// Bind a reader produced by the first stage to this (second-stage) engine.
    fn set_buffer_reader(&self, reader: Box<dyn BufferReader>) -> Result<()>;

    fn detection_event_info(&self) -> Option<DetectionEventInfo>;
    fn get_parameters(&self, param_id: u32) -> Result<Vec<u8>>;

    fn set_ec_ref(&self, device: DeviceId, enable: bool) -> Result<()>;

    fn setup_session_device(&self, config: &DeviceConfig) -> Result<()>;
    fn connect_session_device(&self, config: &DeviceConfig) -> Result<()>;
    fn disconnect_session_device(&self, config: &DeviceConfig);

    fn setup_duration_ms(&self) -> u32;
}

/// Creates engines per stage during model load.
pub trait EngineFactory: Send + Sync {
    fn create(&self, stage: StageId) -> Result<Arc<dyn Engine>>;
}

/// A stage bound to a stream: the engine plus the model payload it loaded.
/// The payload is owned here so it can be replayed or dropped at unload.
pub struct EngineBinding {
    pub stage: StageId,
    pub engine: Arc<dyn Engine>,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_raw_round_trip() {
        for stage in [StageId::Gmm, StageId::KeywordVerifier, StageId::UserVerifier] {
            assert_eq!(StageId::from_raw(stage.raw()), Some(stage));
        }
        assert_eq!(StageId::from_raw(0x8), None);
    }

    #[test]
    fn timestamp_word_combine() {
        let info = DetectionEventInfo {
            confidence_levels: vec![],
            timestamp_lsw: 0xdead_beef,
            timestamp_msw: 0x1,
        };
        assert_eq!(info.timestamp_us(), 0x1_dead_beef);
    }
}
