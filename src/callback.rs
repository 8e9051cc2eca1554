//! Detection notification assembly: the phrase event handed to the client
//! callback, including the opaque trailer packing confidence levels,
//! keyword indices, and the first-stage timestamp.

use serde::Serialize;

use crate::config::{
    push_tlv, RecognitionConfig, CONF_LEVELS_VERSION_1, KEY_CONFIDENCE_LEVELS,
    KEY_KEYWORD_INDICES, KEY_TIMESTAMP,
};
use crate::engine::{DetectionEventInfo, StageId};
use crate::platform::MediaConfig;

/// Payload delivered to the client on a confirmed detection.
#[derive(Debug, Clone, Serialize)]
pub struct PhraseRecognitionEvent {
    pub phrase_extras: Vec<crate::config::PhraseRecognitionExtra>,
    pub media_config: MediaConfig,
    /// Mirrors the client's capture request; buffered audio is readable
    /// only when set.
    pub capture_available: bool,
    /// TLV trailer: confidence levels, keyword indices, timestamp, in order.
    #[serde(skip)]
    pub opaque: Vec<u8>,
}

impl PhraseRecognitionEvent {
    pub fn num_phrases(&self) -> usize {
        self.phrase_extras.len()
    }
}

/// Assemble the notification from the cached config, the engine count, the
/// first-stage detection result, and the reader's keyword indices.
pub fn build_detection_event(
    config: &RecognitionConfig,
    num_engines: usize,
    det_info: &DetectionEventInfo,
    kw_indices: (u32, u32),
) -> PhraseRecognitionEvent {
    let mut opaque = Vec::new();

    // Confidence levels: one entry per engine, keyword level taken from the
    // first-stage detection result.
    let mut conf = Vec::new();
    conf.extend_from_slice(&CONF_LEVELS_VERSION_1.to_le_bytes());
    conf.extend_from_slice(&(num_engines as u32).to_le_bytes());
    for i in 0..num_engines {
        let level = det_info.confidence_levels.get(i).copied().unwrap_or(0);
        conf.extend_from_slice(&StageId::Gmm.raw().to_le_bytes());
        conf.extend_from_slice(&1u32.to_le_bytes()); // one keyword level
        conf.push(level);
        conf.extend_from_slice(&0u32.to_le_bytes()); // no user levels
    }
    push_tlv(&mut opaque, KEY_CONFIDENCE_LEVELS, &conf);

    let mut indices = Vec::new();
    indices.extend_from_slice(&1u32.to_le_bytes()); // payload version
    indices.extend_from_slice(&kw_indices.0.to_le_bytes());
    indices.extend_from_slice(&kw_indices.1.to_le_bytes());
    push_tlv(&mut opaque, KEY_KEYWORD_INDICES, &indices);

    let mut timestamp = Vec::new();
    timestamp.extend_from_slice(&1u32.to_le_bytes());
    timestamp.extend_from_slice(&det_info.timestamp_lsw.to_le_bytes());
    timestamp.extend_from_slice(&det_info.timestamp_msw.to_le_bytes());
    push_tlv(&mut opaque, KEY_TIMESTAMP, &timestamp);

    PhraseRecognitionEvent {
        phrase_extras: config.phrases.clone(),
        media_config: MediaConfig::detection_default(),
        capture_available: config.capture_requested,
        opaque,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhraseRecognitionExtra;

    fn config() -> RecognitionConfig {
        RecognitionConfig {
            capture_requested: true,
            phrases: vec![PhraseRecognitionExtra {
                id: 7,
                recognition_modes: 1,
                confidence_level: 60,
                levels: vec![],
            }],
            opaque: vec![],
        }
    }

    fn read_u32(data: &[u8], pos: usize) -> u32 {
        u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap())
    }

    #[test]
    fn event_mirrors_config() {
        let det = DetectionEventInfo {
            confidence_levels: vec![88],
            timestamp_lsw: 0x10,
            timestamp_msw: 0,
        };
        let ev = build_detection_event(&config(), 1, &det, (100, 400));
        assert_eq!(ev.num_phrases(), 1);
        assert_eq!(ev.phrase_extras[0].id, 7);
        assert!(ev.capture_available);
        assert_eq!(ev.media_config, MediaConfig::detection_default());
    }

    #[test]
    fn trailer_packs_three_tlvs_in_order() {
        let det = DetectionEventInfo {
            confidence_levels: vec![88, 90],
            timestamp_lsw: 0xAABB_CCDD,
            timestamp_msw: 0x0000_0001,
        };
        let ev = build_detection_event(&config(), 2, &det, (128, 2048));
        let t = &ev.opaque;

        // TLV 1: confidence levels
        assert_eq!(read_u32(t, 0), KEY_CONFIDENCE_LEVELS);
        let conf_size = read_u32(t, 4) as usize;
        assert_eq!(read_u32(t, 8), CONF_LEVELS_VERSION_1);
        assert_eq!(read_u32(t, 12), 2); // num engines
        // first entry: sm id, one kw level, level byte, zero users
        assert_eq!(read_u32(t, 16), StageId::Gmm.raw());
        assert_eq!(read_u32(t, 20), 1);
        assert_eq!(t[24], 88);

        // TLV 2: keyword indices
        let kw_at = 8 + conf_size;
        assert_eq!(read_u32(t, kw_at), KEY_KEYWORD_INDICES);
        assert_eq!(read_u32(t, kw_at + 8), 1); // version
        assert_eq!(read_u32(t, kw_at + 12), 128);
        assert_eq!(read_u32(t, kw_at + 16), 2048);

        // TLV 3: timestamp
        let ts_at = kw_at + 8 + 12;
        assert_eq!(read_u32(t, ts_at), KEY_TIMESTAMP);
        assert_eq!(read_u32(t, ts_at + 12), 0xAABB_CCDD);
        assert_eq!(read_u32(t, ts_at + 16), 0x0000_0001);
        assert_eq!(t.len(), ts_at + 8 + 12);
    }

    #[test]
    fn missing_confidence_entries_default_to_zero() {
        let det = DetectionEventInfo::default();
        let ev = build_detection_event(&config(), 2, &det, (0, 0));
        // second engine entry's level byte
        assert_eq!(ev.opaque[24 + 13], 0);
    }
}
