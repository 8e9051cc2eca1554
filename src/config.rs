//! Recognition-config handling: the client descriptor, the opaque TLV
//! stream riding on it, and the packed confidence-level array pushed into
//! the first-stage engine.

use serde::Serialize;

use crate::engine::StageId;
use crate::error::{Error, Result};

/// TLV key ids shared by the recognition config and the notification trailer.
pub const KEY_CONFIDENCE_LEVELS: u32 = 3;
pub const KEY_KEYWORD_INDICES: u32 = 4;
pub const KEY_TIMESTAMP: u32 = 5;
pub const KEY_HISTORY_BUFFER_CONFIG: u32 = 6;
pub const KEY_DETECTION_PERF_MODE: u32 = 7;

/// Confidence-levels payload versions. v1 carries u8 user levels, v2 u32.
pub const CONF_LEVELS_VERSION_1: u32 = 1;
pub const CONF_LEVELS_VERSION_2: u32 = 2;

/// An opaque blob at or below this size cannot hold a TLV header plus a
/// version word; such configs take the platform-default path.
pub const BARE_CONFIG_THRESHOLD: usize = 12;

const TLV_HEADER_LEN: usize = 8;

/// One trained user level attached to a phrase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserConfidence {
    /// Slot in the packed confidence array; must be ≥ num_phrases.
    pub user_id: u32,
    pub level: u8,
}

/// Per-phrase recognition descriptor, echoed back in detection events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhraseRecognitionExtra {
    pub id: u32,
    pub recognition_modes: u32,
    pub confidence_level: u8,
    pub levels: Vec<UserConfidence>,
}

/// Client-supplied recognition descriptor. Deep-copied into the stream
/// cache so it can be replayed across profile switches and restarts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecognitionConfig {
    pub capture_requested: bool,
    pub phrases: Vec<PhraseRecognitionExtra>,
    /// Opaque TLV stream; may be empty.
    pub opaque: Vec<u8>,
}

impl RecognitionConfig {
    pub fn num_phrases(&self) -> usize {
        self.phrases.len()
    }
}

/// History-buffer lengths carried in the opaque stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSetup {
    pub hist_duration_ms: u32,
    pub pre_roll_ms: u32,
}

/// Confidence levels recovered from the opaque stream: a packed array for
/// the first stage plus one level per second-stage engine.
#[derive(Debug, Clone, Default)]
pub struct OpaqueConfLevels {
    pub first_stage: Vec<u8>,
    /// (raw stage id, level) pairs for second-stage engines.
    pub second_stage: Vec<(u32, u8)>,
}

/// Everything the opaque TLV stream may carry.
#[derive(Debug, Clone, Default)]
pub struct ParsedOpaque {
    pub conf_levels: Option<OpaqueConfLevels>,
    pub buffer: Option<BufferSetup>,
    pub perf_mode: Option<u32>,
}

/// Pack per-phrase confidence levels into the array layout the first-stage
/// engine expects: slots `[0..num_phrases)` hold keyword levels, user
/// levels land at their `user_id` slot.
///
/// A `user_id` below `num_phrases`, at or past the total length, or seen
/// twice is an error. Levels clamp to 100.
pub fn pack_conf_levels(phrases: &[PhraseRecognitionExtra]) -> Result<Vec<u8>> {
    if phrases.is_empty() {
        return Err(Error::invalid_argument("recognition config has no phrases"));
    }

    let num_phrases = phrases.len();
    let total: usize = num_phrases + phrases.iter().map(|p| p.levels.len()).sum::<usize>();

    let mut out = vec![0u8; total];
    let mut seen = vec![false; total];

    for (i, phrase) in phrases.iter().enumerate() {
        out[i] = phrase.confidence_level.min(100);
        for user in &phrase.levels {
            let id = user.user_id as usize;
            if id < num_phrases || id >= total {
                return Err(Error::invalid_argument(format!(
                    "user id {id} outside [{num_phrases}, {total})"
                )));
            }
            if seen[id] {
                return Err(Error::invalid_argument(format!("duplicate user id {id}")));
            }
            out[id] = user.level.min(100);
            seen[id] = true;
        }
    }

    Ok(out)
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let end = offset
        .checked_add(4)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| Error::invalid_argument("truncated opaque payload"))?;
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[*offset..end]);
    *offset = end;
    Ok(u32::from_le_bytes(word))
}

fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    let b = *data
        .get(*offset)
        .ok_or_else(|| Error::invalid_argument("truncated opaque payload"))?;
    *offset += 1;
    Ok(b)
}

/// One sound model's worth of keyword/user levels from the opaque stream.
struct OpaqueKwLevel {
    kw_level: u8,
    user_levels: Vec<(u32, u8)>,
}

fn parse_conf_levels_payload(payload: &[u8]) -> Result<OpaqueConfLevels> {
    let mut pos = 0usize;
    let version = read_u32(payload, &mut pos)?;
    if version != CONF_LEVELS_VERSION_1 && version != CONF_LEVELS_VERSION_2 {
        return Err(Error::invalid_argument(format!(
            "unsupported confidence-levels version {version}"
        )));
    }

    let num_sound_models = read_u32(payload, &mut pos)?;
    let mut result = OpaqueConfLevels::default();
    let mut gmm_found = false;

    for _ in 0..num_sound_models {
        let sm_id = read_u32(payload, &mut pos)?;
        let num_kw = read_u32(payload, &mut pos)?;
        let mut kw_levels = Vec::with_capacity(num_kw as usize);
        for _ in 0..num_kw {
            let kw_level = read_u8(payload, &mut pos)?;
            let num_users = read_u32(payload, &mut pos)?;
            let mut user_levels = Vec::with_capacity(num_users as usize);
            for _ in 0..num_users {
                let user_id = read_u32(payload, &mut pos)?;
                let level = if version == CONF_LEVELS_VERSION_2 {
                    read_u32(payload, &mut pos)?.min(100) as u8
                } else {
                    read_u8(payload, &mut pos)?
                };
                user_levels.push((user_id, level));
            }
            kw_levels.push(OpaqueKwLevel { kw_level, user_levels });
        }

        if sm_id == StageId::Gmm.raw() {
            gmm_found = true;
            result.first_stage = pack_opaque_kw_levels(&kw_levels)?;
        } else if sm_id & StageId::KeywordVerifier.raw() != 0 {
            let level = kw_levels
                .first()
                .map(|k| k.kw_level)
                .ok_or_else(|| Error::invalid_argument("verifier entry has no levels"))?;
            result.second_stage.push((sm_id, level));
        } else if sm_id & StageId::UserVerifier.raw() != 0 {
            let level = kw_levels
                .first()
                .and_then(|k| k.user_levels.first())
                .map(|&(_, l)| l)
                .ok_or_else(|| Error::invalid_argument("user verifier entry has no levels"))?;
            result.second_stage.push((sm_id, level));
        }
    }

    if !gmm_found {
        return Err(Error::invalid_argument(
            "opaque confidence levels carry no first-stage threshold",
        ));
    }

    Ok(result)
}

/// Same pack rule as [`pack_conf_levels`], applied to the opaque layout
/// where each keyword entry carries its own user list.
fn pack_opaque_kw_levels(kw_levels: &[OpaqueKwLevel]) -> Result<Vec<u8>> {
    let num_kw = kw_levels.len();
    let total: usize = num_kw + kw_levels.iter().map(|k| k.user_levels.len()).sum::<usize>();
    if total == 0 {
        return Err(Error::invalid_argument("empty confidence-level set"));
    }

    let mut out = vec![0u8; total];
    let mut seen = vec![false; total];

    for (i, kw) in kw_levels.iter().enumerate() {
        out[i] = kw.kw_level.min(100);
        for &(user_id, level) in &kw.user_levels {
            let id = user_id as usize;
            if id < num_kw || id >= total {
                return Err(Error::invalid_argument(format!(
                    "user id {id} outside [{num_kw}, {total})"
                )));
            }
            if seen[id] {
                return Err(Error::invalid_argument(format!("duplicate user id {id}")));
            }
            out[id] = level.min(100);
            seen[id] = true;
        }
    }

    Ok(out)
}

/// Walk the opaque TLV stream of a recognition config.
///
/// Three keys are understood; anything else fails the whole config.
pub fn parse_opaque(data: &[u8]) -> Result<ParsedOpaque> {
    let mut parsed = ParsedOpaque::default();
    let mut pos = 0usize;

    while pos < data.len() {
        if pos + TLV_HEADER_LEN > data.len() {
            return Err(Error::invalid_argument("truncated TLV header"));
        }
        let key = read_u32(data, &mut pos)?;
        let size = read_u32(data, &mut pos)? as usize;
        let end = pos
            .checked_add(size)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| Error::invalid_argument("TLV payload out of bounds"))?;
        let payload = &data[pos..end];

        match key {
            KEY_CONFIDENCE_LEVELS => {
                parsed.conf_levels = Some(parse_conf_levels_payload(payload)?);
            }
            KEY_HISTORY_BUFFER_CONFIG => {
                let mut p = 0usize;
                parsed.buffer = Some(BufferSetup {
                    hist_duration_ms: read_u32(payload, &mut p)?,
                    pre_roll_ms: read_u32(payload, &mut p)?,
                });
            }
            KEY_DETECTION_PERF_MODE => {
                let mut p = 0usize;
                parsed.perf_mode = Some(read_u32(payload, &mut p)?);
            }
            _ => {
                return Err(Error::invalid_argument(format!(
                    "unsupported opaque key id {key}"
                )));
            }
        }
        pos = end;
    }

    Ok(parsed)
}

/// Append one TLV (header + payload) to a byte stream.
pub(crate) fn push_tlv(out: &mut Vec<u8>, key: u32, payload: &[u8]) {
    out.extend_from_slice(&key.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}
