//! Acoustic-model container parsing. A keyphrase blob is either a v2
//! container (one monolithic first-stage payload) or a v3 container (global
//! header plus a sub-model table, one payload per engine stage).

use serde::Serialize;
use uuid::Uuid;

use crate::engine::StageId;
use crate::error::{Error, Result};

/// Magic number opening a v3 container ("KWM3", little endian).
pub const GLOBAL_HEADER_MAGIC: u32 = 0x334D_574B;

/// Global header: magic + container version.
const GLOBAL_HEADER_LEN: usize = 8;
/// v3 header: number of sub-model records.
const V3_HEADER_LEN: usize = 4;
/// One sub-model record: stage id, payload size, payload offset.
const V3_RECORD_LEN: usize = 12;

/// Phrase-header prefix prepended to the first-stage payload so the engine
/// receives a self-describing blob: vendor UUID (16 bytes) + phrase count.
const PHRASE_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SoundModelKind {
    Keyphrase,
    Generic,
}

/// Client-supplied sound model. The `data` blob is deep-copied into the
/// stream cache at load so it can be replayed after a subsystem restart.
#[derive(Debug, Clone)]
pub struct SoundModel {
    pub kind: SoundModelKind,
    pub vendor_uuid: Uuid,
    pub num_phrases: u32,
    pub data: Vec<u8>,
}

impl SoundModel {
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Error::invalid_argument("sound model data is empty"));
        }
        if self.kind == SoundModelKind::Keyphrase && self.num_phrases == 0 {
            return Err(Error::invalid_argument("keyphrase model has zero phrases"));
        }
        Ok(())
    }
}

/// One engine's share of a parsed container.
#[derive(Debug, Clone)]
pub struct StagePayload {
    pub stage: StageId,
    pub data: Vec<u8>,
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let end = offset
        .checked_add(4)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| Error::invalid_argument("truncated sound model container"))?;
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[offset..end]);
    Ok(u32::from_le_bytes(word))
}

/// Wrap a first-stage payload in a copy of the phrase header.
fn wrap_first_stage(model: &SoundModel, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PHRASE_HEADER_LEN + payload.len());
    out.extend_from_slice(model.vendor_uuid.as_bytes());
    out.extend_from_slice(&model.num_phrases.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a keyphrase model into per-stage payloads.
///
/// If the blob opens with [`GLOBAL_HEADER_MAGIC`] it is parsed as a v3
/// container; otherwise the whole blob is the single first-stage payload.
/// A v3 container without a GMM record fails, as does a duplicate stage.
pub fn parse_stage_payloads(model: &SoundModel) -> Result<Vec<StagePayload>> {
    model.validate()?;

    let data = &model.data;
    if data.len() < GLOBAL_HEADER_LEN || read_u32(data, 0)? != GLOBAL_HEADER_MAGIC {
        // v2: single monolithic first-stage payload.
        return Ok(vec![StagePayload {
            stage: StageId::Gmm,
            data: wrap_first_stage(model, data),
        }]);
    }

    let num_models = read_u32(data, GLOBAL_HEADER_LEN)? as usize;
    if num_models == 0 {
        return Err(Error::invalid_argument("v3 container holds no sub-models"));
    }

    let table_start = GLOBAL_HEADER_LEN + V3_HEADER_LEN;
    let payload_base = table_start + num_models * V3_RECORD_LEN;
    if payload_base > data.len() {
        return Err(Error::invalid_argument("v3 sub-model table truncated"));
    }

    let mut payloads = Vec::with_capacity(num_models);
    for i in 0..num_models {
        let rec = table_start + i * V3_RECORD_LEN;
        let stage_raw = read_u32(data, rec)?;
        let size = read_u32(data, rec + 4)? as usize;
        let offset = read_u32(data, rec + 8)? as usize;

        let stage = StageId::from_raw(stage_raw).ok_or_else(|| {
            Error::invalid_argument(format!("unknown sub-model stage id {stage_raw:#x}"))
        })?;
        if payloads.iter().any(|p: &StagePayload| p.stage == stage) {
            return Err(Error::invalid_argument(format!(
                "duplicate sub-model for stage {stage:?}"
            )));
        }

        let start = payload_base
            .checked_add(offset)
            .ok_or_else(|| Error::invalid_argument("sub-model offset overflow"))?;
        let end = start
            .checked_add(size)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| Error::invalid_argument("sub-model payload out of bounds"))?;
        if size == 0 {
            return Err(Error::invalid_argument("sub-model payload is empty"));
        }

        let raw = &data[start..end];
        let payload = if stage == StageId::Gmm {
            wrap_first_stage(model, raw)
        } else {
            raw.to_vec()
        };
        payloads.push(StagePayload { stage, data: payload });
    }

    if !payloads.iter().any(|p| p.stage == StageId::Gmm) {
        return Err(Error::invalid_argument(
            "v3 container carries no first-stage sound model",
        ));
    }

    Ok(payloads)
}
