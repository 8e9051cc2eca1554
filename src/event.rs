//! Event alphabet accepted by the stream state machine.
//! Every asynchronous input (client call, engine verdict, timer fire,
//! platform notification) is expressed as one of these variants before it
//! reaches a state handler.

use serde::Serialize;

use crate::config::RecognitionConfig;
use crate::device::DeviceId;
use crate::model::SoundModel;

/// Verdict posted by a detection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectionKind {
    /// First-stage keyword trigger.
    GmmDetected,
    /// Second-stage keyword verifier confirmed.
    CnnDetected,
    /// Second-stage keyword verifier rejected.
    CnnRejected,
    /// Second-stage user verifier confirmed.
    VopDetected,
    /// Second-stage user verifier rejected.
    VopRejected,
}

impl DetectionKind {
    /// Bit used when OR-ing verdicts into the stream's detection state.
    pub fn bit(self) -> u32 {
        match self {
            DetectionKind::GmmDetected => 1 << 0,
            DetectionKind::CnnDetected => 1 << 1,
            DetectionKind::CnnRejected => 1 << 2,
            DetectionKind::VopDetected => 1 << 3,
            DetectionKind::VopRejected => 1 << 4,
        }
    }

    pub fn is_second_stage_rejection(self) -> bool {
        matches!(self, DetectionKind::CnnRejected | DetectionKind::VopRejected)
    }
}

/// Mask of positive second-stage verdicts; any bit here confirms detection.
pub const SECOND_STAGE_DETECTED_MASK: u32 = (1 << 1) | (1 << 3);

/// Direction of a concurrent stream reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamDirection {
    Output,
    Input,
    InputOutput,
}

/// Type of a concurrent stream, as far as the pause policy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConcurrentStreamType {
    LowLatency,
    DeepBuffer,
    Raw,
    VoiceCall,
    VoiceCallTx,
    VoiceCallRxTx,
    VoipTx,
}

impl ConcurrentStreamType {
    pub fn is_voice_call(self) -> bool {
        matches!(
            self,
            ConcurrentStreamType::VoiceCall
                | ConcurrentStreamType::VoiceCallTx
                | ConcurrentStreamType::VoiceCallRxTx
        )
    }
}

/// Events dispatched to the current state handler.
///
/// Client reads are not listed here: a borrowed destination buffer cannot
/// live in an owned, queueable event, so the read path consults the state
/// table synchronously (see `KeyphraseStream::read`).
#[derive(Debug, Clone)]
pub enum Event {
    LoadSoundModel(SoundModel),
    UnloadSoundModel,
    RecognitionConfig(RecognitionConfig),
    StartRecognition { restart: bool },
    StopRecognition { deferred: bool },
    StopBuffering,
    Detected(DetectionKind),
    Pause,
    Resume,
    ConcurrentStream {
        stream_type: ConcurrentStreamType,
        active: bool,
    },
    ChargingState(bool),
    DeviceConnected(DeviceId),
    DeviceDisconnected(DeviceId),
    EcRef { device: DeviceId, enable: bool },
    SsrOffline,
    SsrOnline,
}

impl Event {
    /// Short name for structured logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::LoadSoundModel(_) => "load_sound_model",
            Event::UnloadSoundModel => "unload_sound_model",
            Event::RecognitionConfig(_) => "recognition_config",
            Event::StartRecognition { .. } => "start_recognition",
            Event::StopRecognition { .. } => "stop_recognition",
            Event::StopBuffering => "stop_buffering",
            Event::Detected(_) => "detected",
            Event::Pause => "pause",
            Event::Resume => "resume",
            Event::ConcurrentStream { .. } => "concurrent_stream",
            Event::ChargingState(_) => "charging_state",
            Event::DeviceConnected(_) => "device_connected",
            Event::DeviceDisconnected(_) => "device_disconnected",
            Event::EcRef { .. } => "ec_ref",
            Event::SsrOffline => "ssr_offline",
            Event::SsrOnline => "ssr_online",
        }
    }
}
