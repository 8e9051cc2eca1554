//! wakegate: voice-activated keyphrase detection stream.
//!
//! The crate implements the per-stream control plane sitting between a
//! client (load model, configure, start, read buffered keyword audio) and
//! the platform (detection engines, capture devices, resource manager).
//! All asynchronous inputs (client calls, engine verdicts, the
//! deferred-stop timer, device hot-plug, charging and pause/resume
//! notifications, subsystem restarts) are linearised through one
//! per-stream state machine.

pub mod callback;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod platform;
pub mod rman;
pub mod state_machine;
pub mod stream;
pub mod timer;

mod pump;

pub use callback::{build_detection_event, PhraseRecognitionEvent};
pub use config::{PhraseRecognitionExtra, RecognitionConfig, UserConfidence};
pub use device::{CaptureDevice, DeviceConfig, DeviceId};
pub use engine::{BufferReader, DetectionEventInfo, Engine, EngineFactory, StageId};
pub use error::{Error, Result};
pub use event::{ConcurrentStreamType, DetectionKind, Event, StreamDirection};
pub use model::{SoundModel, SoundModelKind};
pub use platform::{CaptureProfile, InputMode, MediaConfig, ModelInfo, OperatingMode, PlatformInfo};
pub use rman::{InstanceId, ResourceManager};
pub use state_machine::StState;
pub use stream::{DetectionCallback, KeyphraseStream, StreamAttributes};
pub use timer::DEFERRED_STOP_DELAY;
