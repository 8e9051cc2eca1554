//! Stream controller: owns the state machine, engines, devices, cached
//! configs and the ring-buffer reader, and serialises every mutation under
//! one stream lock. Client API calls, engine callbacks, the deferred-stop
//! timer and the external-event pump all funnel through here.
//!
//! The client callback is invoked with the stream lock released, so a
//! client may re-enter `start` / `stop` / `read` / `stop_buffering` from
//! inside it; such calls serialise behind the lock like any other.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::callback::{build_detection_event, PhraseRecognitionEvent};
use crate::config::{
    pack_conf_levels, parse_opaque, BufferSetup, RecognitionConfig, BARE_CONFIG_THRESHOLD,
};
use crate::device::{CaptureDevice, DeviceConfig, DeviceId};
use crate::engine::{BufferReader, Engine, EngineBinding, EngineFactory, StageId};
use crate::error::{Error, Result};
use crate::event::{ConcurrentStreamType, DetectionKind, Event, StreamDirection};
use crate::model::{SoundModel, SoundModelKind};
use crate::platform::{CaptureProfile, InputMode, MediaConfig, ModelInfo, OperatingMode, PlatformInfo};
use crate::pump::{run_pump, EventPump};
use crate::rman::{InstanceId, ResourceManager};
use crate::state_machine::StState;
use crate::timer::DeferredStopTimer;

/// Client detection callback. Captures its own context in place of the
/// traditional cookie pointer.
pub type DetectionCallback = Arc<dyn Fn(&PhraseRecognitionEvent) + Send + Sync>;

/// Static attributes of a stream, fixed at creation.
#[derive(Debug, Clone)]
pub struct StreamAttributes {
    pub direction: StreamDirection,
    pub media: MediaConfig,
}

pub(crate) struct StreamInner {
    pub(crate) rm: Arc<dyn ResourceManager>,
    pub(crate) platform: Arc<PlatformInfo>,
    pub(crate) engine_factory: Arc<dyn EngineFactory>,
    pub(crate) timer: Arc<DeferredStopTimer>,
    pub(crate) attributes: StreamAttributes,

    pub(crate) state: StState,
    pub(crate) prev_state: Option<StState>,
    pub(crate) state_for_restore: Option<StState>,
    pub(crate) paused: bool,
    pub(crate) pending_stop: bool,
    pub(crate) charging: bool,
    pub(crate) conc_tx_count: i32,
    pub(crate) detection_state: u32,

    pub(crate) devices: Vec<Arc<dyn CaptureDevice>>,
    pub(crate) engines: Vec<EngineBinding>,
    pub(crate) first_stage: Option<Arc<dyn Engine>>,
    pub(crate) reader: Option<Box<dyn BufferReader>>,
    pub(crate) cap_profile: Option<CaptureProfile>,
    pub(crate) model_info: Option<ModelInfo>,
    pub(crate) sound_model_cfg: Option<SoundModel>,
    pub(crate) rec_cfg: Option<RecognitionConfig>,
    pub(crate) instance_id: Option<InstanceId>,
    pub(crate) callback: Option<DetectionCallback>,
    pub(crate) pending_notifications: Vec<PhraseRecognitionEvent>,
}

pub(crate) struct StreamShared {
    pub(crate) inner: Mutex<StreamInner>,
}

impl StreamShared {
    /// Run `f` under the stream lock, then deliver any notifications the
    /// handler queued, with the lock released.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut StreamInner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner);
        let pending = std::mem::take(&mut inner.pending_notifications);
        let callback = inner.callback.clone();
        drop(inner);
        if let Some(cb) = callback {
            for event in &pending {
                debug!(num_phrases = event.num_phrases(), "notifying client");
                cb(event);
            }
        } else if !pending.is_empty() {
            warn!("detection dropped, no client callback registered");
        }
        result
    }

    /// Timer-worker entry: commit the deferred stop if still pending.
    fn internal_stop(&self) {
        self.with_inner(|inner| {
            if inner.pending_stop {
                if let Err(e) = inner.process_event(&Event::StopRecognition { deferred: true }) {
                    error!(error = %e, "deferred stop failed");
                }
            } else {
                debug!("deferred stop superseded, nothing pending");
            }
        });
    }

    /// Pump-worker entry: dispatch a drained batch in FIFO order under one
    /// lock acquisition.
    fn handle_external_batch(&self, batch: Vec<Event>) {
        self.with_inner(|inner| {
            for event in &batch {
                if let Err(e) = inner.process_external(event) {
                    warn!(event = event.name(), error = %e, "external event failed");
                }
            }
        });
    }
}

/// A voice-activated keyphrase detection stream.
pub struct KeyphraseStream {
    shared: Arc<StreamShared>,
    timer: Arc<DeferredStopTimer>,
    pump: EventPump,
    rm: Arc<dyn ResourceManager>,
    timer_thread: Option<JoinHandle<()>>,
    pump_thread: Option<JoinHandle<()>>,
}

impl KeyphraseStream {
    pub fn new(
        attributes: StreamAttributes,
        rm: Arc<dyn ResourceManager>,
        platform: Arc<PlatformInfo>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        if !MediaConfig::is_sample_rate_supported(attributes.media.sample_rate)
            || !MediaConfig::is_bit_width_supported(attributes.media.bit_width)
            || !MediaConfig::is_channel_count_supported(attributes.media.channels)
        {
            return Err(Error::invalid_argument("unsupported stream media config"));
        }

        let charging = rm.charging_state();
        debug!(charging, "creating keyphrase stream");
        rm.register_stream();

        let timer = Arc::new(DeferredStopTimer::new());
        let (pump, pump_rx) = EventPump::new();

        let inner = StreamInner {
            rm: Arc::clone(&rm),
            platform,
            engine_factory,
            timer: Arc::clone(&timer),
            attributes,
            state: StState::Idle,
            prev_state: None,
            state_for_restore: None,
            paused: false,
            pending_stop: false,
            charging,
            conc_tx_count: 0,
            detection_state: 0,
            devices: Vec::new(),
            engines: Vec::new(),
            first_stage: None,
            reader: None,
            cap_profile: None,
            model_info: None,
            sound_model_cfg: None,
            rec_cfg: None,
            instance_id: None,
            callback: None,
            pending_notifications: Vec::new(),
        };
        let shared = Arc::new(StreamShared {
            inner: Mutex::new(inner),
        });

        let timer_shared = Arc::clone(&shared);
        let timer_handle = Arc::clone(&timer);
        let timer_thread = std::thread::Builder::new()
            .name("wakegate-timer".into())
            .spawn(move || {
                timer_handle.run(|| timer_shared.internal_stop());
            })
            .map_err(|e| Error::ResourceExhausted(format!("timer thread spawn failed: {e}")))?;

        let pump_shared = Arc::clone(&shared);
        let pump_thread = std::thread::Builder::new()
            .name("wakegate-events".into())
            .spawn(move || {
                run_pump(pump_rx, |batch| pump_shared.handle_external_batch(batch));
            })
            .map_err(|e| Error::ResourceExhausted(format!("pump thread spawn failed: {e}")))?;

        Ok(KeyphraseStream {
            shared,
            timer,
            pump,
            rm,
            timer_thread: Some(timer_thread),
            pump_thread: Some(pump_thread),
        })
    }

    fn dispatch(&self, event: Event) -> Result<()> {
        self.shared.with_inner(|inner| inner.process_event(&event))
    }

    // --- client operations (synchronous, under the stream lock) ---

    pub fn load_sound_model(&self, model: SoundModel) -> Result<()> {
        self.dispatch(Event::LoadSoundModel(model))
    }

    pub fn send_recognition_config(&self, config: RecognitionConfig) -> Result<()> {
        self.dispatch(Event::RecognitionConfig(config))
    }

    pub fn start(&self) -> Result<()> {
        self.dispatch(Event::StartRecognition { restart: false })
    }

    pub fn stop(&self) -> Result<()> {
        self.dispatch(Event::StopRecognition { deferred: false })
    }

    pub fn stop_buffering(&self) -> Result<()> {
        self.dispatch(Event::StopBuffering)
    }

    /// Read buffered keyword audio through the client reader cursor.
    /// Fails with `Io` outside the Buffering state.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.with_inner(|inner| inner.process_read(buf))
    }

    /// Unload and tear down, returning the stream to Idle. Cached model and
    /// recognition config are discarded.
    pub fn close(&self) -> Result<()> {
        let status = self.dispatch(Event::UnloadSoundModel);
        self.shared.with_inner(|inner| {
            inner.sound_model_cfg = None;
            inner.rec_cfg = None;
            inner.reader = None;
        });
        status
    }

    pub fn register_callback(&self, callback: DetectionCallback) {
        self.shared.with_inner(|inner| inner.callback = Some(callback));
    }

    /// Parameter passthrough to the first-stage engine.
    pub fn get_parameters(&self, param_id: u32) -> Result<Vec<u8>> {
        self.shared.with_inner(|inner| {
            let engine = inner
                .first_stage
                .as_ref()
                .ok_or_else(|| Error::invalid_argument("no first-stage engine present"))?;
            engine.get_parameters(param_id)
        })
    }

    /// Downstream setup latency reported by the first-stage engine.
    pub fn setup_duration_ms(&self) -> Result<u32> {
        self.shared.with_inner(|inner| {
            inner
                .first_stage
                .as_ref()
                .map(|e| e.setup_duration_ms())
                .ok_or_else(|| Error::invalid_argument("no first-stage engine present"))
        })
    }

    pub fn set_ec_ref(&self, device: DeviceId, enable: bool) -> Result<()> {
        self.dispatch(Event::EcRef { device, enable })
    }

    /// Engine callback entry: a detection verdict from any stage.
    pub fn set_engine_detection_state(&self, kind: DetectionKind) -> Result<()> {
        self.dispatch(Event::Detected(kind))
    }

    // --- external notifications (queued through the pump) ---

    /// A platform capture device appeared or vanished. The id is mapped to
    /// the voice-activation mic it implies before the event is queued.
    pub fn update_device_connection(&self, connect: bool, device_id: DeviceId) -> Result<()> {
        let Some(dest) = device_id.va_mic() else {
            debug!(?device_id, "unsupported device, connection ignored");
            return Ok(());
        };

        self.shared.with_inner(|inner| {
            for dev in &inner.devices {
                let current = dev.id();
                if (connect && current == dest) || (!connect && current != dest) {
                    return Err(Error::invalid_argument(
                        "device connection does not change the selected mic",
                    ));
                }
            }
            Ok(())
        })?;

        if connect {
            self.pump.post(Event::DeviceConnected(dest));
        } else {
            self.pump.post(Event::DeviceDisconnected(dest));
        }
        Ok(())
    }

    pub fn update_charging_state(&self, on: bool) -> Result<()> {
        let changed = self.shared.with_inner(|inner| {
            if inner.charging == on {
                false
            } else {
                inner.charging = on;
                true
            }
        });
        if changed {
            self.pump.post(Event::ChargingState(on));
        } else {
            debug!(on, "no change in charging state");
        }
        Ok(())
    }

    pub fn external_start(&self) {
        self.pump.post(Event::Resume);
    }

    pub fn external_stop(&self) {
        self.pump.post(Event::Pause);
    }

    /// Resource-manager notification of concurrent stream activity.
    ///
    /// Output streams re-derive the capture profile when LPI is supported.
    /// Capture-direction streams the platform cannot run next to voice
    /// activation pause this stream; only the first concurrent arrival
    /// pauses and only the last departure resumes.
    pub fn concurrent_stream_status(
        &self,
        stream_type: ConcurrentStreamType,
        direction: StreamDirection,
        active: bool,
    ) -> Result<()> {
        match direction {
            StreamDirection::Output => {
                if self.rm.is_voice_ui_lpi_supported() {
                    return self.dispatch(Event::ConcurrentStream { stream_type, active });
                }
                Ok(())
            }
            StreamDirection::Input | StreamDirection::InputOutput => {
                let mut conc_en = true;
                if self.rm.is_audio_capture_concurrency_supported() {
                    if (!self.rm.is_voice_call_concurrency_supported() && stream_type.is_voice_call())
                        || (!self.rm.is_voip_concurrency_supported()
                            && stream_type == ConcurrentStreamType::VoipTx)
                    {
                        debug!(?stream_type, "pausing on voice/voip concurrency");
                        conc_en = false;
                    }
                } else if matches!(
                    stream_type,
                    ConcurrentStreamType::LowLatency | ConcurrentStreamType::Raw
                ) || stream_type.is_voice_call()
                    || stream_type == ConcurrentStreamType::VoipTx
                {
                    conc_en = false;
                }

                if conc_en {
                    return Ok(());
                }
                self.shared.with_inner(|inner| {
                    if active {
                        inner.conc_tx_count += 1;
                        if inner.conc_tx_count == 1 {
                            return inner.process_event(&Event::Pause);
                        }
                    } else {
                        inner.conc_tx_count -= 1;
                        if inner.conc_tx_count == 0 {
                            return inner.process_event(&Event::Resume);
                        }
                    }
                    Ok(())
                })
            }
        }
    }

    // --- subsystem restart ---

    pub fn ssr_down(&self) -> Result<()> {
        self.dispatch(Event::SsrOffline)
    }

    pub fn ssr_up(&self) -> Result<()> {
        self.dispatch(Event::SsrOnline)
    }

    // --- observability ---

    pub fn state(&self) -> StState {
        self.shared.with_inner(|inner| inner.state)
    }

    pub fn attributes(&self) -> StreamAttributes {
        self.shared.with_inner(|inner| inner.attributes.clone())
    }

    pub fn previous_state(&self) -> Option<StState> {
        self.shared.with_inner(|inner| inner.prev_state)
    }
}

impl Drop for KeyphraseStream {
    fn drop(&mut self) {
        self.timer.shutdown();
        self.pump.shutdown();
        if let Some(t) = self.timer_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.pump_thread.take() {
            let _ = t.join();
        }
        self.rm.deregister_stream();
        debug!("keyphrase stream destroyed");
    }
}

// --- resource transitions shared by the state handlers ---

impl StreamInner {
    /// Best available capture device under the current headset policy.
    pub(crate) fn avail_capture_device(&self) -> DeviceId {
        if self.platform.support_dev_switch()
            && self.rm.is_device_available(DeviceId::WiredHeadset)
        {
            DeviceId::HeadsetVaMic
        } else {
            DeviceId::HandsetVaMic
        }
    }

    /// Derive the capture profile for the current LPI / charging / headset
    /// conditions from the loaded model's platform record.
    pub(crate) fn current_capture_profile(&self) -> Result<CaptureProfile> {
        let info = self
            .model_info
            .as_ref()
            .ok_or_else(|| Error::not_found("no model platform record loaded"))?;

        let mut lpi =
            self.rm.is_voice_ui_lpi_supported() && !self.rm.has_active_non_lpi_stream();
        let transit_to_nlpi = self.rm.forced_transit_to_non_lpi();
        if transit_to_nlpi {
            lpi = false;
        }

        let input_mode = if self.avail_capture_device() == DeviceId::HeadsetVaMic {
            InputMode::Headset
        } else {
            InputMode::Handset
        };
        let op_mode = if lpi {
            OperatingMode::LowPower
        } else if transit_to_nlpi {
            OperatingMode::HighPerfAndCharging
        } else {
            OperatingMode::HighPerf
        };

        let profile = info
            .capture_profile(op_mode, input_mode)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!("no capture profile for {op_mode:?}/{input_mode:?}"))
            })?;
        debug!(
            profile = %profile.name,
            device = ?profile.device_id,
            channels = profile.channels,
            sample_rate = profile.sample_rate,
            "derived capture profile"
        );
        Ok(profile)
    }

    /// Device attributes for `dev_id` under the currently-derived profile.
    pub(crate) fn device_config_for(&self, dev_id: DeviceId) -> Result<DeviceConfig> {
        let profile = self.current_capture_profile()?;
        Ok(Self::device_config_from(&profile, dev_id))
    }

    pub(crate) fn device_config_from(profile: &CaptureProfile, dev_id: DeviceId) -> DeviceConfig {
        DeviceConfig {
            id: dev_id,
            sample_rate: profile.sample_rate,
            bit_width: profile.bit_width,
            channels: profile.channels,
            snd_name: profile.snd_name.clone(),
        }
    }

    /// Full load sequence (Idle → Loaded body).
    pub(crate) fn load_locked(&mut self, model: &SoundModel) -> Result<()> {
        let info = self
            .platform
            .model(&model.vendor_uuid)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_argument(format!("unknown vendor uuid {}", model.vendor_uuid))
            })?;
        self.model_info = Some(info);

        if self.devices.is_empty() {
            let dev_id = self.avail_capture_device();
            debug!(?dev_id, "selecting available capture device");
            let config = self.device_config_for(dev_id)?;
            let dev = self.rm.acquire_device(&config)?;
            self.devices.push(dev);
        }
        if let Some(dev) = self.devices.first() {
            dev.open()?;
        }

        self.cap_profile = Some(self.current_capture_profile()?);

        let stream_kv = self.model_info.as_ref().map(|i| i.stream_config_kv).unwrap_or((0, 0));
        self.instance_id = Some(self.rm.stream_instance_id(stream_kv));

        // Cache the exact bytes needed to replay this load after SSR.
        if self.sound_model_cfg.as_ref().map(|m| &m.data) != Some(&model.data) {
            self.sound_model_cfg = Some(model.clone());
        }

        if let Err(e) = self.load_engines(model) {
            self.unwind_load();
            return Err(e);
        }
        Ok(())
    }

    /// Parse the container and bring up one engine per stage.
    fn load_engines(&mut self, model: &SoundModel) -> Result<()> {
        let payloads = crate::model::parse_stage_payloads(model)?;
        for stage_payload in payloads {
            let stage = stage_payload.stage;
            debug!(?stage, size = stage_payload.data.len(), "loading engine stage");
            let engine = self.engine_factory.create(stage)?;
            engine.load_sound_model(&stage_payload.data)?;
            if stage == StageId::Gmm {
                self.first_stage = Some(Arc::clone(&engine));
            }
            self.add_engine(EngineBinding {
                stage,
                engine,
                payload: stage_payload.data,
            });
        }
        if self.first_stage.is_none() {
            return Err(Error::invalid_argument("first-stage sound model not present"));
        }
        Ok(())
    }

    fn add_engine(&mut self, binding: EngineBinding) {
        if self.engines.iter().any(|e| e.stage == binding.stage) {
            debug!(stage = ?binding.stage, "engine stage already bound");
            return;
        }
        self.engines.push(binding);
    }

    /// Unwind a failed load symmetrically: engines, reader, cached model,
    /// instance id; the device is closed but stays in the list.
    fn unwind_load(&mut self) {
        for binding in &self.engines {
            let _ = binding.engine.unload_sound_model();
        }
        self.engines.clear();
        self.first_stage = None;
        self.reader = None;
        self.sound_model_cfg = None;
        if let Some(instance) = self.instance_id.take() {
            let kv = self.model_info.as_ref().map(|i| i.stream_config_kv).unwrap_or((0, 0));
            self.rm.reset_stream_instance_id(instance, kv);
        }
        if let Some(dev) = self.devices.first() {
            if let Err(e) = dev.close() {
                warn!(error = %e, "device close failed during load unwind");
            }
        }
    }

    /// Unload sequence (Loaded → Idle body). Device-close failure is
    /// reported but never blocks engine teardown.
    pub(crate) fn unload_locked(&mut self) -> Result<()> {
        let mut first_err: Option<Error> = None;

        if let Some(dev) = self.devices.first() {
            debug!(device = ?dev.id(), "closing device");
            if let Err(e) = dev.close() {
                error!(error = %e, "device close failed");
                first_err.get_or_insert(e);
            }
        }

        for binding in &self.engines {
            debug!(stage = ?binding.stage, payload_len = binding.payload.len(), "unloading engine");
            if let Err(e) = binding.engine.unload_sound_model() {
                error!(stage = ?binding.stage, error = %e, "engine unload failed");
                first_err.get_or_insert(e);
            }
        }
        self.engines.clear();
        self.first_stage = None;
        self.reader = None;

        if let Some(instance) = self.instance_id.take() {
            let kv = self.model_info.as_ref().map(|i| i.stream_config_kv).unwrap_or((0, 0));
            self.rm.reset_stream_instance_id(instance, kv);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cache-only model refresh used while the subsystem is down.
    pub(crate) fn update_sound_model(&mut self, model: &SoundModel) -> Result<()> {
        model.validate()?;
        self.sound_model_cfg = Some(model.clone());
        Ok(())
    }

    /// Cache-only recognition-config refresh used while the subsystem is down.
    pub(crate) fn update_recognition_config(&mut self, config: &RecognitionConfig) {
        if self.rec_cfg.as_ref() != Some(config) {
            self.rec_cfg = Some(config.clone());
        }
    }

    /// Apply a recognition config (§ Loaded row): cache it, derive buffer
    /// lengths and confidence levels, size the ring buffer, and hand
    /// readers to the client and second-stage engines.
    pub(crate) fn send_recognition_config_locked(
        &mut self,
        config: &RecognitionConfig,
    ) -> Result<()> {
        self.update_recognition_config(config);
        let result = self.apply_recognition_config(config);
        if result.is_err() {
            // A half-applied config must not be replayed later.
            self.rec_cfg = None;
        }
        result
    }

    fn apply_recognition_config(&mut self, config: &RecognitionConfig) -> Result<()> {
        let first = self
            .first_stage
            .clone()
            .ok_or_else(|| Error::not_found("no first-stage engine for recognition config"))?;
        let info = self
            .model_info
            .clone()
            .ok_or_else(|| Error::not_found("no model platform record loaded"))?;

        let (buffer, first_levels, second_levels) = if config.opaque.len() > BARE_CONFIG_THRESHOLD
        {
            let parsed = parse_opaque(&config.opaque)?;
            let conf = parsed.conf_levels.unwrap_or_default();
            let buffer = parsed.buffer.unwrap_or(BufferSetup {
                hist_duration_ms: info.kw_duration_ms,
                pre_roll_ms: 0,
            });
            if let Some(mode) = parsed.perf_mode {
                debug!(mode, "detection performance mode requested");
            }
            (buffer, conf.first_stage, conf.second_stage)
        } else {
            let levels = pack_conf_levels(&config.phrases)?;
            (
                BufferSetup {
                    hist_duration_ms: info.kw_duration_ms,
                    pre_roll_ms: 0,
                },
                levels,
                Vec::new(),
            )
        };

        debug!(
            hist_ms = buffer.hist_duration_ms,
            pre_roll_ms = buffer.pre_roll_ms,
            read_delay_ms = info.capture_read_delay_ms,
            "buffer configuration"
        );
        first.update_buf_config(buffer.hist_duration_ms, buffer.pre_roll_ms)?;

        let ring_len_ms =
            buffer.hist_duration_ms + buffer.pre_roll_ms + info.capture_read_delay_ms;
        let ring_size = (ring_len_ms as usize / 1000)
            * info.media.sample_rate as usize
            * info.media.bit_width as usize
            * info.media.channels as usize
            / 8;

        let mut readers = first.create_buffer(ring_size, self.engines.len())?;
        if readers.len() != self.engines.len() {
            return Err(Error::io("ring buffer returned wrong reader count"));
        }

        // Reader 0 is the client's cursor; the rest bind to second stages.
        self.reader = Some(readers.remove(0));
        let mut readers = readers.into_iter();
        for binding in self.engines.iter().filter(|b| b.stage != StageId::Gmm) {
            let reader = readers
                .next()
                .ok_or_else(|| Error::io("ran out of ring buffer readers"))?;
            binding.engine.set_buffer_reader(reader)?;
        }

        for (sm_id, level) in &second_levels {
            for binding in &self.engines {
                if binding.stage.raw() == *sm_id {
                    binding.engine.update_conf_levels(&[*level])?;
                }
            }
        }
        first.update_conf_levels(&first_levels)?;

        // Capture stays on whenever a second stage must replay the buffer.
        let capture = config.capture_requested || self.engines.len() > 1;
        first.set_capture_requested(capture);
        Ok(())
    }

    /// Start sequence (Loaded → Active body, §4.6). Returns `Transient` on
    /// engine-start failure after rolling the device back.
    pub(crate) fn start_recognition_locked(&mut self, restart: bool) -> Result<()> {
        if self.rec_cfg.is_none() {
            warn!(restart, "recognition config not set");
            return Err(Error::invalid_argument("recognition config not set"));
        }
        let instance = self.instance_id.unwrap_or(0);

        let backend_update = self.rm.update_capture_profile(instance, true);
        if backend_update {
            if let Err(e) = self.rm.stop_other_streams(instance) {
                error!(error = %e, "failed to stop other voice streams");
            }
            if let Err(e) = self.rm.start_other_streams(instance) {
                error!(error = %e, "failed to start other voice streams");
            }
        }

        if let Some(dev) = self.devices.first().cloned() {
            let profile = self
                .rm
                .capture_profile()
                .ok_or_else(|| Error::not_found("no composite capture profile"))?;
            let config = Self::device_config_from(&profile, dev.id());
            dev.set_attributes(&config)?;
            debug!(device = ?dev.id(), snd = %profile.snd_name, "starting device");
            dev.start()?;
            self.rm.register_device(dev.id());
        }

        let mut started: Vec<Arc<dyn Engine>> = Vec::with_capacity(self.engines.len());
        for binding in &self.engines {
            debug!(stage = ?binding.stage, "starting engine");
            if let Err(e) = binding.engine.start_recognition() {
                error!(stage = ?binding.stage, error = %e, "engine start failed");
                for engine in &started {
                    let _ = engine.stop_recognition();
                }
                if let Some(dev) = self.devices.first() {
                    self.rm.deregister_device(dev.id());
                    let _ = dev.stop();
                }
                return Err(Error::Transient(format!("engine start failed: {e}")));
            }
            started.push(Arc::clone(&binding.engine));
        }

        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
        Ok(())
    }

    /// Stop engines and the device, deregistering it. `update_backend`
    /// re-balances the composite profile first (pause-driven stops).
    pub(crate) fn stop_recognition_locked(&mut self, update_backend: bool) {
        let instance = self.instance_id.unwrap_or(0);
        if update_backend {
            let backend_update = self.rm.update_capture_profile(instance, false);
            if backend_update {
                if let Err(e) = self.rm.stop_other_streams(instance) {
                    error!(error = %e, "failed to stop other voice streams");
                }
                if let Err(e) = self.rm.start_other_streams(instance) {
                    error!(error = %e, "failed to start other voice streams");
                }
            }
        }

        for binding in &self.engines {
            debug!(stage = ?binding.stage, "stopping engine");
            if let Err(e) = binding.engine.stop_recognition() {
                error!(stage = ?binding.stage, error = %e, "engine stop failed");
            }
        }
        if let Some(dev) = self.devices.first() {
            debug!(device = ?dev.id(), "stopping device");
            if let Err(e) = dev.stop() {
                error!(error = %e, "device stop failed");
            }
            self.rm.deregister_device(dev.id());
        }
    }

    pub(crate) fn stop_buffering_all(&mut self) {
        for binding in &self.engines {
            debug!(stage = ?binding.stage, "stopping buffering");
            if let Err(e) = binding.engine.stop_buffering() {
                error!(stage = ?binding.stage, error = %e, "stop buffering failed");
            }
        }
        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
    }

    /// Restart every engine for the next detection cycle.
    pub(crate) fn restart_engines(&mut self) -> Result<()> {
        let mut status = Ok(());
        for binding in &self.engines {
            debug!(stage = ?binding.stage, "restarting engine");
            if let Err(e) = binding.engine.restart_recognition() {
                error!(stage = ?binding.stage, error = %e, "engine restart failed");
                status = Err(Error::Transient(format!("engine restart failed: {e}")));
                break;
            }
        }
        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
        status
    }

    /// Broadcast the first-stage trigger to second-stage engines.
    pub(crate) fn set_detected_to_engines(&self, detected: bool) {
        for binding in &self.engines {
            if binding.stage != StageId::Gmm {
                debug!(stage = ?binding.stage, detected, "notifying verifier");
                binding.engine.set_detected(detected);
            }
        }
    }

    /// Rebuild the bound device after a hot-plug, reconnecting engine
    /// sessions. `running` selects the Active-state variant (stop/start and
    /// registration around the swap).
    pub(crate) fn reconfigure_device_locked(
        &mut self,
        dev_id: DeviceId,
        running: bool,
    ) -> Result<()> {
        let config = self.device_config_for(dev_id)?;
        let first = self
            .first_stage
            .clone()
            .ok_or_else(|| Error::not_found("no first-stage engine for device switch"))?;

        for dev in &self.devices {
            first.disconnect_session_device(&config);
            if running {
                dev.stop()?;
                self.rm.deregister_device(dev.id());
            }
            dev.close()?;
        }
        self.devices.clear();

        let dev = self.rm.acquire_device(&config)?;
        dev.set_attributes(&config)?;
        dev.open()?;
        self.devices.push(Arc::clone(&dev));

        if let Err(e) = first.setup_session_device(&config) {
            error!(device = ?dev_id, error = %e, "session device setup failed");
            self.devices.pop();
            let _ = dev.close();
            return Err(e);
        }

        if running {
            self.rm.register_device(dev.id());
            if let Err(e) = dev.start() {
                error!(device = ?dev_id, error = %e, "device start failed");
                return Err(e);
            }
        }

        if let Err(e) = first.connect_session_device(&config) {
            error!(device = ?dev_id, error = %e, "session device connect failed");
            self.devices.pop();
            let _ = dev.close();
            return Err(e);
        }
        Ok(())
    }

    /// Build the detection notification and queue it for delivery once the
    /// stream lock is released.
    pub(crate) fn notify_client(&mut self) -> Result<()> {
        let config = self
            .rec_cfg
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("no recognition config for notification"))?;
        if self.sound_model_cfg.as_ref().map(|m| m.kind) != Some(SoundModelKind::Keyphrase) {
            debug!("non-keyphrase model, skipping notification");
            return Ok(());
        }
        let first = self
            .first_stage
            .as_ref()
            .ok_or_else(|| Error::not_found("no first-stage engine for notification"))?;
        let det_info = first
            .detection_event_info()
            .ok_or_else(|| Error::invalid_argument("detection info not available"))?;
        let indices = self.reader.as_ref().map(|r| r.indices()).unwrap_or((0, 0));

        let event = build_detection_event(config, self.engines.len(), &det_info, indices);
        self.pending_notifications.push(event);
        Ok(())
    }

    pub(crate) fn post_delayed_stop(&mut self) {
        debug!("arming delayed stop");
        self.pending_stop = true;
        self.timer.post();
    }

    pub(crate) fn cancel_delayed_stop(&mut self) {
        debug!("cancelling delayed stop");
        self.pending_stop = false;
        self.timer.cancel();
    }

    pub(crate) fn transit_to(&mut self, next: StState) {
        let from = self.state;
        if from == StState::Buffering || next == StState::Buffering {
            self.detection_state = 0;
        }
        self.prev_state = Some(from);
        self.state = next;
        info!(from = %from, to = %next, "state transition");
    }
}
