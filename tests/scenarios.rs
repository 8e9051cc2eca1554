//! End-to-end scenarios over the stream state machine, driven through mock
//! engines, devices and resource manager.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use wakegate::{
    BufferReader, CaptureDevice, CaptureProfile, ConcurrentStreamType, DetectionEventInfo,
    DetectionKind, DeviceConfig, DeviceId, Engine, EngineFactory, Error, InputMode, InstanceId,
    KeyphraseStream, MediaConfig, ModelInfo, OperatingMode, PhraseRecognitionExtra, PlatformInfo,
    RecognitionConfig, ResourceManager, Result, SoundModel, SoundModelKind, StState, StageId,
    StreamAttributes, StreamDirection,
};

// --- mocks ---

struct MockReader {
    resets: Arc<AtomicU32>,
}

impl BufferReader for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        buf.fill(0x5A);
        Ok(buf.len())
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn indices(&self) -> (u32, u32) {
        (320, 32_320)
    }
}

#[derive(Default)]
struct MockEngine {
    loads: AtomicU32,
    unloads: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
    restarts: AtomicU32,
    buffering_stops: AtomicU32,
    detected_notifies: AtomicU32,
    fail_start: AtomicBool,
    capture_requested: AtomicBool,
    buf_config: Mutex<Option<(u32, u32)>>,
    buffer_size: Mutex<Option<usize>>,
    conf_levels: Mutex<Vec<u8>>,
    reader_resets: Arc<AtomicU32>,
}

impl Engine for MockEngine {
    fn load_sound_model(&self, data: &[u8]) -> Result<()> {
        assert!(!data.is_empty());
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unload_sound_model(&self) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start_recognition(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::io("mock engine refuses to start"));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restart_recognition(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_recognition(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_buffering(&self) -> Result<()> {
        self.buffering_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_detected(&self, detected: bool) {
        if detected {
            self.detected_notifies.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn update_conf_levels(&self, levels: &[u8]) -> Result<()> {
        *self.conf_levels.lock() = levels.to_vec();
        Ok(())
    }

    fn update_buf_config(&self, hist_duration_ms: u32, pre_roll_ms: u32) -> Result<()> {
        *self.buf_config.lock() = Some((hist_duration_ms, pre_roll_ms));
        Ok(())
    }

    fn set_capture_requested(&self, requested: bool) {
        self.capture_requested.store(requested, Ordering::SeqCst);
    }

    fn create_buffer(&self, size: usize, num_readers: usize) -> Result<Vec<Box<dyn BufferReader>>> {
        *self.buffer_size.lock() = Some(size);
        Ok((0..num_readers)
            .map(|_| {
                Box::new(MockReader {
                    resets: Arc::clone(&self.reader_resets),
                }) as Box<dyn BufferReader>
            })
            .collect())
    }

    fn set_buffer_reader(&self, _reader: Box<dyn BufferReader>) -> Result<()> {
        Ok(())
    }

    fn detection_event_info(&self) -> Option<DetectionEventInfo> {
        Some(DetectionEventInfo {
            confidence_levels: vec![87],
            timestamp_lsw: 0x1000,
            timestamp_msw: 0,
        })
    }

    fn get_parameters(&self, param_id: u32) -> Result<Vec<u8>> {
        Ok(param_id.to_le_bytes().to_vec())
    }

    fn set_ec_ref(&self, _device: DeviceId, _enable: bool) -> Result<()> {
        Ok(())
    }

    fn setup_session_device(&self, _config: &DeviceConfig) -> Result<()> {
        Ok(())
    }

    fn connect_session_device(&self, _config: &DeviceConfig) -> Result<()> {
        Ok(())
    }

    fn disconnect_session_device(&self, _config: &DeviceConfig) {}

    fn setup_duration_ms(&self) -> u32 {
        12
    }
}

#[derive(Default)]
struct MockFactory {
    engines: Mutex<Vec<(StageId, Arc<MockEngine>)>>,
}

impl MockFactory {
    fn engine(&self, stage: StageId) -> Option<Arc<MockEngine>> {
        self.engines
            .lock()
            .iter()
            .rev()
            .find(|(s, _)| *s == stage)
            .map(|(_, e)| Arc::clone(e))
    }

    fn created(&self) -> usize {
        self.engines.lock().len()
    }
}

impl EngineFactory for MockFactory {
    fn create(&self, stage: StageId) -> Result<Arc<dyn Engine>> {
        let engine = Arc::new(MockEngine::default());
        self.engines.lock().push((stage, Arc::clone(&engine)));
        Ok(engine)
    }
}

struct MockDevice {
    id: DeviceId,
    opens: AtomicU32,
    closes: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
}

impl CaptureDevice for MockDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_attributes(&self, _config: &DeviceConfig) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockRm {
    lpi_supported: AtomicBool,
    capture_concurrency: AtomicBool,
    voice_call_concurrency: AtomicBool,
    voip_concurrency: AtomicBool,
    active_non_lpi: AtomicBool,
    forced_transit: AtomicBool,
    headset_available: AtomicBool,
    charging: AtomicBool,
    composite: Mutex<Option<CaptureProfile>>,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    registered_devices: Mutex<Vec<DeviceId>>,
    instances: AtomicU32,
    instance_resets: AtomicU32,
    stream_registrations: AtomicU32,
    stream_deregistrations: AtomicU32,
    other_stops: AtomicU32,
    other_starts: AtomicU32,
}

impl MockRm {
    fn last_device(&self) -> Option<Arc<MockDevice>> {
        self.devices.lock().last().cloned()
    }

    fn registered_device_count(&self) -> usize {
        self.registered_devices.lock().len()
    }
}

impl ResourceManager for MockRm {
    fn register_stream(&self) {
        self.stream_registrations.fetch_add(1, Ordering::SeqCst);
    }

    fn deregister_stream(&self) {
        self.stream_deregistrations.fetch_add(1, Ordering::SeqCst);
    }

    fn charging_state(&self) -> bool {
        self.charging.load(Ordering::SeqCst)
    }

    fn is_voice_ui_lpi_supported(&self) -> bool {
        self.lpi_supported.load(Ordering::SeqCst)
    }

    fn is_audio_capture_concurrency_supported(&self) -> bool {
        self.capture_concurrency.load(Ordering::SeqCst)
    }

    fn is_voice_call_concurrency_supported(&self) -> bool {
        self.voice_call_concurrency.load(Ordering::SeqCst)
    }

    fn is_voip_concurrency_supported(&self) -> bool {
        self.voip_concurrency.load(Ordering::SeqCst)
    }

    fn has_active_non_lpi_stream(&self) -> bool {
        self.active_non_lpi.load(Ordering::SeqCst)
    }

    fn forced_transit_to_non_lpi(&self) -> bool {
        self.forced_transit.load(Ordering::SeqCst)
    }

    fn is_device_available(&self, id: DeviceId) -> bool {
        id == DeviceId::WiredHeadset && self.headset_available.load(Ordering::SeqCst)
    }

    fn acquire_device(&self, config: &DeviceConfig) -> Result<Arc<dyn CaptureDevice>> {
        let dev = Arc::new(MockDevice {
            id: config.id,
            opens: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        });
        self.devices.lock().push(Arc::clone(&dev));
        Ok(dev)
    }

    fn register_device(&self, id: DeviceId) {
        self.registered_devices.lock().push(id);
    }

    fn deregister_device(&self, id: DeviceId) {
        let mut regs = self.registered_devices.lock();
        if let Some(pos) = regs.iter().position(|&d| d == id) {
            regs.remove(pos);
        }
    }

    fn update_capture_profile(&self, _instance: InstanceId, _active: bool) -> bool {
        false
    }

    fn capture_profile(&self) -> Option<CaptureProfile> {
        self.composite.lock().clone()
    }

    fn stop_other_streams(&self, _instance: InstanceId) -> Result<()> {
        self.other_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start_other_streams(&self, _instance: InstanceId) -> Result<()> {
        self.other_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stream_instance_id(&self, _kv: (u32, u32)) -> InstanceId {
        self.instances.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reset_stream_instance_id(&self, _instance: InstanceId, _kv: (u32, u32)) {
        self.instance_resets.fetch_add(1, Ordering::SeqCst);
    }
}

// --- fixtures ---

fn profile(name: &str, device: DeviceId) -> CaptureProfile {
    CaptureProfile {
        name: name.to_string(),
        device_id: device,
        channels: 1,
        sample_rate: 16_000,
        bit_width: 16,
        snd_name: format!("va-{name}"),
        device_pp_kv: vec![(10, 1)],
    }
}

struct World {
    rm: Arc<MockRm>,
    platform: Arc<PlatformInfo>,
    factory: Arc<MockFactory>,
    uuid: Uuid,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wakegate=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

fn world() -> World {
    init_tracing();
    let uuid = Uuid::new_v4();
    let profiles = vec![
        ((OperatingMode::LowPower, InputMode::Handset), profile("lpi-handset", DeviceId::HandsetVaMic)),
        ((OperatingMode::HighPerf, InputMode::Handset), profile("nlpi-handset", DeviceId::HandsetVaMic)),
        (
            (OperatingMode::HighPerfAndCharging, InputMode::Handset),
            profile("charging-handset", DeviceId::HandsetVaMic),
        ),
        ((OperatingMode::LowPower, InputMode::Headset), profile("lpi-headset", DeviceId::HeadsetVaMic)),
        ((OperatingMode::HighPerf, InputMode::Headset), profile("nlpi-headset", DeviceId::HeadsetVaMic)),
    ];
    let info = ModelInfo::new(
        uuid,
        2_000,
        1_000,
        MediaConfig::detection_default(),
        (7, 1),
        profiles,
    );

    let rm = Arc::new(MockRm::default());
    rm.lpi_supported.store(true, Ordering::SeqCst);
    *rm.composite.lock() = Some(profile("lpi-handset", DeviceId::HandsetVaMic));

    World {
        rm,
        platform: Arc::new(PlatformInfo::new(true, vec![info])),
        factory: Arc::new(MockFactory::default()),
        uuid,
    }
}

fn new_stream(w: &World) -> KeyphraseStream {
    KeyphraseStream::new(
        StreamAttributes {
            direction: StreamDirection::Input,
            media: MediaConfig::detection_default(),
        },
        Arc::clone(&w.rm) as Arc<dyn ResourceManager>,
        Arc::clone(&w.platform),
        Arc::clone(&w.factory) as Arc<dyn EngineFactory>,
    )
    .expect("stream creation")
}

fn v2_model(uuid: Uuid) -> SoundModel {
    SoundModel {
        kind: SoundModelKind::Keyphrase,
        vendor_uuid: uuid,
        num_phrases: 1,
        data: vec![0xAB; 64],
    }
}

/// v3 container: one GMM and one keyword-verifier sub-model.
fn v3_model(uuid: Uuid) -> SoundModel {
    let gmm = [1u8; 24];
    let cnn = [2u8; 12];
    let mut data = Vec::new();
    data.extend_from_slice(&wakegate::model::GLOBAL_HEADER_MAGIC.to_le_bytes());
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&2u32.to_le_bytes());
    for (stage, payload, offset) in [
        (StageId::Gmm.raw(), gmm.as_slice(), 0u32),
        (StageId::KeywordVerifier.raw(), cnn.as_slice(), gmm.len() as u32),
    ] {
        data.extend_from_slice(&stage.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&offset.to_le_bytes());
    }
    data.extend_from_slice(&gmm);
    data.extend_from_slice(&cnn);

    SoundModel {
        kind: SoundModelKind::Keyphrase,
        vendor_uuid: uuid,
        num_phrases: 1,
        data,
    }
}

fn bare_config(capture_requested: bool) -> RecognitionConfig {
    RecognitionConfig {
        capture_requested,
        phrases: vec![PhraseRecognitionExtra {
            id: 1,
            recognition_modes: 1,
            confidence_level: 60,
            levels: vec![],
        }],
        opaque: vec![],
    }
}

fn count_callback(stream: &KeyphraseStream) -> Arc<AtomicU32> {
    let fired = Arc::new(AtomicU32::new(0));
    let fired_cb = Arc::clone(&fired);
    stream.register_callback(Arc::new(move |event| {
        assert_eq!(event.media_config, MediaConfig::detection_default());
        fired_cb.fetch_add(1, Ordering::SeqCst);
    }));
    fired
}

fn wait_for(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}

// --- scenarios ---

#[test]
fn load_start_detect_then_deferred_stop() {
    let w = world();
    let stream = new_stream(&w);
    let fired = count_callback(&stream);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    assert_eq!(stream.state(), StState::Loaded);

    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();
    assert_eq!(stream.state(), StState::Active);
    assert_eq!(w.rm.registered_device_count(), 1);

    stream
        .set_engine_detection_state(DetectionKind::GmmDetected)
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(stream.state(), StState::Detected);

    // With no further client activity the deferred stop lands after 1 s.
    assert!(wait_for(Duration::from_millis(2_500), || stream.state()
        == StState::Loaded));
    assert_eq!(w.rm.registered_device_count(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn restart_cancels_deferred_stop() {
    let w = world();
    let stream = new_stream(&w);
    let fired = count_callback(&stream);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();
    stream
        .set_engine_detection_state(DetectionKind::GmmDetected)
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    stream.start().unwrap();
    assert_eq!(stream.state(), StState::Active);

    let gmm = w.factory.engine(StageId::Gmm).unwrap();
    assert_eq!(gmm.restarts.load(Ordering::SeqCst), 1);

    // The cancelled timer must not demote the stream afterwards.
    std::thread::sleep(Duration::from_millis(1_300));
    assert_eq!(stream.state(), StState::Active);
}

#[test]
fn two_stage_confirmation_notifies_once() {
    let w = world();
    let stream = new_stream(&w);
    let fired = count_callback(&stream);

    stream.load_sound_model(v3_model(w.uuid)).unwrap();
    assert_eq!(w.factory.created(), 2);

    stream.send_recognition_config(bare_config(true)).unwrap();
    stream.start().unwrap();

    stream
        .set_engine_detection_state(DetectionKind::GmmDetected)
        .unwrap();
    assert_eq!(stream.state(), StState::Buffering);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let cnn = w.factory.engine(StageId::KeywordVerifier).unwrap();
    assert_eq!(cnn.detected_notifies.load(Ordering::SeqCst), 1);

    stream
        .set_engine_detection_state(DetectionKind::CnnDetected)
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(stream.state(), StState::Buffering);

    // Capture was requested, so the keyword audio is readable.
    let mut buf = [0u8; 256];
    let read = stream.read(&mut buf).unwrap();
    assert_eq!(read, 256);
    assert_eq!(buf[0], 0x5A);
}

#[test]
fn two_stage_rejection_rearms_silently() {
    let w = world();
    let stream = new_stream(&w);
    let fired = count_callback(&stream);

    stream.load_sound_model(v3_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(true)).unwrap();
    stream.start().unwrap();
    stream
        .set_engine_detection_state(DetectionKind::GmmDetected)
        .unwrap();
    stream
        .set_engine_detection_state(DetectionKind::CnnRejected)
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(stream.state(), StState::Active);

    let gmm = w.factory.engine(StageId::Gmm).unwrap();
    let cnn = w.factory.engine(StageId::KeywordVerifier).unwrap();
    assert_eq!(gmm.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(cnn.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(gmm.buffering_stops.load(Ordering::SeqCst), 1);
}

#[test]
fn profile_change_under_concurrency_rebuilds() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();
    assert_eq!(stream.state(), StState::Active);

    let first_gmm = w.factory.engine(StageId::Gmm).unwrap();
    assert_eq!(first_gmm.loads.load(Ordering::SeqCst), 1);

    // A non-LPI output stream activates: derived profile flips from
    // low-power to high-perf, forcing stop/unload/reload/start.
    w.rm.active_non_lpi.store(true, Ordering::SeqCst);
    stream
        .concurrent_stream_status(ConcurrentStreamType::LowLatency, StreamDirection::Output, true)
        .unwrap();

    assert_eq!(stream.state(), StState::Active);
    // Reload created a fresh first-stage engine.
    assert_eq!(w.factory.created(), 2);
    assert_eq!(first_gmm.unloads.load(Ordering::SeqCst), 1);

    // Same event again with no derivation change: a no-op.
    stream
        .concurrent_stream_status(ConcurrentStreamType::LowLatency, StreamDirection::Output, true)
        .unwrap();
    assert_eq!(w.factory.created(), 2);
    assert_eq!(stream.state(), StState::Active);
}

#[test]
fn ssr_during_buffering_restores_loaded() {
    let w = world();
    let stream = new_stream(&w);
    let fired = count_callback(&stream);

    stream.load_sound_model(v3_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(true)).unwrap();
    stream.start().unwrap();
    stream
        .set_engine_detection_state(DetectionKind::GmmDetected)
        .unwrap();
    assert_eq!(stream.state(), StState::Buffering);

    stream.ssr_down().unwrap();
    assert_eq!(stream.state(), StState::Ssr);

    stream.ssr_up().unwrap();
    assert_eq!(stream.state(), StState::Loaded);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // Buffered audio did not survive the restart.
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap_err().errno(), -5);
}

#[test]
fn ssr_from_active_restores_recognition() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();

    stream.ssr_down().unwrap();
    assert_eq!(stream.state(), StState::Ssr);
    assert_eq!(w.rm.registered_device_count(), 0);

    stream.ssr_up().unwrap();
    assert_eq!(stream.state(), StState::Active);
    assert_eq!(w.rm.registered_device_count(), 1);

    // The replayed load created a second first-stage engine and started it.
    assert_eq!(w.factory.created(), 2);
    let replayed = w.factory.engine(StageId::Gmm).unwrap();
    assert_eq!(replayed.starts.load(Ordering::SeqCst), 1);
}

// --- round trips ---

#[test]
fn load_unload_round_trip_leaves_idle() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    let gmm = w.factory.engine(StageId::Gmm).unwrap();

    stream.close().unwrap();
    assert_eq!(stream.state(), StState::Idle);
    assert_eq!(gmm.unloads.load(Ordering::SeqCst), 1);
    assert_eq!(w.rm.instance_resets.load(Ordering::SeqCst), 1);

    let dev = w.rm.last_device().unwrap();
    assert_eq!(dev.opens.load(Ordering::SeqCst), 1);
    assert_eq!(dev.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn start_stop_round_trip_returns_to_loaded() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();
    assert_eq!(w.rm.registered_device_count(), 1);

    stream.stop().unwrap();
    assert_eq!(stream.state(), StState::Loaded);
    assert_eq!(w.rm.registered_device_count(), 0);

    let dev = w.rm.last_device().unwrap();
    assert_eq!(dev.starts.load(Ordering::SeqCst), 1);
    assert_eq!(dev.stops.load(Ordering::SeqCst), 1);

    let gmm = w.factory.engine(StageId::Gmm).unwrap();
    assert_eq!(gmm.starts.load(Ordering::SeqCst), 1);
    assert_eq!(gmm.stops.load(Ordering::SeqCst), 1);
}

#[test]
fn detected_start_detected_is_idempotent() {
    let w = world();
    let stream = new_stream(&w);
    let fired = count_callback(&stream);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();

    for round in 1..=2 {
        stream
            .set_engine_detection_state(DetectionKind::GmmDetected)
            .unwrap();
        assert_eq!(stream.state(), StState::Detected);
        assert_eq!(fired.load(Ordering::SeqCst), round);
        stream.start().unwrap();
        assert_eq!(stream.state(), StState::Active);
    }

    std::thread::sleep(Duration::from_millis(1_300));
    assert_eq!(stream.state(), StState::Active);
}

// --- table rows and plumbing ---

#[test]
fn read_outside_buffering_fails_eio() {
    let w = world();
    let stream = new_stream(&w);
    let mut buf = [0u8; 8];

    assert_eq!(stream.read(&mut buf).unwrap_err().errno(), -5);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    assert_eq!(stream.read(&mut buf).unwrap_err().errno(), -5);

    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();
    assert_eq!(stream.read(&mut buf).unwrap_err().errno(), -5);
}

#[test]
fn start_without_config_is_invalid() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    let err = stream.start().unwrap_err();
    assert_eq!(err.errno(), -22);
    assert_eq!(stream.state(), StState::Loaded);
}

#[test]
fn engine_start_failure_rolls_back_to_loaded() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();

    let gmm = w.factory.engine(StageId::Gmm).unwrap();
    gmm.fail_start.store(true, Ordering::SeqCst);

    assert!(matches!(stream.start(), Err(Error::Transient(_))));
    assert_eq!(stream.state(), StState::Loaded);
    assert_eq!(w.rm.registered_device_count(), 0);

    let dev = w.rm.last_device().unwrap();
    assert_eq!(dev.stops.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_vendor_uuid_fails_load() {
    let w = world();
    let stream = new_stream(&w);

    let err = stream.load_sound_model(v2_model(Uuid::new_v4())).unwrap_err();
    assert_eq!(err.errno(), -22);
    assert_eq!(stream.state(), StState::Idle);
}

#[test]
fn capture_concurrency_pauses_and_resumes() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();

    // Generic capture concurrency unsupported: a raw record stream pauses us.
    stream
        .concurrent_stream_status(ConcurrentStreamType::Raw, StreamDirection::Input, true)
        .unwrap();
    assert_eq!(stream.state(), StState::Loaded);

    // A second concurrent stream changes nothing.
    stream
        .concurrent_stream_status(ConcurrentStreamType::VoipTx, StreamDirection::Input, true)
        .unwrap();
    assert_eq!(stream.state(), StState::Loaded);

    stream
        .concurrent_stream_status(ConcurrentStreamType::VoipTx, StreamDirection::Input, false)
        .unwrap();
    assert_eq!(stream.state(), StState::Loaded);

    // Last departure resumes recognition.
    stream
        .concurrent_stream_status(ConcurrentStreamType::Raw, StreamDirection::Input, false)
        .unwrap();
    assert_eq!(stream.state(), StState::Active);
}

#[test]
fn external_stop_pauses_through_pump() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();

    stream.external_stop();
    assert!(wait_for(Duration::from_millis(1_000), || stream.state()
        == StState::Loaded));

    stream.external_start();
    assert!(wait_for(Duration::from_millis(1_000), || stream.state()
        == StState::Active));
}

#[test]
fn stop_buffering_arms_deferred_stop() {
    let w = world();
    let stream = new_stream(&w);
    let fired = count_callback(&stream);

    stream.load_sound_model(v3_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(true)).unwrap();
    stream.start().unwrap();
    stream
        .set_engine_detection_state(DetectionKind::GmmDetected)
        .unwrap();
    stream
        .set_engine_detection_state(DetectionKind::CnnDetected)
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(stream.state(), StState::Buffering);

    stream.stop_buffering().unwrap();
    assert_eq!(stream.state(), StState::Buffering);

    assert!(wait_for(Duration::from_millis(2_500), || stream.state()
        == StState::Loaded));
}

#[test]
fn ring_buffer_sized_from_history_and_read_delay() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();

    let gmm = w.factory.engine(StageId::Gmm).unwrap();
    // (2000 ms history + 0 pre-roll + 1000 ms read delay) at 16 kHz/16-bit/mono.
    assert_eq!(*gmm.buffer_size.lock(), Some(3 * 16_000 * 16 / 8));
    assert_eq!(*gmm.buf_config.lock(), Some((2_000, 0)));
    assert_eq!(*gmm.conf_levels.lock(), vec![60]);
    // Single engine, no client capture request.
    assert!(!gmm.capture_requested.load(Ordering::SeqCst));
}

#[test]
fn second_stage_forces_capture_flag() {
    let w = world();
    let stream = new_stream(&w);

    stream.load_sound_model(v3_model(w.uuid)).unwrap();
    stream.send_recognition_config(bare_config(false)).unwrap();

    let gmm = w.factory.engine(StageId::Gmm).unwrap();
    assert!(gmm.capture_requested.load(Ordering::SeqCst));
}

#[test]
fn get_parameters_requires_first_stage() {
    let w = world();
    let stream = new_stream(&w);

    assert_eq!(stream.get_parameters(9).unwrap_err().errno(), -22);

    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    assert_eq!(stream.get_parameters(9).unwrap(), 9u32.to_le_bytes().to_vec());
}

#[test]
fn ssr_cache_updates_follow_saved_state() {
    let w = world();
    let stream = new_stream(&w);

    stream.ssr_down().unwrap();
    assert_eq!(stream.state(), StState::Ssr);

    // Saved state is Idle: a load updates only the cache.
    stream.load_sound_model(v2_model(w.uuid)).unwrap();
    assert_eq!(w.factory.created(), 0);

    // Start before a recognition config exists is rejected.
    assert!(stream.start().is_err());

    stream.send_recognition_config(bare_config(false)).unwrap();
    stream.start().unwrap();

    stream.ssr_up().unwrap();
    assert_eq!(stream.state(), StState::Active);
    assert_eq!(w.factory.created(), 1);
}

#[test]
fn stream_registration_lifecycle() {
    let w = world();
    {
        let stream = new_stream(&w);
        assert_eq!(w.rm.stream_registrations.load(Ordering::SeqCst), 1);
        drop(stream);
    }
    assert_eq!(w.rm.stream_deregistrations.load(Ordering::SeqCst), 1);
}
