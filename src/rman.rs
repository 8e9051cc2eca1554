//! Resource-manager contract consumed by the stream: device registry,
//! concurrency policy, composite capture-profile bookkeeping, and instance
//! ids. Implemented by the embedding process; mocked in tests.

use std::sync::Arc;

use crate::device::{CaptureDevice, DeviceConfig, DeviceId};
use crate::error::Result;
use crate::platform::CaptureProfile;

/// Instance id assigned to a loaded stream by the resource manager.
pub type InstanceId = u32;

pub trait ResourceManager: Send + Sync {
    /// A stream announces itself on construction and departure on drop.
    fn register_stream(&self);
    fn deregister_stream(&self);

    fn charging_state(&self) -> bool;

    fn is_voice_ui_lpi_supported(&self) -> bool;
    fn is_audio_capture_concurrency_supported(&self) -> bool;
    fn is_voice_call_concurrency_supported(&self) -> bool;
    fn is_voip_concurrency_supported(&self) -> bool;

    /// Any active concurrent stream that forces the non-LPI path?
    fn has_active_non_lpi_stream(&self) -> bool;
    /// Platform forcing a transit to the non-LPI path (e.g. charger attached)?
    fn forced_transit_to_non_lpi(&self) -> bool;

    fn is_device_available(&self, id: DeviceId) -> bool;

    /// Fetch a device from the shared registry. The registry retains
    /// ownership; the stream keeps only this handle.
    fn acquire_device(&self, config: &DeviceConfig) -> Result<Arc<dyn CaptureDevice>>;

    /// Reference-counted device activity registration.
    fn register_device(&self, id: DeviceId);
    fn deregister_device(&self, id: DeviceId);

    /// Recompute the composite capture profile across all voice-activation
    /// streams with this stream counted as `active`. Returns true when the
    /// composite changed and backends must realign.
    fn update_capture_profile(&self, instance: InstanceId, active: bool) -> bool;
    /// The current composite capture profile, if any stream contributes one.
    fn capture_profile(&self) -> Option<CaptureProfile>;

    /// Stop / start every other voice-activation stream so their backends
    /// pick up a changed composite profile.
    fn stop_other_streams(&self, instance: InstanceId) -> Result<()>;
    fn start_other_streams(&self, instance: InstanceId) -> Result<()>;

    fn stream_instance_id(&self, stream_config_kv: (u32, u32)) -> InstanceId;
    fn reset_stream_instance_id(&self, instance: InstanceId, stream_config_kv: (u32, u32));
}
