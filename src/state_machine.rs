//! Per-state event handlers. Dispatch is `controller.handle(state, event)`:
//! the state is a plain enum and every handler is a method on the stream
//! internals, so no state object ever holds a reference back to the stream.
//!
//! An event not listed for a state is a successful no-op; only reads
//! outside Buffering fail (see `process_read`).

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{DetectionKind, Event, SECOND_STAGE_DETECTED_MASK};
use crate::stream::StreamInner;

/// The six states a stream moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StState {
    Idle,
    Loaded,
    Active,
    Detected,
    Buffering,
    Ssr,
}

impl std::fmt::Display for StState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StState::Idle => write!(f, "Idle"),
            StState::Loaded => write!(f, "Loaded"),
            StState::Active => write!(f, "Active"),
            StState::Detected => write!(f, "Detected"),
            StState::Buffering => write!(f, "Buffering"),
            StState::Ssr => write!(f, "Ssr"),
        }
    }
}

impl StreamInner {
    /// Route an event to the current state's handler.
    pub(crate) fn process_event(&mut self, event: &Event) -> Result<()> {
        debug!(state = %self.state, event = event.name(), "handling event");
        match self.state {
            StState::Idle => self.handle_idle(event),
            StState::Loaded => self.handle_loaded(event),
            StState::Active => self.handle_active(event),
            StState::Detected => self.handle_detected(event),
            StState::Buffering => self.handle_buffering(event),
            StState::Ssr => self.handle_ssr(event),
        }
    }

    /// Pump entry: only externally-posted kinds are accepted here.
    pub(crate) fn process_external(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::DeviceConnected(_)
            | Event::DeviceDisconnected(_)
            | Event::ChargingState(_)
            | Event::Pause
            | Event::Resume => self.process_event(event),
            _ => {
                error!(event = event.name(), "unsupported queued event");
                Ok(())
            }
        }
    }

    /// Client read path. Only Buffering serves data; everywhere else the
    /// read fails with an I/O error.
    pub(crate) fn process_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.state {
            StState::Buffering => {
                let reader = self
                    .reader
                    .as_mut()
                    .ok_or_else(|| Error::invalid_argument("no reader exists"))?;
                reader.read(buf)
            }
            _ => Err(Error::io("read outside buffering")),
        }
    }

    // --- Idle ---

    fn handle_idle(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::LoadSoundModel(model) => {
                self.load_locked(model)?;
                self.transit_to(StState::Loaded);
                Ok(())
            }
            Event::Pause => {
                self.paused = true;
                Ok(())
            }
            Event::Resume => {
                self.paused = false;
                Ok(())
            }
            Event::DeviceConnected(dev_id) => {
                let config = self.device_config_for(*dev_id)?;
                let dev = self.rm.acquire_device(&config)?;
                dev.set_attributes(&config)?;
                self.devices.clear();
                self.devices.push(dev);
                Ok(())
            }
            Event::DeviceDisconnected(_) => {
                let dev_id = self.avail_capture_device();
                let config = self.device_config_for(dev_id)?;
                let dev = self.rm.acquire_device(&config)?;
                dev.set_attributes(&config)?;
                self.devices.clear();
                self.devices.push(dev);
                Ok(())
            }
            Event::SsrOffline => {
                if self.state_for_restore.is_none() {
                    self.state_for_restore = Some(StState::Idle);
                }
                self.transit_to(StState::Ssr);
                Ok(())
            }
            _ => {
                debug!(event = event.name(), "unhandled in Idle");
                Ok(())
            }
        }
    }

    // --- Loaded ---

    fn handle_loaded(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::UnloadSoundModel => {
                let status = self.unload_locked();
                self.transit_to(StState::Idle);
                status
            }
            Event::RecognitionConfig(config) => self.send_recognition_config_locked(config),
            Event::Resume => {
                if !self.paused {
                    // Client stopped recognition during active concurrency.
                    return Ok(());
                }
                self.paused = false;
                self.try_start_from_loaded(false)
            }
            Event::StartRecognition { restart } => {
                if self.paused {
                    debug!("concurrency active, start deferred to resume");
                    return Ok(());
                }
                self.try_start_from_loaded(*restart)
            }
            Event::Pause => {
                self.paused = true;
                Ok(())
            }
            Event::StopRecognition { .. } => {
                // Stop while only loaded: clear paused so an inactive
                // concurrency cannot restart us later.
                self.paused = false;
                Ok(())
            }
            Event::DeviceConnected(dev_id) => self.reconfigure_device_locked(*dev_id, false),
            Event::DeviceDisconnected(_) => {
                let dev_id = self.avail_capture_device();
                self.reconfigure_device_locked(dev_id, false)
            }
            Event::ConcurrentStream { .. } | Event::ChargingState(_) => {
                self.rebuild_on_profile_change(false)
            }
            Event::SsrOffline => {
                if self.state_for_restore.is_none() {
                    self.state_for_restore = Some(StState::Loaded);
                }
                if let Err(e) = self.process_event(&Event::UnloadSoundModel) {
                    error!(error = %e, "unload on ssr failed");
                }
                self.transit_to(StState::Ssr);
                Ok(())
            }
            _ => {
                debug!(event = event.name(), "unhandled in Loaded");
                Ok(())
            }
        }
    }

    fn try_start_from_loaded(&mut self, restart: bool) -> Result<()> {
        debug!(restart, "starting recognition");
        self.start_recognition_locked(restart)?;
        self.transit_to(StState::Active);
        Ok(())
    }

    /// Re-derive the capture profile after a concurrency or charging
    /// change. A changed profile forces unload/reload (and, when running,
    /// stop/start) so the backend realigns; an unchanged one is a no-op.
    fn rebuild_on_profile_change(&mut self, running: bool) -> Result<()> {
        let new_profile = self.current_capture_profile()?;
        if self.cap_profile.as_ref() == Some(&new_profile) {
            info!("no action needed, same capture profile");
            return Ok(());
        }
        info!(
            old = self.cap_profile.as_ref().map(|p| p.name.as_str()).unwrap_or("-"),
            new = %new_profile.name,
            "capture profile changed, rebuilding"
        );

        if running {
            self.process_event(&Event::StopRecognition { deferred: false })?;
        }
        self.process_event(&Event::UnloadSoundModel)?;

        let model = self
            .sound_model_cfg
            .clone()
            .ok_or_else(|| Error::not_found("no cached sound model for rebuild"))?;
        self.process_event(&Event::LoadSoundModel(model))?;

        if let Some(config) = self.rec_cfg.clone() {
            self.send_recognition_config_locked(&config)?;
        }
        if running {
            self.process_event(&Event::StartRecognition { restart: false })?;
        }
        Ok(())
    }

    // --- Active ---

    fn handle_active(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::Detected(kind) => {
                if *kind != DetectionKind::GmmDetected {
                    return Ok(());
                }
                let capture = self
                    .rec_cfg
                    .as_ref()
                    .map(|c| c.capture_requested)
                    .unwrap_or(false);
                if !capture && self.engines.len() == 1 {
                    self.transit_to(StState::Detected);
                    self.post_delayed_stop();
                } else {
                    self.transit_to(StState::Buffering);
                    self.set_detected_to_engines(true);
                }
                if self.engines.len() == 1 {
                    self.notify_client()?;
                }
                Ok(())
            }
            Event::Pause => {
                self.paused = true;
                self.stop_recognition_locked(true);
                self.transit_to(StState::Loaded);
                Ok(())
            }
            Event::StopRecognition { .. } => {
                self.stop_recognition_locked(self.paused);
                self.transit_to(StState::Loaded);
                Ok(())
            }
            Event::EcRef { device, enable } => {
                let first = self
                    .first_stage
                    .as_ref()
                    .ok_or_else(|| Error::not_found("no first-stage engine"))?;
                if let Err(e) = first.set_ec_ref(*device, *enable) {
                    error!(error = %e, "failed to set ec ref on first stage");
                    return Err(e);
                }
                Ok(())
            }
            Event::DeviceConnected(dev_id) => self.reconfigure_device_locked(*dev_id, true),
            Event::DeviceDisconnected(_) => {
                let dev_id = self.avail_capture_device();
                self.reconfigure_device_locked(dev_id, true)
            }
            Event::ConcurrentStream { .. } | Event::ChargingState(_) => {
                self.rebuild_on_profile_change(true)
            }
            Event::SsrOffline => {
                if self.state_for_restore.is_none() {
                    self.state_for_restore = Some(StState::Active);
                }
                if let Err(e) = self.process_event(&Event::StopRecognition { deferred: false }) {
                    error!(error = %e, "stop on ssr failed");
                }
                if let Err(e) = self.process_event(&Event::UnloadSoundModel) {
                    error!(error = %e, "unload on ssr failed");
                }
                self.transit_to(StState::Ssr);
                Ok(())
            }
            _ => {
                debug!(event = event.name(), "unhandled in Active");
                Ok(())
            }
        }
    }

    // --- Detected ---

    fn handle_detected(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::StartRecognition { restart } => {
                // Client rearms without a config change.
                debug!(restart, "restart after detection");
                self.cancel_delayed_stop();
                let status = self.restart_engines();
                if status.is_ok() {
                    self.transit_to(StState::Active);
                } else {
                    self.transit_to(StState::Loaded);
                }
                status
            }
            Event::Pause => {
                self.cancel_delayed_stop();
                self.paused = true;
                self.stop_recognition_locked(false);
                self.transit_to(StState::Loaded);
                Ok(())
            }
            Event::StopRecognition { .. } => {
                self.cancel_delayed_stop();
                self.stop_recognition_locked(false);
                self.transit_to(StState::Loaded);
                Ok(())
            }
            Event::RecognitionConfig(_) => {
                // New config for the next cycle; Start will rearm from
                // Loaded after the config is applied there.
                self.cancel_delayed_stop();
                self.stop_recognition_locked(false);
                self.transit_to(StState::Loaded);
                self.process_event(event)
            }
            Event::ConcurrentStream { .. } | Event::ChargingState(_) => {
                self.cancel_delayed_stop();
                self.transit_to(StState::Active);
                self.process_event(event)
            }
            Event::Resume => {
                self.paused = false;
                Ok(())
            }
            Event::DeviceConnected(_) | Event::DeviceDisconnected(_) => {
                // The fresh device is picked up after the deferred stop.
                debug!("device change deferred while detected");
                Ok(())
            }
            Event::SsrOffline => {
                if self.state_for_restore.is_none() {
                    self.state_for_restore = Some(StState::Loaded);
                }
                if let Err(e) = self.process_event(&Event::StopRecognition { deferred: false }) {
                    error!(error = %e, "stop on ssr failed");
                }
                if let Err(e) = self.process_event(&Event::UnloadSoundModel) {
                    error!(error = %e, "unload on ssr failed");
                }
                self.transit_to(StState::Ssr);
                Ok(())
            }
            _ => {
                debug!(event = event.name(), "unhandled in Detected");
                Ok(())
            }
        }
    }

    // --- Buffering ---

    fn handle_buffering(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::StopBuffering => {
                debug!("client stopped buffering");
                self.stop_buffering_all();
                self.post_delayed_stop();
                Ok(())
            }
            Event::StartRecognition { restart } => {
                // Next recognition requested, with or without reading the
                // buffered keyword first.
                debug!(restart, "restart while buffering");
                self.cancel_delayed_stop();
                self.stop_buffering_all();
                let status = self.restart_engines();
                if status.is_ok() {
                    self.transit_to(StState::Active);
                } else {
                    self.transit_to(StState::Loaded);
                }
                status
            }
            Event::RecognitionConfig(_) => {
                self.cancel_delayed_stop();
                self.stop_buffering_all();
                self.stop_recognition_locked(false);
                self.transit_to(StState::Loaded);
                self.process_event(event)
            }
            Event::Pause => {
                self.paused = true;
                self.stop_buffering_all();
                self.cancel_delayed_stop();
                self.stop_recognition_locked(false);
                self.transit_to(StState::Loaded);
                Ok(())
            }
            Event::StopRecognition { .. } => {
                // Also reached by the deferred stop when the client never
                // rearms.
                self.cancel_delayed_stop();
                self.stop_recognition_locked(false);
                self.transit_to(StState::Loaded);
                Ok(())
            }
            Event::Detected(kind) => self.handle_second_stage_verdict(*kind),
            Event::ChargingState(_) | Event::ConcurrentStream { .. } => {
                self.cancel_delayed_stop();
                self.stop_buffering_all();
                self.transit_to(StState::Active);
                self.process_event(event)
            }
            Event::DeviceConnected(_) | Event::DeviceDisconnected(_) => {
                self.cancel_delayed_stop();
                self.stop_buffering_all();
                self.stop_recognition_locked(false);
                self.transit_to(StState::Loaded);
                self.process_event(event)
            }
            Event::SsrOffline => {
                if self.state_for_restore.is_none() {
                    self.state_for_restore = Some(StState::Loaded);
                }
                for ev in [
                    Event::StopBuffering,
                    Event::StopRecognition { deferred: false },
                    Event::UnloadSoundModel,
                ] {
                    if let Err(e) = self.process_event(&ev) {
                        error!(event = ev.name(), error = %e, "teardown on ssr failed");
                    }
                }
                self.transit_to(StState::Ssr);
                Ok(())
            }
            _ => {
                debug!(event = event.name(), "unhandled in Buffering");
                Ok(())
            }
        }
    }

    /// Second-stage verdicts land here while the keyword is being buffered.
    fn handle_second_stage_verdict(&mut self, kind: DetectionKind) -> Result<()> {
        if kind == DetectionKind::GmmDetected {
            return Ok(());
        }

        if kind.is_second_stage_rejection() {
            debug!(?kind, "second stage rejected");
            self.detection_state = 0;
            self.stop_buffering_all();
            let status = self.restart_engines();
            if status.is_ok() {
                self.transit_to(StState::Active);
            } else {
                self.transit_to(StState::Loaded);
            }
            return status;
        }

        self.detection_state |= kind.bit();
        if self.detection_state & SECOND_STAGE_DETECTED_MASK != 0 {
            debug!(?kind, "second stage confirmed");
            self.detection_state = 0;
            let capture = self
                .rec_cfg
                .as_ref()
                .map(|c| c.capture_requested)
                .unwrap_or(false);
            if !capture {
                self.stop_buffering_all();
                self.transit_to(StState::Detected);
            }
            if let Err(e) = self.notify_client() {
                warn!(error = %e, "failed to build detection notification");
            }
            if !capture {
                self.post_delayed_stop();
            }
        }
        Ok(())
    }

    // --- Ssr ---

    fn handle_ssr(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::SsrOnline => {
                self.transit_to(StState::Idle);
                let restore = self.state_for_restore;

                if matches!(restore, Some(StState::Loaded) | Some(StState::Active)) {
                    let model = self
                        .sound_model_cfg
                        .clone()
                        .ok_or_else(|| Error::not_found("no cached sound model to restore"))?;
                    self.process_event(&Event::LoadSoundModel(model))?;
                }
                if restore == Some(StState::Active) {
                    let config = self.rec_cfg.clone().ok_or_else(|| {
                        Error::invalid_argument("no cached recognition config to restore")
                    })?;
                    self.send_recognition_config_locked(&config)?;
                    self.process_event(&Event::StartRecognition { restart: false })?;
                }
                info!(restored = ?restore, "subsystem restored");
                self.state_for_restore = None;
                Ok(())
            }
            Event::LoadSoundModel(model) => {
                if self.state_for_restore != Some(StState::Idle) {
                    return Err(self.ssr_precondition("load"));
                }
                self.update_sound_model(model)?;
                self.state_for_restore = Some(StState::Loaded);
                Ok(())
            }
            Event::UnloadSoundModel => {
                if self.state_for_restore != Some(StState::Loaded) {
                    return Err(self.ssr_precondition("unload"));
                }
                self.state_for_restore = Some(StState::Idle);
                Ok(())
            }
            Event::RecognitionConfig(config) => {
                if self.state_for_restore != Some(StState::Loaded) {
                    return Err(self.ssr_precondition("recognition config"));
                }
                self.update_recognition_config(config);
                Ok(())
            }
            Event::StartRecognition { .. } => {
                if self.state_for_restore != Some(StState::Loaded) {
                    return Err(self.ssr_precondition("start"));
                }
                if self.rec_cfg.is_none() {
                    return Err(Error::invalid_argument("recognition config not set"));
                }
                self.state_for_restore = Some(StState::Active);
                Ok(())
            }
            Event::StopRecognition { .. } => {
                if self.state_for_restore != Some(StState::Active) {
                    return Err(self.ssr_precondition("stop"));
                }
                self.state_for_restore = Some(StState::Loaded);
                Ok(())
            }
            _ => {
                debug!(event = event.name(), "unhandled in Ssr");
                Ok(())
            }
        }
    }

    fn ssr_precondition(&self, op: &str) -> Error {
        warn!(
            op,
            saved_state = ?self.state_for_restore,
            "operation does not match saved client state"
        );
        Error::PreconditionFailed(format!(
            "{op} invalid for saved state {:?}",
            self.state_for_restore
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_names() {
        assert_eq!(StState::Idle.to_string(), "Idle");
        assert_eq!(StState::Buffering.to_string(), "Buffering");
        assert_eq!(StState::Ssr.to_string(), "Ssr");
    }
}
