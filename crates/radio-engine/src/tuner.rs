//! Station selection.
//!
//! The tuner owns the station list and two indices: the active station (the one that
//! plays) and the pending station (previewed while the listener scrolls, committed by
//! [`Tuner::activate_next_station`]).

use std::sync::Arc;

use crate::context::RadioContext;
use crate::station::{PlaybackState, Station};

pub struct Tuner {
    ctx: Arc<RadioContext>,
    stations: Vec<Station>,
    active: Option<usize>,
    pending: Option<usize>,
}

impl Tuner {
    pub fn new(ctx: Arc<RadioContext>, stations: Vec<Station>) -> Self {
        Self {
            ctx,
            stations,
            active: None,
            pending: None,
        }
    }

    pub fn context(&self) -> &Arc<RadioContext> {
        &self.ctx
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn has_stations(&self) -> bool {
        !self.stations.is_empty()
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn pending_index(&self) -> Option<usize> {
        self.pending
    }

    pub fn active_station(&self) -> Option<&Station> {
        self.active.and_then(|i| self.stations.get(i))
    }

    pub fn pending_station(&self) -> Option<&Station> {
        self.pending.and_then(|i| self.stations.get(i))
    }

    /// Make `index` (or the active station, or the first one) the active station and
    /// start it. Re-playing the active station resumes it without a restart.
    pub fn play(&mut self, index: Option<usize>) {
        if self.stations.is_empty() {
            return;
        }
        let target = index.or(self.active).unwrap_or(0);
        if !self.set_active(Some(target)) {
            return;
        }
        if let Some(station) = self.active_station() {
            station.play();
        }
    }

    /// Switch the active station: stop the old one, start the new one. Selecting the
    /// current station again does nothing. Returns `false` for an invalid index.
    pub fn set_active(&mut self, index: Option<usize>) -> bool {
        if let Some(i) = index {
            if i >= self.stations.len() {
                self.ctx.logger().log(format_args!(
                    "Station index {i} out of range ({} stations)",
                    self.stations.len()
                ));
                return false;
            }
        }
        if index == self.active {
            return true;
        }
        if let Some(old) = self.active_station() {
            old.stop();
        }
        self.active = index;
        if let Some(station) = self.active_station() {
            tracing::info!(station = %station.name(), kind = %station.kind(), "station selected");
            station.play();
            station.log_current_track();
        }
        true
    }

    pub fn stop_current(&self) {
        if let Some(station) = self.active_station() {
            station.stop();
        }
    }

    pub fn pause_current(&self) {
        if let Some(station) = self.active_station() {
            station.pause();
        }
    }

    pub fn keep_alive(&self) {
        if let Some(station) = self.active_station() {
            station.keep_alive();
        }
    }

    /// Preview the next station, wrapping to the first. Playback is untouched.
    pub fn move_to_next_station(&mut self) -> Option<&Station> {
        let count = self.stations.len();
        if count == 0 {
            return None;
        }
        let next = match self.pending.or(self.active) {
            Some(i) if i + 1 < count => i + 1,
            Some(_) => 0,
            None => 0,
        };
        self.pending = Some(next);
        self.stations.get(next)
    }

    /// Preview the previous station, wrapping to the last.
    pub fn move_to_previous_station(&mut self) -> Option<&Station> {
        let count = self.stations.len();
        if count == 0 {
            return None;
        }
        let previous = match self.pending.or(self.active) {
            Some(0) | None => count - 1,
            Some(i) => (i - 1).min(count - 1),
        };
        self.pending = Some(previous);
        self.stations.get(previous)
    }

    /// Commit the pending station, if any.
    pub fn activate_next_station(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.set_active(Some(pending));
        }
    }

    /// True while the active station is buffering or playing.
    pub fn is_radio_on(&self) -> bool {
        self.active_station()
            .map(|s| matches!(s.state(), PlaybackState::Buffering | PlaybackState::Playing))
            .unwrap_or(false)
    }

    pub fn log_current_track(&self) {
        if let Some(station) = self.active_station() {
            station.log_current_track();
        }
    }

    /// Store the host volume multiplier and re-apply it on every station.
    pub fn set_global_volume(&self, value: f32) {
        self.ctx.set_global_volume(value);
        for station in &self.stations {
            station.refresh_volume();
        }
    }
}

impl Drop for Tuner {
    fn drop(&mut self) {
        self.stop_current();
    }
}
