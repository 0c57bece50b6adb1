//! Station playback engine.
//!
//! A [`Station`] owns the playback state machine shared by every station kind:
//!
//! ```text
//! Stopped ──play──▶ Buffering ──enough audio──▶ Playing
//!                     ▲   │                        │
//!                     │   └──────pause─────┐       │ pause / buffer < stutter threshold
//!             play /  │                    ▼       ▼
//!        auto-resume  └─────────────── Paused / Suspended
//! ```
//!
//! Three kinds of background work run per station:
//! - a decode thread per session, pulling from the [`StationSource`] into a [`StationBuffer`]
//! - a playback tick (watchdog, lazy device start, stutter handling) while not stopped
//! - a metadata refresh timer for the station's whole lifetime
//!
//! Every state transition happens under the engine lock; readers use the lock-free
//! [`StateCell`] mirror.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::StationBuffer;
use crate::config::EngineConfig;
use crate::context::RadioContext;
use crate::decode::AudioSource;
use crate::error::SourceError;
use crate::logger::RadioLogger;
use crate::metadata::{MetadataCell, TrackMetaData};
use crate::output::OutputDevice;
use crate::playback::{Gain, OutputCounters, OutputSession};
use crate::resample::SpecConverter;
use crate::timer::PeriodicTask;

const REFILL_MAX_FRAMES: usize = 4096;
const PUSH_RETRY: Duration = Duration::from_millis(20);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped = 0,
    Buffering = 1,
    Playing = 2,
    Paused = 3,
    Suspended = 4,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PlaybackState::Buffering,
            2 => PlaybackState::Playing,
            3 => PlaybackState::Paused,
            4 => PlaybackState::Suspended,
            _ => PlaybackState::Stopped,
        }
    }

    /// Buffering or Playing.
    pub fn is_audible(self) -> bool {
        matches!(self, PlaybackState::Buffering | PlaybackState::Playing)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Lock-free mirror of a station's [`PlaybackState`].
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn get(&self) -> PlaybackState {
        PlaybackState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: PlaybackState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StationKind {
    Looped,
    Clustered,
    Network,
}

impl fmt::Display for StationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StationKind::Looped => "looped",
            StationKind::Clustered => "clustered",
            StationKind::Network => "network",
        };
        f.write_str(s)
    }
}

/// Where a station's audio and metadata come from.
pub trait StationSource: Send + Sync {
    fn kind(&self) -> StationKind;

    fn buffer_target(&self, config: &EngineConfig) -> Duration {
        config.default_buffer
    }

    /// `false` for live sources: when the buffer fills while not playing, old audio is
    /// dropped instead of pausing the decode.
    fn always_sleep_when_full(&self) -> bool {
        true
    }

    fn meta_sync_interval(&self, config: &EngineConfig) -> Duration {
        config.local_meta_interval
    }

    /// Open the stream for a new playback session. Called on the decode thread.
    fn open(&self, ctx: &SourceContext) -> Result<Box<dyn AudioSource>, SourceError>;

    /// Periodic metadata refresh. Must not block on work another refresh is doing.
    fn refresh_meta_info(&self, ctx: &SourceContext);

    /// Runs on the decode thread after the session's stream is done.
    fn streaming_finished(&self, _ctx: &SourceContext) {}
}

/// What a [`StationSource`] may touch on its station.
#[derive(Clone)]
pub struct SourceContext {
    station: Arc<str>,
    radio: Arc<RadioContext>,
    metadata: Arc<MetadataCell>,
    state: Arc<StateCell>,
}

impl SourceContext {
    pub fn new(station: &str, radio: Arc<RadioContext>) -> Self {
        Self {
            station: Arc::from(station),
            radio,
            metadata: Arc::new(MetadataCell::new()),
            state: Arc::new(StateCell::default()),
        }
    }

    pub fn station_name(&self) -> &str {
        &self.station
    }

    pub fn logger(&self) -> &dyn RadioLogger {
        self.radio.logger().as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        self.radio.config()
    }

    pub fn state(&self) -> PlaybackState {
        self.state.get()
    }

    pub fn current_metadata(&self) -> Option<TrackMetaData> {
        self.metadata.get()
    }

    #[cfg(test)]
    pub(crate) fn set_state_for_test(&self, state: PlaybackState) {
        self.state.set(state);
    }

    /// Commit new metadata if its display form changed. Audible stations log the new
    /// track. Returns `true` when the value changed.
    pub fn publish(&self, meta: Option<TrackMetaData>) -> bool {
        if !self.metadata.update(meta.clone()) {
            return false;
        }
        if let Some(meta) = meta {
            if self.state().is_audible() && !meta.display().is_empty() {
                self.logger().log_track(&self.station, &meta);
            }
        }
        true
    }
}

/// Point-in-time view of a station.
#[derive(Clone, Debug)]
pub struct StationStatus {
    pub name: String,
    pub kind: StationKind,
    pub state: PlaybackState,
    pub now_playing: Option<String>,
    pub buffered: Duration,
    pub device: Option<String>,
    pub volume: f32,
    pub played_frames: u64,
    pub underrun_frames: u64,
    pub underrun_events: u64,
}

/// One selectable station. Dropping it stops playback and its timers.
pub struct Station {
    inner: Arc<StationInner>,
    meta_task: Mutex<Option<PeriodicTask>>,
}

struct StationInner {
    name: String,
    folder: PathBuf,
    source: Arc<dyn StationSource>,
    radio: Arc<RadioContext>,
    ctx: SourceContext,
    volume: AtomicU32,
    conversation: AtomicBool,
    gain: Arc<Gain>,
    counters: Arc<OutputCounters>,
    last_keep_alive: Mutex<Instant>,
    engine: Mutex<Engine>,
}

#[derive(Default)]
struct Engine {
    next_session: u64,
    session: Option<Session>,
    device: Option<Box<dyn OutputDevice>>,
    tick: Option<PeriodicTask>,
    auto_resume_blocked_until: Option<Instant>,
}

/// One decode run, from `play()` on a stopped station until `stop()`.
struct Session {
    id: u64,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    buffer: Option<Arc<StationBuffer>>,
    output_paused: Arc<AtomicBool>,
}

impl Station {
    pub fn new(
        name: impl Into<String>,
        folder: impl Into<PathBuf>,
        volume: f32,
        source: Arc<dyn StationSource>,
        radio: Arc<RadioContext>,
    ) -> Self {
        let name = name.into();
        let ctx = SourceContext::new(&name, radio.clone());
        let inner = Arc::new(StationInner {
            name,
            folder: folder.into(),
            source,
            radio,
            ctx,
            volume: AtomicU32::new(clamp_volume(volume).to_bits()),
            conversation: AtomicBool::new(false),
            gain: Arc::new(Gain::default()),
            counters: Arc::new(OutputCounters::default()),
            last_keep_alive: Mutex::new(Instant::now()),
            engine: Mutex::new(Engine::default()),
        });
        inner.refresh_volume();

        let interval = inner.source.meta_sync_interval(inner.radio.config());
        let weak = Arc::downgrade(&inner);
        let meta_task = match PeriodicTask::spawn("radio-meta", interval, true, move || {
            match weak.upgrade() {
                Some(inner) => {
                    inner.source.refresh_meta_info(&inner.ctx);
                    true
                }
                None => false,
            }
        }) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(station = %inner.name, "metadata timer not started: {e}");
                None
            }
        };

        Self {
            inner,
            meta_task: Mutex::new(meta_task),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn folder(&self) -> &Path {
        &self.inner.folder
    }

    pub fn kind(&self) -> StationKind {
        self.inner.source.kind()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.ctx.state()
    }

    pub fn metadata(&self) -> Option<TrackMetaData> {
        self.inner.ctx.current_metadata()
    }

    /// From Stopped: start a new decode session. From Paused/Suspended: resume feeding
    /// the existing buffer. Always lands in Buffering.
    pub fn play(&self) {
        self.inner.play();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Pause and mark Suspended. With `disable_auto_resume` the watchdog will not
    /// resume playback until the watchdog timeout plus a margin has passed.
    pub fn suspend(&self, disable_auto_resume: bool) {
        self.inner.suspend(disable_auto_resume);
    }

    /// Reset the watchdog clock.
    pub fn keep_alive(&self) {
        *self.inner.keep_alive_lock() = Instant::now();
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.inner.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.inner
            .volume
            .store(clamp_volume(volume).to_bits(), Ordering::Relaxed);
        self.inner.refresh_volume();
    }

    pub fn has_ongoing_conversation(&self) -> bool {
        self.inner.conversation.load(Ordering::Relaxed)
    }

    /// Ducks the station to half volume while set.
    pub fn set_ongoing_conversation(&self, ongoing: bool) {
        self.inner.conversation.store(ongoing, Ordering::Relaxed);
        self.inner.refresh_volume();
    }

    /// Re-apply volume after the global multiplier or the output provider changed.
    pub fn refresh_volume(&self) {
        self.inner.refresh_volume();
    }

    pub fn effective_volume(&self) -> f32 {
        self.inner.gain.get()
    }

    /// Run one metadata refresh on the calling thread.
    pub fn refresh_meta_info(&self) {
        self.inner.source.refresh_meta_info(&self.inner.ctx);
    }

    /// Send the current metadata to the logger, if it has a display form.
    pub fn log_current_track(&self) {
        if let Some(meta) = self.metadata() {
            if !meta.display().is_empty() {
                self.inner.ctx.logger().log_track(&self.inner.name, &meta);
            }
        }
    }

    pub fn status(&self) -> StationStatus {
        let eng = self.inner.lock_engine();
        let buffered = eng
            .session
            .as_ref()
            .and_then(|s| s.buffer.as_ref())
            .map(|b| b.buffered_duration())
            .unwrap_or_default();
        let device = eng.device.as_ref().map(|d| d.name().to_string());
        drop(eng);
        let counters = &self.inner.counters;
        StationStatus {
            name: self.inner.name.clone(),
            kind: self.kind(),
            state: self.state(),
            now_playing: self.metadata().map(|m| m.display()),
            buffered,
            device,
            volume: self.volume(),
            played_frames: counters.played_frames.load(Ordering::Relaxed),
            underrun_frames: counters.underrun_frames.load(Ordering::Relaxed),
            underrun_events: counters.underrun_events.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Station")
            .field("name", &self.inner.name)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        self.inner.stop();
        let task = self
            .meta_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.cancel();
        }
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 10.0)
    } else {
        1.0
    }
}

impl StationInner {
    fn lock_engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn keep_alive_lock(&self) -> MutexGuard<'_, Instant> {
        self.last_keep_alive.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> PlaybackState {
        self.ctx.state()
    }

    fn set_state(&self, state: PlaybackState) {
        let old = self.ctx.state.get();
        if old != state {
            tracing::debug!(station = %self.name, from = %old, to = %state, "state change");
            self.ctx.state.set(state);
        }
    }

    fn refresh_volume(&self) {
        let volume = f32::from_bits(self.volume.load(Ordering::Relaxed));
        let ducking = if self.conversation.load(Ordering::Relaxed) {
            0.5
        } else {
            1.0
        };
        self.gain
            .set(volume * self.radio.global_volume() * ducking);
    }

    fn play(self: &Arc<Self>) {
        let mut eng = self.lock_engine();
        match self.state() {
            PlaybackState::Stopped => self.start_session(&mut eng),
            PlaybackState::Paused | PlaybackState::Suspended => {
                self.set_state(PlaybackState::Buffering)
            }
            PlaybackState::Buffering | PlaybackState::Playing => {}
        }
    }

    fn start_session(self: &Arc<Self>, eng: &mut Engine) {
        *self.keep_alive_lock() = Instant::now();
        eng.next_session += 1;
        let id = eng.next_session;
        let cancel = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let thread_inner = Arc::clone(self);
        let thread_cancel = cancel.clone();
        let thread_finished = finished.clone();
        let spawned = thread::Builder::new()
            .name("radio-decode".into())
            .spawn(move || thread_inner.run_session(id, thread_cancel, thread_finished));
        if let Err(e) = spawned {
            self.ctx
                .logger()
                .log(format_args!("Could not start decoding '{}': {e}", self.name));
            return;
        }

        eng.session = Some(Session {
            id,
            cancel,
            finished,
            buffer: None,
            output_paused: Arc::new(AtomicBool::new(true)),
        });
        self.set_state(PlaybackState::Buffering);

        if eng.tick.is_none() {
            let weak: Weak<StationInner> = Arc::downgrade(self);
            let interval = self.radio.config().tick_interval;
            match PeriodicTask::spawn("radio-tick", interval, false, move || {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.on_tick();
                        true
                    }
                    None => false,
                }
            }) {
                Ok(task) => eng.tick = Some(task),
                Err(e) => tracing::warn!(station = %self.name, "playback timer not started: {e}"),
            }
        }
    }

    fn stop(&self) {
        let mut eng = self.lock_engine();
        self.stop_locked(&mut eng);
    }

    fn stop_locked(&self, eng: &mut Engine) {
        if self.state() == PlaybackState::Stopped {
            return;
        }
        self.set_state(PlaybackState::Stopped);
        if let Some(session) = eng.session.take() {
            session.cancel.store(true, Ordering::Relaxed);
        }
        if let Some(device) = eng.device.take() {
            tracing::debug!(station = %self.name, device = %device.name(), "output released");
        }
        if let Some(tick) = eng.tick.take() {
            tick.cancel();
        }
        eng.auto_resume_blocked_until = None;
    }

    fn pause(&self) {
        let mut eng = self.lock_engine();
        if self.state().is_audible() {
            self.pause_device(&mut eng);
            self.set_state(PlaybackState::Paused);
        }
    }

    fn suspend(&self, disable_auto_resume: bool) {
        let mut eng = self.lock_engine();
        self.suspend_locked(&mut eng, disable_auto_resume);
    }

    fn suspend_locked(&self, eng: &mut Engine, disable_auto_resume: bool) {
        let state = self.state();
        if state == PlaybackState::Stopped {
            return;
        }
        if state != PlaybackState::Suspended {
            self.pause_device(eng);
            self.set_state(PlaybackState::Suspended);
        }
        if disable_auto_resume {
            let cfg = self.radio.config();
            eng.auto_resume_blocked_until =
                Some(Instant::now() + cfg.watchdog_timeout + cfg.auto_resume_margin);
        }
    }

    fn pause_device(&self, eng: &mut Engine) {
        if let Some(session) = eng.session.as_ref() {
            session.output_paused.store(true, Ordering::Relaxed);
        }
        if let Some(device) = eng.device.as_mut() {
            if let Err(e) = device.pause() {
                tracing::warn!(station = %self.name, "output pause failed: {e:#}");
            }
        }
    }

    /// Watchdog and buffer/device supervision; runs every tick while not stopped.
    fn on_tick(&self) {
        let cfg = self.radio.config();
        let mut eng = self.lock_engine();
        let state = self.state();
        if state == PlaybackState::Stopped {
            return;
        }

        let stale = self.keep_alive_lock().elapsed() > cfg.watchdog_timeout;
        if self.radio.pause_if_not_notified() && stale {
            if state != PlaybackState::Suspended {
                tracing::debug!(station = %self.name, "no keep-alive, suspending");
                self.suspend_locked(&mut eng, false);
            }
            return;
        }

        if state == PlaybackState::Suspended {
            let allowed = eng
                .auto_resume_blocked_until
                .map(|until| Instant::now() >= until)
                .unwrap_or(true);
            if !allowed {
                return;
            }
            eng.auto_resume_blocked_until = None;
            self.set_state(PlaybackState::Buffering);
        }

        self.supervise_buffer(&mut eng);
    }

    fn supervise_buffer(&self, eng: &mut Engine) {
        let cfg = self.radio.config();
        let (buffer, finished, output_paused) = match eng.session.as_ref() {
            Some(s) => (
                s.buffer.clone(),
                s.finished.load(Ordering::Acquire),
                s.output_paused.clone(),
            ),
            None => return,
        };
        let state = self.state();
        if !state.is_audible() {
            return;
        }

        let buffered_samples = buffer.as_ref().map(|b| b.len_samples()).unwrap_or(0);
        if finished && buffered_samples == 0 {
            self.ctx
                .logger()
                .log(format_args!("Stream of '{}' ended", self.name));
            self.stop_locked(eng);
            return;
        }
        let Some(buffer) = buffer else {
            return;
        };
        let buffered = buffer.buffered_duration();

        match state {
            PlaybackState::Buffering => {
                let threshold = self.source.buffer_target(cfg).min(cfg.start_threshold);
                if buffered < threshold && !finished {
                    return;
                }
                if let Err(e) = self.start_device(eng, &buffer, output_paused) {
                    self.ctx
                        .logger()
                        .log(format_args!("Audio output for '{}' failed: {e:#}", self.name));
                    self.stop_locked(eng);
                    return;
                }
                self.set_state(PlaybackState::Playing);
            }
            PlaybackState::Playing => {
                if !finished && buffered < cfg.stutter_threshold {
                    tracing::debug!(
                        station = %self.name,
                        buffered_ms = buffered.as_millis() as u64,
                        "buffer low, rebuffering"
                    );
                    self.pause_device(eng);
                    self.set_state(PlaybackState::Buffering);
                }
            }
            _ => {}
        }
    }

    fn start_device(
        &self,
        eng: &mut Engine,
        buffer: &Arc<StationBuffer>,
        output_paused: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        if eng.device.is_none() {
            let spec = crate::decode::StreamSpec::new(buffer.rate(), buffer.channels());
            let session = OutputSession {
                buffer: buffer.clone(),
                gain: self.gain.clone(),
                counters: self.counters.clone(),
                paused: output_paused,
                refill_max_frames: REFILL_MAX_FRAMES,
            };
            eng.device = Some(self.radio.output().open(spec, session)?);
        }
        match eng.device.as_mut() {
            Some(device) => device.play(),
            None => Ok(()),
        }
    }

    fn is_current_session(&self, id: u64) -> bool {
        self.lock_engine()
            .session
            .as_ref()
            .map(|s| s.id == id)
            .unwrap_or(false)
    }

    fn run_session(self: Arc<Self>, id: u64, cancel: Arc<AtomicBool>, finished: Arc<AtomicBool>) {
        if let Err(e) = self.stream_audio(id, &cancel) {
            if !cancel.load(Ordering::Relaxed) && self.is_current_session(id) {
                self.ctx
                    .logger()
                    .log(format_args!("Error streaming '{}': {e}", self.name));
            }
        }
        self.source.streaming_finished(&self.ctx);
        finished.store(true, Ordering::Release);
    }

    /// Decode pump. Returns when the source ends, fails, or the session is cancelled.
    fn stream_audio(&self, id: u64, cancel: &AtomicBool) -> Result<(), SourceError> {
        let cfg = self.radio.config();
        let mut source = self.source.open(&self.ctx)?;
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }

        let input = source.spec();
        let output = self
            .radio
            .output()
            .negotiate(input)
            .map_err(|e| SourceError::Unsupported(format!("output negotiation: {e:#}")))?;
        let mut converter = SpecConverter::new(input, output)?;
        let buffer = Arc::new(StationBuffer::new(
            output.rate,
            output.channels,
            self.source.buffer_target(cfg),
        ));
        {
            let mut eng = self.lock_engine();
            match eng.session.as_mut() {
                Some(session) if session.id == id => session.buffer = Some(buffer.clone()),
                _ => return Ok(()),
            }
        }
        tracing::debug!(
            station = %self.name,
            source_rate_hz = input.rate,
            source_channels = input.channels,
            output_rate_hz = output.rate,
            output_channels = output.channels,
            "stream opened"
        );

        let sleep_when_full = self.source.always_sleep_when_full();
        let mut carry: Vec<f32> = Vec::new();
        let mut carry_pos = 0usize;
        let mut ended = false;
        let mut frame_errors = 0u32;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(());
            }

            if carry_pos < carry.len() {
                if buffer.is_nearly_full() {
                    if sleep_when_full || self.state() == PlaybackState::Playing {
                        sleep_unless_cancelled(cancel, cfg.full_buffer_sleep);
                        continue;
                    }
                    let dropped = buffer.drop_older_half();
                    tracing::debug!(station = %self.name, dropped_samples = dropped, "buffer full, dropped older audio");
                }
                carry_pos += buffer.push(&carry[carry_pos..]);
                if carry_pos < carry.len() {
                    sleep_unless_cancelled(cancel, PUSH_RETRY);
                }
                continue;
            }
            if ended {
                return Ok(());
            }

            match source.next_chunk() {
                Ok(Some(chunk)) => {
                    frame_errors = 0;
                    carry = converter.process(&chunk)?;
                    carry_pos = 0;
                }
                Ok(None) => {
                    carry = converter.flush()?;
                    carry_pos = 0;
                    ended = true;
                }
                Err(e) if e.is_frame_error() => {
                    frame_errors += 1;
                    tracing::debug!(station = %self.name, count = frame_errors, "frame error: {e}");
                    if frame_errors >= cfg.max_frame_errors {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn sleep_unless_cancelled(cancel: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(10);
    let deadline = Instant::now() + total;
    while !cancel.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(step.min(deadline - now));
    }
}
