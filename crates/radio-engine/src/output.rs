//! Audio output providers.
//!
//! A station asks its provider for the sample layout it should convert to
//! ([`OutputProvider::negotiate`]) when a session starts, and opens the device itself
//! ([`OutputProvider::open`]) only once there is buffered audio to play. Dropping the
//! returned [`OutputDevice`] releases the device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::decode::StreamSpec;
use crate::device;
use crate::playback::{self, LocalBuffer, OutputSession};

/// An open output device.
pub trait OutputDevice: Send {
    fn name(&self) -> &str;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
}

/// Factory for output devices.
pub trait OutputProvider: Send + Sync {
    /// Layout the station buffer should hold for a source of layout `source`.
    fn negotiate(&self, source: StreamSpec) -> Result<StreamSpec>;

    /// Open a paused device draining `session.buffer`.
    fn open(&self, spec: StreamSpec, session: OutputSession) -> Result<Box<dyn OutputDevice>>;
}

/// Output through the host audio API via CPAL.
#[derive(Clone, Debug, Default)]
pub struct CpalOutput {
    /// Device name substring; `None` picks the default device.
    pub device: Option<String>,
}

impl CpalOutput {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

enum DeviceCommand {
    Play,
    Pause,
}

/// Handle to a CPAL stream owned by its own thread.
///
/// `cpal::Stream` is not `Send` on every platform, so the stream lives on a dedicated
/// thread and is driven over a channel. Dropping the handle ends the thread.
struct CpalDevice {
    name: String,
    tx: Option<Sender<DeviceCommand>>,
    paused: Arc<AtomicBool>,
}

impl OutputDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn play(&mut self) -> Result<()> {
        self.paused.store(false, Ordering::Relaxed);
        self.send(DeviceCommand::Play)
    }

    fn pause(&mut self) -> Result<()> {
        self.paused.store(true, Ordering::Relaxed);
        self.send(DeviceCommand::Pause)
    }
}

impl CpalDevice {
    fn send(&self, cmd: DeviceCommand) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| anyhow!("output closed"))?
            .send(cmd)
            .map_err(|_| anyhow!("output thread gone"))
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.tx.take();
    }
}

impl OutputProvider for CpalOutput {
    fn negotiate(&self, source: StreamSpec) -> Result<StreamSpec> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, self.device.as_deref())?;
        let config = device::pick_output_config(&device, source)?;
        Ok(StreamSpec::new(config.sample_rate(), config.channels() as usize))
    }

    fn open(&self, spec: StreamSpec, session: OutputSession) -> Result<Box<dyn OutputDevice>> {
        let (tx, rx) = unbounded::<DeviceCommand>();
        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let needle = self.device.clone();
        let paused = session.paused.clone();
        paused.store(true, Ordering::Relaxed);

        thread::Builder::new()
            .name("radio-output".into())
            .spawn(move || run_device_thread(needle, spec, session, rx, ready_tx))
            .context("spawn output thread")?;

        let name = ready_rx
            .recv()
            .map_err(|_| anyhow!("output thread exited during setup"))??;
        Ok(Box::new(CpalDevice {
            name,
            tx: Some(tx),
            paused,
        }))
    }
}

fn run_device_thread(
    needle: Option<String>,
    spec: StreamSpec,
    session: OutputSession,
    rx: Receiver<DeviceCommand>,
    ready: Sender<Result<String>>,
) {
    let built = (|| -> Result<(cpal::Stream, String)> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, needle.as_deref())?;
        let name = device.description()?.to_string();
        let config = device::pick_output_config(&device, spec)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        stream_config.sample_rate = spec.rate;
        stream_config.channels = spec.channels as u16;
        if let Some(buf) = device::pick_buffer_size(&config) {
            stream_config.buffer_size = buf;
        }
        tracing::info!(
            device = %name,
            rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            buffer_size = ?stream_config.buffer_size,
            "output device opened"
        );
        let stream =
            playback::build_output_stream(&device, &stream_config, config.sample_format(), session)?;
        stream.pause().ok();
        Ok((stream, name))
    })();

    let stream = match built {
        Ok((stream, name)) => {
            let _ = ready.send(Ok(name));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    for cmd in rx.iter() {
        let result = match cmd {
            DeviceCommand::Play => stream.play().map_err(|e| anyhow!("{e}")),
            DeviceCommand::Pause => stream.pause().map_err(|e| anyhow!("{e}")),
        };
        if let Err(e) = result {
            tracing::warn!("output control failed: {e:#}");
        }
    }
    tracing::debug!("output device closed");
}

/// Device-less output that drains the buffer in real time. Used headless and in tests.
#[derive(Clone, Debug)]
pub struct NullOutput {
    /// Layout reported by `negotiate`; `None` keeps the source layout.
    pub spec: Option<StreamSpec>,
    /// Drain granularity.
    pub period: Duration,
}

impl Default for NullOutput {
    fn default() -> Self {
        Self {
            spec: None,
            period: Duration::from_millis(10),
        }
    }
}

struct NullDevice {
    tx: Option<Sender<bool>>,
    paused: Arc<AtomicBool>,
}

impl OutputDevice for NullDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn play(&mut self) -> Result<()> {
        self.paused.store(false, Ordering::Relaxed);
        self.tx
            .as_ref()
            .map(|tx| tx.send(true))
            .transpose()
            .map_err(|_| anyhow!("null output stopped"))?;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.paused.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for NullDevice {
    fn drop(&mut self) {
        self.tx.take();
    }
}

impl OutputProvider for NullOutput {
    fn negotiate(&self, source: StreamSpec) -> Result<StreamSpec> {
        Ok(self.spec.unwrap_or(source))
    }

    fn open(&self, spec: StreamSpec, session: OutputSession) -> Result<Box<dyn OutputDevice>> {
        let (tx, rx) = unbounded::<bool>();
        let paused = session.paused.clone();
        paused.store(true, Ordering::Relaxed);
        let period = self.period.max(Duration::from_millis(1));

        thread::Builder::new()
            .name("radio-null-output".into())
            .spawn(move || {
                let mut local = LocalBuffer::default();
                let mut scratch = Vec::new();
                let mut last = Instant::now();
                let mut carry = 0.0f64;
                loop {
                    match rx.recv_timeout(period) {
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let now = Instant::now();
                    carry += now.duration_since(last).as_secs_f64() * spec.rate as f64;
                    last = now;
                    let frames = carry as usize;
                    carry -= frames as f64;
                    if frames == 0 {
                        continue;
                    }
                    scratch.resize(frames * spec.channels.max(1), 0.0);
                    session.render(&mut local, &mut scratch);
                }
            })
            .context("spawn null output thread")?;

        Ok(Box::new(NullDevice {
            tx: Some(tx),
            paused,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StationBuffer;
    use crate::playback::{Gain, OutputCounters};

    #[test]
    fn null_output_drains_only_while_playing() {
        let buffer = Arc::new(StationBuffer::new(1000, 1, Duration::from_secs(2)));
        buffer.push(&vec![0.1; 1500]);
        let session = OutputSession {
            buffer: buffer.clone(),
            gain: Arc::new(Gain::default()),
            counters: Arc::new(OutputCounters::default()),
            paused: Arc::new(AtomicBool::new(false)),
            refill_max_frames: 64,
        };
        let provider = NullOutput::default();
        let spec = provider.negotiate(StreamSpec::new(1000, 1)).unwrap();
        assert_eq!(spec, StreamSpec::new(1000, 1));

        let mut device = provider.open(spec, session.clone()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(buffer.len_samples(), 1500);

        device.play().unwrap();
        thread::sleep(Duration::from_millis(300));
        let left = buffer.len_samples();
        assert!(left < 1400, "left {left}");
        assert!(session.counters.played_frames.load(Ordering::Relaxed) > 0);

        device.pause().unwrap();
        drop(device);
    }
}
