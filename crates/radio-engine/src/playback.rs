//! Real-time output callback.
//!
//! The callback drains a [`StationBuffer`] without blocking, applies the station gain and
//! converts to the device sample format. Underruns are filled with silence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::buffer::StationBuffer;

/// Linear gain shared between a station and its output callback.
#[derive(Debug)]
pub struct Gain(AtomicU32);

impl Gain {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Counters updated from the output callback.
#[derive(Debug, Default)]
pub struct OutputCounters {
    pub played_frames: AtomicU64,
    pub underrun_frames: AtomicU64,
    pub underrun_events: AtomicU64,
}

/// Everything an output needs to play one station session.
#[derive(Clone)]
pub struct OutputSession {
    pub buffer: Arc<StationBuffer>,
    pub gain: Arc<Gain>,
    pub counters: Arc<OutputCounters>,
    /// While set the callback writes silence and leaves the buffer untouched.
    pub paused: Arc<AtomicBool>,
    /// Max frames pulled from the buffer per refill.
    pub refill_max_frames: usize,
}

impl OutputSession {
    /// Fill `out` (interleaved, buffer channel layout) from the buffer.
    ///
    /// Returns the number of frames taken from the buffer.
    pub fn render(&self, local: &mut LocalBuffer, out: &mut [f32]) -> usize {
        if self.paused.load(Ordering::Relaxed) {
            out.fill(0.0);
            return 0;
        }
        let channels = self.buffer.channels();
        let gain = self.gain.get();
        let frames = out.len() / channels;
        let mut filled = 0usize;

        for frame in 0..frames {
            if local.pos >= local.samples.len() {
                local.pos = 0;
                local.samples.clear();
                match self.buffer.pop(self.refill_max_frames.max(1)) {
                    Some(v) => local.samples = v,
                    None => {
                        self.counters.underrun_events.fetch_add(1, Ordering::Relaxed);
                        self.counters
                            .underrun_frames
                            .fetch_add((frames - frame) as u64, Ordering::Relaxed);
                        out[frame * channels..].fill(0.0);
                        break;
                    }
                }
            }
            for ch in 0..channels {
                out[frame * channels + ch] = local.samples[local.pos + ch] * gain;
            }
            local.pos += channels;
            filled += 1;
        }

        if filled > 0 {
            self.counters
                .played_frames
                .fetch_add(filled as u64, Ordering::Relaxed);
        }
        filled
    }
}

/// Samples already popped from the buffer but not yet written to the device.
#[derive(Default)]
pub struct LocalBuffer {
    pos: usize,
    samples: Vec<f32>,
}

/// Build a CPAL output stream fed by `session`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    session: OutputSession,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, session),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, session),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, session),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, session),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    session: OutputSession,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    if config.channels as usize != session.buffer.channels() {
        return Err(anyhow!(
            "device channels {} differ from buffer channels {}",
            config.channels,
            session.buffer.channels()
        ));
    }
    let mut local = LocalBuffer::default();
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            scratch.resize(data.len(), 0.0);
            session.render(&mut local, &mut scratch);
            for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
