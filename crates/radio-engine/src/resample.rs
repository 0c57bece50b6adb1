//! Chunk-wise format conversion.
//!
//! Stations decode at whatever rate and layout the source has, while the output device
//! (and the clustered rotation) want one fixed [`StreamSpec`]. [`SpecConverter`] remaps
//! channels and runs a Rubato sinc resampler over a stream of arbitrary-sized chunks.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::decode::StreamSpec;
use crate::error::SourceError;

const CHUNK_FRAMES: usize = 1024;

/// Converts interleaved audio from one [`StreamSpec`] to another.
pub struct SpecConverter {
    from: StreamSpec,
    to: StreamSpec,
    resampler: Option<Box<dyn Resampler<f32>>>,
    pending: Vec<f32>,
    out: Vec<f32>,
}

impl SpecConverter {
    pub fn new(from: StreamSpec, to: StreamSpec) -> Result<Self, SourceError> {
        let channels = to.channels.max(1);
        let resampler: Option<Box<dyn Resampler<f32>>> = if from.rate == to.rate {
            None
        } else {
            let f_ratio = to.rate as f64 / from.rate.max(1) as f64;
            let sinc_len = 128;
            let window = WindowFunction::BlackmanHarris2;
            let params = SincInterpolationParameters {
                sinc_len,
                f_cutoff: calculate_cutoff(sinc_len, window),
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 256,
                window,
            };
            let r = Async::<f32>::new_sinc(
                f_ratio,
                1.1,
                &params,
                CHUNK_FRAMES,
                channels,
                FixedAsync::Input,
            )
            .map_err(|e| SourceError::Unsupported(format!("resampler init: {e}")))?;
            Some(Box::new(r))
        };
        let out_frames = (CHUNK_FRAMES as f64 * to.rate as f64 / from.rate.max(1) as f64 * 1.2)
            .ceil() as usize
            + 64;
        Ok(Self {
            from,
            to,
            resampler,
            pending: Vec::new(),
            out: vec![0.0; out_frames * channels],
        })
    }

    pub fn from_spec(&self) -> StreamSpec {
        self.from
    }

    pub fn to_spec(&self) -> StreamSpec {
        self.to
    }

    pub fn is_passthrough(&self) -> bool {
        self.from == self.to
    }

    /// Convert one chunk. Resampled output lags the input by up to one internal chunk;
    /// call [`SpecConverter::flush`] at end of stream to get the tail.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, SourceError> {
        if self.is_passthrough() {
            return Ok(input.to_vec());
        }
        let remapped = remap_channels(input, self.from.channels, self.to.channels);
        if self.resampler.is_none() {
            return Ok(remapped);
        }
        self.pending.extend_from_slice(&remapped);

        let channels = self.to.channels.max(1);
        let chunk_samples = CHUNK_FRAMES * channels;
        let mut produced = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= chunk_samples {
            let n = self.run(offset, CHUNK_FRAMES, None)?;
            produced.extend_from_slice(&self.out[..n]);
            offset += chunk_samples;
        }
        self.pending.drain(..offset);
        Ok(produced)
    }

    /// Push the buffered remainder through the resampler.
    pub fn flush(&mut self) -> Result<Vec<f32>, SourceError> {
        let channels = self.to.channels.max(1);
        let frames = self.pending.len() / channels;
        if self.resampler.is_none() || frames == 0 {
            self.pending.clear();
            return Ok(Vec::new());
        }
        self.pending.resize(CHUNK_FRAMES * channels, 0.0);
        let n = self.run(0, CHUNK_FRAMES, Some(frames))?;
        self.pending.clear();
        Ok(self.out[..n].to_vec())
    }

    fn run(
        &mut self,
        offset: usize,
        frames: usize,
        partial_len: Option<usize>,
    ) -> Result<usize, SourceError> {
        let channels = self.to.channels.max(1);
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(0);
        };
        let input = &self.pending[offset..offset + frames * channels];
        let input_adapter = InterleavedSlice::new(input, channels, frames)
            .map_err(|e| SourceError::Unsupported(format!("interleaved slice (input): {e}")))?;
        let out_capacity_frames = self.out.len() / channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out, channels, out_capacity_frames).map_err(
                |e| SourceError::Unsupported(format!("interleaved slice (output): {e}")),
            )?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| SourceError::Unsupported(format!("resampler process: {e}")))?;
        Ok(nbr_out * channels)
    }
}

/// Map interleaved frames from `src` to `dst` channels.
///
/// - mono to stereo duplicates channel 0
/// - stereo to mono averages L/R
/// - other layouts clamp to the last available channel
pub fn remap_channels(input: &[f32], src: usize, dst: usize) -> Vec<f32> {
    let src = src.max(1);
    let dst = dst.max(1);
    if src == dst {
        return input.to_vec();
    }
    let frames = input.len() / src;
    let mut out = Vec::with_capacity(frames * dst);
    for frame in input.chunks_exact(src) {
        for ch in 0..dst {
            let sample = match (src, dst) {
                (2, 1) => 0.5 * (frame[0] + frame[1]),
                (1, _) => frame[0],
                _ => frame[ch.min(src - 1)],
            };
            out.push(sample);
        }
    }
    out
}
