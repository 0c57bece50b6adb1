//! CPAL device discovery and output format negotiation.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::decode::StreamSpec;

/// First output device whose name contains `needle` (case-insensitive), or the host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| matches_device_name(&desc.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `wanted`.
///
/// Ranking, most important first: channel count equal to the source, the source rate
/// inside the supported range, then sample format (f32 preferred).
pub fn pick_output_config(
    device: &cpal::Device,
    wanted: StreamSpec,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();

    let best = ranges
        .into_iter()
        .map(|range| {
            let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), wanted.rate);
            let rank = ConfigRank {
                channels_match: range.channels() as usize == wanted.channels,
                rate_exact: rate == wanted.rate,
                format_rank: sample_format_rank(range.sample_format()),
            };
            (rank, range.with_sample_rate(rate))
        })
        .min_by_key(|(rank, _)| rank.key());

    match best {
        Some((_, cfg)) => Ok(cfg),
        None => device
            .default_output_config()
            .context("No supported output configs"),
    }
}

/// Prefer a fixed buffer size if the device advertises a range, capped at 16k frames.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print available output devices to stdout.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct ConfigRank {
    channels_match: bool,
    rate_exact: bool,
    format_rank: u8,
}

impl ConfigRank {
    fn key(&self) -> (bool, bool, u8) {
        (!self.channels_match, !self.rate_exact, self.format_rank)
    }
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn clamp_rate_stays_in_range() {
        assert_eq!(clamp_rate(44_100, 96_000, 48_000), 48_000);
        assert_eq!(clamp_rate(44_100, 96_000, 22_050), 44_100);
        assert_eq!(clamp_rate(44_100, 96_000, 192_000), 96_000);
    }

    #[test]
    fn rank_prefers_channels_then_rate_then_format() {
        let stereo_resampled = ConfigRank { channels_match: true, rate_exact: false, format_rank: 0 };
        let mono_exact = ConfigRank { channels_match: false, rate_exact: true, format_rank: 0 };
        let stereo_exact_i16 = ConfigRank { channels_match: true, rate_exact: true, format_rank: 2 };
        assert!(stereo_resampled.key() < mono_exact.key());
        assert!(stereo_exact_i16.key() < stereo_resampled.key());
    }
}
