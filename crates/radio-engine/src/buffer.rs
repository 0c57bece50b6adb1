//! Bounded sample buffer between a station's decode thread and its output device.
//!
//! Unlike a plain bounded queue the producer never blocks here: the decode pump asks
//! how full the buffer is and decides itself whether to sleep, drop old audio or keep
//! pushing. The output callback drains it without blocking.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Interleaved `f32` samples at a fixed rate and channel count.
pub struct StationBuffer {
    rate: u32,
    channels: usize,
    capacity: usize,
    inner: Mutex<BufferInner>,
    low_watermark_ms: AtomicU64,
}

struct BufferInner {
    queue: VecDeque<f32>,
    /// Buffered sample count recorded when the buffer first crossed half capacity.
    half_mark: Option<usize>,
}

/// Capacity in samples for `seconds` of audio at `(rate_hz, channels)`.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl StationBuffer {
    pub fn new(rate: u32, channels: usize, target: Duration) -> Self {
        let channels = channels.max(1);
        let capacity = calc_max_buffered_samples(rate, channels, target.as_secs_f32());
        Self {
            rate,
            channels,
            capacity,
            inner: Mutex::new(BufferInner {
                queue: VecDeque::with_capacity(capacity),
                half_mark: None,
            }),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len_samples(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn free_samples(&self) -> usize {
        self.capacity.saturating_sub(self.len_samples())
    }

    pub fn buffered_duration(&self) -> Duration {
        let frames = self.len_samples() / self.channels;
        Duration::from_secs_f64(frames as f64 / self.rate.max(1) as f64)
    }

    /// Less than a quarter second of space left.
    pub fn is_nearly_full(&self) -> bool {
        let quarter_second = (self.rate as usize / 4).saturating_mul(self.channels);
        self.free_samples() < quarter_second
    }

    /// Push as many samples as fit, rounded down to whole frames. Returns the count taken.
    pub fn push(&self, samples: &[f32]) -> usize {
        let mut g = self.lock();
        let room = self.capacity.saturating_sub(g.queue.len());
        let take = room.min(samples.len()) / self.channels * self.channels;
        g.queue.extend(&samples[..take]);
        if g.half_mark.is_none() && g.queue.len() > self.capacity / 2 {
            g.half_mark = Some(g.queue.len());
        }
        take
    }

    /// Pop up to `max_frames` frames. `None` when empty.
    pub fn pop(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.lock();
        let take = (g.queue.len() / self.channels).min(max_frames) * self.channels;
        if take == 0 {
            return None;
        }
        let out: Vec<f32> = g.queue.drain(..take).collect();
        let remaining = g.queue.len();
        drop(g);
        self.log_low_watermark(remaining);
        Some(out)
    }

    /// Drop the older half of the buffered audio using the recorded half mark, or clear
    /// everything when no mark exists. Returns the number of samples dropped.
    pub fn drop_older_half(&self) -> usize {
        let mut g = self.lock();
        match g.half_mark.take() {
            Some(mark) => {
                let n = mark.min(g.queue.len()) / self.channels * self.channels;
                g.queue.drain(..n);
                n
            }
            None => {
                let n = g.queue.len();
                g.queue.clear();
                n
            }
        }
    }

    pub fn clear(&self) {
        let mut g = self.lock();
        g.queue.clear();
        g.half_mark = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.capacity / 8).max(self.channels * 16);
        if queued > 0 && queued < threshold {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_millis(0))
                .as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::debug!(
                    queued_samples = queued,
                    threshold_samples = threshold,
                    "station buffer low watermark"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 192_000);
    }

    #[test]
    fn push_stops_at_capacity_on_frame_boundary() {
        let buf = StationBuffer::new(10, 2, Duration::from_secs(1));
        assert_eq!(buf.capacity(), 20);
        assert_eq!(buf.push(&[0.0; 15]), 14);
        assert_eq!(buf.push(&[0.0; 15]), 6);
        assert_eq!(buf.push(&[0.0; 2]), 0);
        assert_eq!(buf.free_samples(), 0);
    }

    #[test]
    fn pop_returns_whole_frames_in_order() {
        let buf = StationBuffer::new(100, 2, Duration::from_secs(1));
        buf.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(buf.pop(2).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buf.pop(8).unwrap(), vec![5.0, 6.0]);
        assert!(buf.pop(8).is_none());
    }

    #[test]
    fn buffered_duration_counts_frames() {
        let buf = StationBuffer::new(1000, 2, Duration::from_secs(2));
        buf.push(&vec![0.0; 1000]);
        assert_eq!(buf.buffered_duration(), Duration::from_millis(500));
    }

    #[test]
    fn nearly_full_under_a_quarter_second_free() {
        let buf = StationBuffer::new(100, 1, Duration::from_secs(1));
        buf.push(&vec![0.0; 70]);
        assert!(!buf.is_nearly_full());
        buf.push(&vec![0.0; 10]);
        assert!(buf.is_nearly_full());
    }

    #[test]
    fn drop_older_half_uses_recorded_mark() {
        let buf = StationBuffer::new(100, 1, Duration::from_secs(1));
        buf.push(&vec![0.0; 60]);
        buf.push(&vec![1.0; 30]);
        assert_eq!(buf.drop_older_half(), 60);
        assert_eq!(buf.len_samples(), 30);

        buf.push(&vec![0.0; 40]);
        assert_eq!(buf.drop_older_half(), 70);
        assert_eq!(buf.len_samples(), 0);
    }

    #[test]
    fn drop_without_mark_clears_everything() {
        let buf = StationBuffer::new(100, 1, Duration::from_secs(1));
        buf.push(&vec![0.0; 30]);
        assert_eq!(buf.drop_older_half(), 30);
        assert_eq!(buf.len_samples(), 0);
    }

    #[test]
    fn drop_older_half_keeps_newer_samples() {
        let buf = StationBuffer::new(100, 1, Duration::from_secs(1));
        buf.push(&vec![0.0; 55]);
        buf.pop(5);
        buf.push(&vec![1.0; 40]);
        assert_eq!(buf.drop_older_half(), 55);
        let rest = buf.pop(100).unwrap();
        assert_eq!(rest.len(), 35);
        assert!(rest.iter().all(|s| *s == 1.0));
    }
}
