//! Pull-style audio sources.
//!
//! Stations pull decoded interleaved `f32` chunks from an [`AudioSource`]. The Symphonia
//! backed [`SymphoniaSource`] covers files and network streams; [`LoopedSource`] and
//! [`ConcatenatedSource`] compose other sources.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::error::SourceError;

/// Extensions the engine decodes.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "flac", "wav"];

/// Sample layout of a decoded stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub rate: u32,
    pub channels: usize,
}

impl StreamSpec {
    pub fn new(rate: u32, channels: usize) -> Self {
        Self { rate, channels }
    }

    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.rate.max(1) as f64)
    }

    pub fn duration_to_frames(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.rate as f64) as u64
    }
}

/// A decoded audio stream read chunk by chunk.
pub trait AudioSource: Send {
    fn spec(&self) -> StreamSpec;

    /// Total length, when the container reports it.
    fn total_time(&self) -> Option<Duration>;

    fn position(&self) -> Duration;

    fn seek(&mut self, to: Duration) -> Result<(), SourceError>;

    /// Next chunk of interleaved samples, `Ok(None)` at end of source.
    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError>;
}

impl<T: AudioSource + ?Sized> AudioSource for Box<T> {
    fn spec(&self) -> StreamSpec {
        (**self).spec()
    }

    fn total_time(&self) -> Option<Duration> {
        (**self).total_time()
    }

    fn position(&self) -> Duration {
        (**self).position()
    }

    fn seek(&mut self, to: Duration) -> Result<(), SourceError> {
        (**self).seek(to)
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
        (**self).next_chunk()
    }
}

/// `true` when the file extension is one the engine decodes.
pub fn is_supported_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Symphonia probe + decoder over any [`MediaSource`].
pub struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    spec: StreamSpec,
    time_base: Option<TimeBase>,
    total_frames: Option<u64>,
    position_frames: u64,
}

impl SymphoniaSource {
    /// Open a local file, rejecting extensions outside [`AUDIO_EXTENSIONS`].
    pub fn open_path(path: &Path) -> Result<Self, SourceError> {
        if !is_supported_audio(path) {
            return Err(SourceError::Unsupported(format!("{}", path.display())));
        }
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SourceError::NotFound(format!("{}", path.display())),
            _ => SourceError::Io(e),
        })?;
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let mut source = Self::from_media_source(Box::new(file), hint)?;
        if source.total_frames.is_none() {
            source.scan_total_frames()?;
        }
        Ok(source)
    }

    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self, SourceError> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| SourceError::Unsupported("no default audio track".into()))?;
        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let channels = codec_params
            .channels
            .ok_or_else(|| SourceError::Unsupported("unknown channel layout".into()))?
            .count();
        let rate = codec_params
            .sample_rate
            .ok_or_else(|| SourceError::Unsupported("unknown sample rate".into()))?;

        let decoder =
            symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            spec: StreamSpec::new(rate, channels),
            time_base: codec_params.time_base,
            total_frames: codec_params.n_frames,
            position_frames: 0,
        })
    }

    /// Count frames by walking every packet, then rewind. Used for files whose headers
    /// carry no length (MP3 without a Xing/Info frame).
    fn scan_total_frames(&mut self) -> Result<(), SourceError> {
        let mut ts = 0u64;
        loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => {
                    ts = ts.max(packet.ts() + packet.dur());
                }
                Ok(_) => {}
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.total_frames = Some(self.ts_to_frames(ts));
        self.seek(Duration::ZERO)
    }

    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                let secs = time.seconds as f64 + time.frac;
                (secs * self.spec.rate as f64) as u64
            }
            None => ts,
        }
    }
}

impl AudioSource for SymphoniaSource {
    fn spec(&self) -> StreamSpec {
        self.spec
    }

    fn total_time(&self) -> Option<Duration> {
        self.total_frames
            .map(|frames| self.spec.frames_to_duration(frames))
    }

    fn position(&self) -> Duration {
        self.spec.frames_to_duration(self.position_frames)
    }

    fn seek(&mut self, to: Duration) -> Result<(), SourceError> {
        let time = Time::new(to.as_secs(), to.subsec_nanos() as f64 / 1e9);
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        )?;
        self.decoder.reset();
        self.position_frames = self.ts_to_frames(seeked.actual_ts);
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = self.decoder.decode(&packet)?;
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            self.position_frames += frames as u64;
            return Ok(Some(sample_buf.samples().to_vec()));
        }
    }
}

/// Adapts a forward-only reader (an HTTP body) to Symphonia's [`MediaSource`].
pub struct UnseekableSource<R> {
    inner: Mutex<R>,
}

impl<R: Read + Send> UnseekableSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<R: Read + Send> Read for UnseekableSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .read(buf)
    }
}

impl<R: Read + Send> Seek for UnseekableSource<R> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream is not seekable"))
    }
}

impl<R: Read + Send> MediaSource for UnseekableSource<R> {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Restarts the wrapped source from zero whenever it ends.
pub struct LoopedSource<S> {
    inner: S,
}

impl<S: AudioSource> LoopedSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: AudioSource> AudioSource for LoopedSource<S> {
    fn spec(&self) -> StreamSpec {
        self.inner.spec()
    }

    fn total_time(&self) -> Option<Duration> {
        self.inner.total_time()
    }

    fn position(&self) -> Duration {
        self.inner.position()
    }

    fn seek(&mut self, to: Duration) -> Result<(), SourceError> {
        let to = match self.inner.total_time() {
            Some(total) if !total.is_zero() => {
                Duration::from_nanos((to.as_nanos() % total.as_nanos()) as u64)
            }
            _ => to,
        };
        self.inner.seek(to)
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
        if let Some(chunk) = self.inner.next_chunk()? {
            return Ok(Some(chunk));
        }
        self.inner.seek(Duration::ZERO)?;
        // An empty file would otherwise loop forever.
        self.inner.next_chunk()
    }
}

/// Intro, mid and outro played back to back as one stream.
pub struct ConcatenatedSource {
    parts: Vec<Segment>,
    spec: StreamSpec,
}

struct Segment {
    source: Box<dyn AudioSource>,
    length: Duration,
    /// Sticky: once set, the segment is never read again.
    finished: bool,
}

impl ConcatenatedSource {
    /// All parts must share one [`StreamSpec`].
    pub fn new(
        intro: Option<Box<dyn AudioSource>>,
        mid: Box<dyn AudioSource>,
        outro: Option<Box<dyn AudioSource>>,
    ) -> Result<Self, SourceError> {
        let spec = mid.spec();
        let mut parts = Vec::with_capacity(3);
        for source in intro.into_iter().chain(Some(mid)).chain(outro) {
            if source.spec() != spec {
                return Err(SourceError::FormatMismatch(format!(
                    "{:?} differs from {:?}",
                    source.spec(),
                    spec
                )));
            }
            parts.push(Segment {
                length: source.total_time().unwrap_or(Duration::ZERO),
                source,
                finished: false,
            });
        }
        Ok(Self { parts, spec })
    }
}

impl AudioSource for ConcatenatedSource {
    fn spec(&self) -> StreamSpec {
        self.spec
    }

    fn total_time(&self) -> Option<Duration> {
        Some(self.parts.iter().map(|p| p.length).sum())
    }

    fn position(&self) -> Duration {
        self.parts
            .iter()
            .map(|p| {
                if p.finished {
                    p.length
                } else {
                    p.source.position().min(p.length)
                }
            })
            .sum()
    }

    fn seek(&mut self, to: Duration) -> Result<(), SourceError> {
        let mut remaining = to;
        for part in &mut self.parts {
            if remaining >= part.length {
                part.finished = true;
                remaining -= part.length;
                continue;
            }
            if !part.finished {
                part.source.seek(remaining)?;
            }
            remaining = Duration::ZERO;
        }
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
        for part in &mut self.parts {
            if part.finished {
                continue;
            }
            match part.source.next_chunk()? {
                Some(chunk) => return Ok(Some(chunk)),
                None => part.finished = true,
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory source producing a ramp of `frames` frames in chunks of `chunk` frames.
    pub(crate) struct FakeSource {
        pub(crate) spec: StreamSpec,
        pub(crate) frames: u64,
        pub(crate) chunk: u64,
        pub(crate) pos: u64,
        pub(crate) value: f32,
    }

    impl FakeSource {
        pub(crate) fn new(rate: u32, channels: usize, frames: u64, value: f32) -> Self {
            Self {
                spec: StreamSpec::new(rate, channels),
                frames,
                chunk: 10,
                pos: 0,
                value,
            }
        }
    }

    impl AudioSource for FakeSource {
        fn spec(&self) -> StreamSpec {
            self.spec
        }

        fn total_time(&self) -> Option<Duration> {
            Some(self.spec.frames_to_duration(self.frames))
        }

        fn position(&self) -> Duration {
            self.spec.frames_to_duration(self.pos)
        }

        fn seek(&mut self, to: Duration) -> Result<(), SourceError> {
            self.pos = self.spec.duration_to_frames(to).min(self.frames);
            Ok(())
        }

        fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
            let n = self.chunk.min(self.frames - self.pos);
            if n == 0 {
                return Ok(None);
            }
            self.pos += n;
            Ok(Some(vec![self.value; n as usize * self.spec.channels]))
        }
    }

    fn drain(source: &mut dyn AudioSource) -> Vec<f32> {
        let mut out = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            out.extend(chunk);
        }
        out
    }

    #[test]
    fn supported_extensions_are_case_insensitive() {
        assert!(is_supported_audio(Path::new("a/B.MP3")));
        assert!(is_supported_audio(Path::new("x.flac")));
        assert!(!is_supported_audio(Path::new("x.lnk")));
        assert!(!is_supported_audio(Path::new("noext")));
    }

    #[test]
    fn open_path_rejects_unknown_extension() {
        let err = SymphoniaSource::open_path(Path::new("/nowhere/track.txt")).err().unwrap();
        assert!(matches!(err, SourceError::Unsupported(_)));
    }

    #[test]
    fn open_path_reports_missing_file() {
        let err = SymphoniaSource::open_path(Path::new("/nowhere/track.mp3")).err().unwrap();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[test]
    fn unseekable_source_refuses_seek() {
        let mut src = UnseekableSource::new(io::Cursor::new(vec![1u8, 2, 3]));
        assert!(!src.is_seekable());
        assert!(src.seek(SeekFrom::Start(0)).is_err());
        let mut buf = Vec::new();
        src.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn looped_source_wraps_around() {
        let mut looped = LoopedSource::new(FakeSource::new(100, 1, 20, 1.0));
        let mut total = 0;
        for _ in 0..5 {
            total += looped.next_chunk().unwrap().unwrap().len();
        }
        assert_eq!(total, 50);
        looped.seek(Duration::from_millis(250)).unwrap();
        assert_eq!(looped.position(), Duration::from_millis(50));
    }

    #[test]
    fn concatenation_plays_parts_in_order() {
        let mut cat = ConcatenatedSource::new(
            Some(Box::new(FakeSource::new(100, 2, 10, 1.0))),
            Box::new(FakeSource::new(100, 2, 20, 2.0)),
            Some(Box::new(FakeSource::new(100, 2, 10, 3.0))),
        )
        .unwrap();
        assert_eq!(cat.total_time(), Some(Duration::from_millis(400)));
        let samples = drain(&mut cat);
        assert_eq!(samples.len(), 80);
        assert_eq!(samples[0], 1.0);
        assert_eq!(samples[20], 2.0);
        assert_eq!(samples[79], 3.0);
        assert_eq!(cat.position(), Duration::from_millis(400));
    }

    #[test]
    fn concatenation_rejects_mismatched_parts() {
        let err = ConcatenatedSource::new(
            Some(Box::new(FakeSource::new(48_000, 2, 10, 1.0))),
            Box::new(FakeSource::new(44_100, 2, 10, 1.0)),
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SourceError::FormatMismatch(_)));
    }

    #[test]
    fn seek_past_intro_marks_it_finished() {
        let mut cat = ConcatenatedSource::new(
            Some(Box::new(FakeSource::new(100, 1, 10, 1.0))),
            Box::new(FakeSource::new(100, 1, 20, 2.0)),
            None,
        )
        .unwrap();
        cat.seek(Duration::from_millis(150)).unwrap();
        assert_eq!(cat.position(), Duration::from_millis(150));
        let chunk = cat.next_chunk().unwrap().unwrap();
        assert_eq!(chunk[0], 2.0);

        // Seeking back does not revive the intro.
        cat.seek(Duration::ZERO).unwrap();
        assert_eq!(cat.next_chunk().unwrap().unwrap()[0], 2.0);
    }
}
