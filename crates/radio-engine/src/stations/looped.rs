use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::decode::{AudioSource, LoopedSource};
use crate::error::SourceError;
use crate::metadata::{IndexedMetaData, MetaData, lookup_indexed};
use crate::rotation::TrackOpener;
use crate::station::{SourceContext, StationKind, StationSource};

/// One file broadcast in an endless loop.
///
/// The loop runs on a virtual clock from the moment the station is loaded, starting at a
/// random offset, so tuning in lands wherever the "broadcast" is by now.
pub struct LoopedStation {
    path: PathBuf,
    tracks: Vec<IndexedMetaData>,
    file_tags: Option<MetaData>,
    opener: Arc<dyn TrackOpener>,
    loaded_at: Instant,
    initial_offset: Duration,
    total: OnceLock<Duration>,
}

impl LoopedStation {
    pub fn new(
        path: impl Into<PathBuf>,
        tracks: Vec<IndexedMetaData>,
        opener: Arc<dyn TrackOpener>,
        rng: &mut impl Rng,
    ) -> Self {
        let path = path.into();
        let total = OnceLock::new();
        match opener.open(&path).map(|s| s.total_time()) {
            Ok(Some(length)) if !length.is_zero() => {
                let _ = total.set(length);
            }
            Ok(_) => tracing::warn!(path = %path.display(), "file length unknown"),
            Err(e) => tracing::warn!(path = %path.display(), "could not probe file: {e}"),
        }
        let initial_offset = match total.get() {
            Some(length) => Duration::from_millis(rng.gen_range(0..length.as_millis().max(1) as u64)),
            None => Duration::ZERO,
        };
        let file_tags = if tracks.is_empty() {
            opener.read_tags(&path)
        } else {
            None
        };
        Self {
            path,
            tracks,
            file_tags,
            opener,
            loaded_at: Instant::now(),
            initial_offset,
            total,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_time(&self) -> Option<Duration> {
        self.total.get().copied()
    }

    /// Where the loop would be at `now` had it never stopped.
    pub fn position_at(&self, now: Instant) -> Duration {
        let virtual_time = self.initial_offset + now.saturating_duration_since(self.loaded_at);
        match self.total.get() {
            Some(total) if !total.is_zero() => {
                Duration::from_nanos((virtual_time.as_nanos() % total.as_nanos()) as u64)
            }
            _ => virtual_time,
        }
    }

    fn metadata_at(&self, position: Duration) -> Option<MetaData> {
        if self.tracks.is_empty() {
            return self.file_tags.clone();
        }
        lookup_indexed(&self.tracks, position).cloned()
    }
}

impl StationSource for LoopedStation {
    fn kind(&self) -> StationKind {
        StationKind::Looped
    }

    fn open(&self, _ctx: &SourceContext) -> Result<Box<dyn AudioSource>, SourceError> {
        let stream = self.opener.open(&self.path)?;
        if let Some(length) = stream.total_time().filter(|l| !l.is_zero()) {
            let _ = self.total.set(length);
        }
        let mut looped = LoopedSource::new(stream);
        looped.seek(self.position_at(Instant::now()))?;
        Ok(Box::new(looped))
    }

    fn refresh_meta_info(&self, ctx: &SourceContext) {
        let meta = self.metadata_at(self.position_at(Instant::now()));
        ctx.publish(meta.map(Into::into));
    }
}
