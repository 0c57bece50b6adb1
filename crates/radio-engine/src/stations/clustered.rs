use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::decode::{AudioSource, StreamSpec};
use crate::error::SourceError;
use crate::resample::SpecConverter;
use crate::rotation::Rotation;
use crate::station::{SourceContext, StationKind, StationSource};

use super::try_lock;

/// Every rotation item is converted to this layout so consecutive items can share one
/// station buffer.
pub const CLUSTER_SPEC: StreamSpec = StreamSpec {
    rate: 44_100,
    channels: 2,
};

/// A station assembled from split tracks and adverts.
///
/// The rotation lock is shared by the decode path (blocking, advances on end of item)
/// and the metadata refresh (try-lock, advances by wall clock), so only one of them
/// ever advances at a time.
pub struct ClusteredStation {
    rotation: Arc<Mutex<Rotation>>,
}

impl ClusteredStation {
    pub fn new(rotation: Rotation) -> Self {
        Self {
            rotation: Arc::new(Mutex::new(rotation)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Rotation> {
        self.rotation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn music_count(&self) -> usize {
        self.lock().music_count()
    }

    pub fn advert_count(&self) -> usize {
        self.lock().advert_count()
    }
}

impl StationSource for ClusteredStation {
    fn kind(&self) -> StationKind {
        StationKind::Clustered
    }

    fn buffer_target(&self, config: &EngineConfig) -> Duration {
        config.clustered_buffer
    }

    fn open(&self, _ctx: &SourceContext) -> Result<Box<dyn AudioSource>, SourceError> {
        let mut rotation = self.lock();
        if !rotation.sync_to_clock(Instant::now()) {
            return Err(SourceError::NotFound("nothing to play".into()));
        }
        let generation = rotation.generation();
        let from = rotation
            .stream_mut()
            .map(|s| s.spec())
            .unwrap_or(CLUSTER_SPEC);
        drop(rotation);
        Ok(Box::new(RotatingSource {
            rotation: self.rotation.clone(),
            converter: SpecConverter::new(from, CLUSTER_SPEC)?,
            generation,
        }))
    }

    fn refresh_meta_info(&self, ctx: &SourceContext) {
        let Some(mut rotation) = try_lock(&self.rotation) else {
            return;
        };
        if !rotation.has_broadcast_started() {
            rotation.start_broadcast();
        } else if !rotation.is_exhausted() && rotation.is_current_over(Instant::now()) {
            rotation.advance();
        }
        let meta = rotation.current().and_then(|c| c.metadata.clone());
        drop(rotation);
        ctx.publish(meta.map(Into::into));
    }
}

/// Endless stream over the rotation, normalised to [`CLUSTER_SPEC`].
struct RotatingSource {
    rotation: Arc<Mutex<Rotation>>,
    converter: SpecConverter,
    generation: u64,
}

impl AudioSource for RotatingSource {
    fn spec(&self) -> StreamSpec {
        CLUSTER_SPEC
    }

    fn total_time(&self) -> Option<Duration> {
        None
    }

    fn position(&self) -> Duration {
        let rotation = self.rotation.lock().unwrap_or_else(|e| e.into_inner());
        rotation
            .current()
            .map(|c| c.elapsed(Instant::now()).min(c.total_time))
            .unwrap_or_default()
    }

    fn seek(&mut self, to: Duration) -> Result<(), SourceError> {
        let mut rotation = self.rotation.lock().unwrap_or_else(|e| e.into_inner());
        match rotation.stream_mut() {
            Some(stream) => stream.seek(to),
            None => Err(SourceError::Seek("nothing playing".into())),
        }
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
        let mut rotation = self.rotation.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if rotation.generation() != self.generation {
                let from = match rotation.stream_mut() {
                    Some(stream) => stream.spec(),
                    None => return Ok(None),
                };
                self.converter = SpecConverter::new(from, CLUSTER_SPEC)?;
                self.generation = rotation.generation();
            }
            let Some(stream) = rotation.stream_mut() else {
                return Ok(None);
            };
            match stream.next_chunk() {
                Ok(Some(chunk)) => return self.converter.process(&chunk).map(Some),
                Ok(None) => {
                    let tail = self.converter.flush()?;
                    if !rotation.advance() {
                        return Ok((!tail.is_empty()).then_some(tail));
                    }
                    if !tail.is_empty() {
                        return Ok(Some(tail));
                    }
                }
                Err(e) if e.is_frame_error() => return Err(e),
                Err(e) => {
                    rotation.advance();
                    return Err(e);
                }
            }
        }
    }
}
