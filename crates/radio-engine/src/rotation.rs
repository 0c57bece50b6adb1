//! Track rotation for clustered stations.
//!
//! Music is stored as [`TrackGroup`]s (optional intros, a mid part, optional outros)
//! and adverts as single files. Both queues are shuffled once at startup and then only
//! rotated: a finished item moves from the head to the tail, an item that fails to open
//! is dropped for good.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::decode::{AudioSource, ConcatenatedSource, SymphoniaSource};
use crate::error::SourceError;
use crate::logger::RadioLogger;
use crate::metadata::MetaData;
use crate::tags;

/// Percent chance of picking music over an advert when both are queued.
const MUSIC_WEIGHT: u32 = 60;

static PART_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*\((intro|mid|outro)[^)]*\)\s*$").expect("part marker regex")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Part {
    Intro,
    Mid,
    Outro,
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn classify(path: &Path) -> Part {
    let stem = file_stem(path);
    match PART_MARKER
        .captures(&stem)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .as_deref()
    {
        Some("intro") => Part::Intro,
        Some("outro") => Part::Outro,
        _ => Part::Mid,
    }
}

/// File stem with a trailing `(Intro…)`, `(Mid…)` or `(Outro…)` marker removed.
pub fn base_name_of(path: &Path) -> String {
    PART_MARKER.replace(&file_stem(path), "").into_owned()
}

/// The parts of one split music track.
#[derive(Clone, Debug)]
pub struct TrackGroup {
    base_name: String,
    pub intros: Vec<PathBuf>,
    pub mid: Option<PathBuf>,
    pub outros: Vec<PathBuf>,
}

impl TrackGroup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut group = Self {
            base_name: base_name_of(&path),
            intros: Vec::new(),
            mid: None,
            outros: Vec::new(),
        };
        group.add_path(path);
        group
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn is_file_part_of_this_track(&self, path: &Path) -> bool {
        base_name_of(path) == self.base_name
    }

    /// Files without a marker, or with `(Mid…)`, become the mid part. A second mid
    /// replaces the first.
    pub fn add_path(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        match classify(&path) {
            Part::Intro => self.intros.push(path),
            Part::Outro => self.outros.push(path),
            Part::Mid => {
                if let Some(old) = self.mid.replace(path) {
                    tracing::debug!(path = %old.display(), "mid part replaced");
                }
            }
        }
    }
}

/// Group files by base name, in first-seen order. Groups without a mid part are
/// left out.
pub fn group_tracks<I>(paths: I) -> Vec<TrackGroup>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut groups: Vec<TrackGroup> = Vec::new();
    for path in paths {
        match groups.iter_mut().find(|g| g.is_file_part_of_this_track(&path)) {
            Some(group) => group.add_path(path),
            None => groups.push(TrackGroup::new(path)),
        }
    }
    groups.retain(|g| {
        if g.mid.is_none() {
            tracing::warn!(track = %g.base_name, "track has no mid part, skipped");
        }
        g.mid.is_some()
    });
    groups
}

/// The item the rotation is currently broadcasting.
#[derive(Clone, Debug)]
pub struct CurrentTrackInfo {
    /// Mid part for music, the file itself for adverts.
    pub path: PathBuf,
    pub is_advert: bool,
    pub total_time: Duration,
    pub started_at: Instant,
    pub metadata: Option<MetaData>,
}

impl CurrentTrackInfo {
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn is_over(&self, now: Instant) -> bool {
        self.elapsed(now) > self.total_time
    }
}

/// Opens rotation items; swapped out in tests.
pub trait TrackOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn AudioSource>, SourceError>;
    fn read_tags(&self, path: &Path) -> Option<MetaData>;
}

/// Decodes files with symphonia and reads tags with lofty.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileOpener;

impl TrackOpener for FileOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn AudioSource>, SourceError> {
        Ok(Box::new(SymphoniaSource::open_path(path)?))
    }

    fn read_tags(&self, path: &Path) -> Option<MetaData> {
        tags::read_track_tags(path)
    }
}

struct Opened {
    stream: Box<dyn AudioSource>,
    info: CurrentTrackInfo,
}

/// Queue state plus the open stream of the current item.
pub struct Rotation {
    station: String,
    logger: Arc<dyn RadioLogger>,
    opener: Arc<dyn TrackOpener>,
    music: VecDeque<TrackGroup>,
    adverts: VecDeque<PathBuf>,
    current: Option<CurrentTrackInfo>,
    stream: Option<Box<dyn AudioSource>>,
    generation: u64,
    broadcast_started: bool,
    exhausted_logged: bool,
    rng: StdRng,
}

impl Rotation {
    pub fn new(
        station: impl Into<String>,
        logger: Arc<dyn RadioLogger>,
        opener: Arc<dyn TrackOpener>,
        mut music: Vec<TrackGroup>,
        mut adverts: Vec<PathBuf>,
        mut rng: StdRng,
    ) -> Self {
        music.shuffle(&mut rng);
        adverts.shuffle(&mut rng);
        Self {
            station: station.into(),
            logger,
            opener,
            music: music.into(),
            adverts: adverts.into(),
            current: None,
            stream: None,
            generation: 0,
            broadcast_started: false,
            exhausted_logged: false,
            rng,
        }
    }

    pub fn music_count(&self) -> usize {
        self.music.len()
    }

    pub fn advert_count(&self) -> usize {
        self.adverts.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.music.is_empty() && self.adverts.is_empty()
    }

    pub fn current(&self) -> Option<&CurrentTrackInfo> {
        self.current.as_ref()
    }

    /// Bumped every time a new item is opened.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stream_mut(&mut self) -> Option<&mut Box<dyn AudioSource>> {
        self.stream.as_mut()
    }

    pub fn has_broadcast_started(&self) -> bool {
        self.broadcast_started
    }

    /// `true` when there is no current item or its wall-clock time is up.
    pub fn is_current_over(&self, now: Instant) -> bool {
        self.current.as_ref().map(|c| c.is_over(now)).unwrap_or(true)
    }

    /// First advance of the station's life: land somewhere inside the first item so the
    /// broadcast appears to have been running already.
    pub fn start_broadcast(&mut self) -> bool {
        self.broadcast_started = true;
        if !self.advance() {
            return false;
        }
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        let total_ms = current.total_time.as_millis() as u64;
        if total_ms == 0 {
            return true;
        }
        let offset = Duration::from_millis(self.rng.gen_range(0..total_ms));
        if let Some(stream) = self.stream.as_mut() {
            match stream.seek(offset) {
                Ok(()) => {
                    let now = Instant::now();
                    current.started_at = now.checked_sub(offset).unwrap_or(now);
                }
                Err(e) => {
                    tracing::debug!(station = %self.station, path = %current.path.display(), "start offset seek failed: {e}");
                }
            }
        }
        true
    }

    /// Make the open stream match the broadcast clock: advance if the current item is
    /// over, otherwise seek to its elapsed time. Returns `false` when nothing can play.
    pub fn sync_to_clock(&mut self, now: Instant) -> bool {
        if self.is_current_over(now) || self.stream.is_none() {
            return self.advance();
        }
        let (Some(current), Some(stream)) = (self.current.as_ref(), self.stream.as_mut()) else {
            return false;
        };
        let elapsed = current.elapsed(now);
        if let Err(e) = stream.seek(elapsed) {
            tracing::debug!(station = %self.station, path = %current.path.display(), "broadcast seek failed: {e}");
        }
        true
    }

    /// Requeue the finished item and open the next one.
    ///
    /// Music wins a weighted coin flip when both queues have items. Candidates that
    /// fail to open are dropped from their queue and selection retries until something
    /// opens or both queues are empty.
    pub fn advance(&mut self) -> bool {
        self.requeue_finished();
        self.current = None;
        self.stream = None;

        while !self.is_exhausted() {
            let pick_music = !self.music.is_empty()
                && (self.rng.gen_range(0..100) < MUSIC_WEIGHT || self.adverts.is_empty());
            let attempt = if pick_music {
                self.open_music()
            } else {
                self.open_advert()
            };
            match attempt {
                Ok(opened) => {
                    tracing::debug!(
                        station = %self.station,
                        path = %opened.info.path.display(),
                        advert = opened.info.is_advert,
                        "rotation advanced"
                    );
                    self.current = Some(opened.info);
                    self.stream = Some(opened.stream);
                    self.generation += 1;
                    self.exhausted_logged = false;
                    return true;
                }
                Err((path, e)) => {
                    if pick_music {
                        self.music.pop_front();
                    } else {
                        self.adverts.pop_front();
                    }
                    self.logger.log(format_args!(
                        "Failed to open track '{}' for radio '{}': {e}",
                        path.display(),
                        self.station
                    ));
                }
            }
        }

        if !self.exhausted_logged {
            self.exhausted_logged = true;
            self.logger.log(format_args!(
                "Failed to find any track to open for radio '{}', nothing to play",
                self.station
            ));
        }
        false
    }

    fn requeue_finished(&mut self) {
        match self.current.as_ref().map(|c| c.is_advert) {
            Some(true) => self.adverts.rotate_left(1.min(self.adverts.len())),
            Some(false) => self.music.rotate_left(1.min(self.music.len())),
            None => {}
        }
    }

    fn open_music(&mut self) -> Result<Opened, (PathBuf, SourceError)> {
        let Some(group) = self.music.front().cloned() else {
            return Err((PathBuf::new(), SourceError::NotFound("music queue empty".into())));
        };
        let Some(mid_path) = group.mid.clone() else {
            return Err((
                PathBuf::from(group.base_name()),
                SourceError::NotFound("track has no mid part".into()),
            ));
        };
        let intro_path = group.intros.choose(&mut self.rng).cloned();
        let outro_path = group.outros.choose(&mut self.rng).cloned();

        let intro = intro_path.as_deref().map(|p| self.open_path(p)).transpose()?;
        let mid = self.open_path(&mid_path)?;
        let outro = outro_path.as_deref().map(|p| self.open_path(p)).transpose()?;
        let stream =
            ConcatenatedSource::new(intro, mid, outro).map_err(|e| (mid_path.clone(), e))?;

        let info = CurrentTrackInfo {
            total_time: stream.total_time().unwrap_or_default(),
            metadata: self.opener.read_tags(&mid_path),
            path: mid_path,
            is_advert: false,
            started_at: Instant::now(),
        };
        Ok(Opened {
            stream: Box::new(stream),
            info,
        })
    }

    fn open_advert(&mut self) -> Result<Opened, (PathBuf, SourceError)> {
        let Some(path) = self.adverts.front().cloned() else {
            return Err((PathBuf::new(), SourceError::NotFound("advert queue empty".into())));
        };
        let stream = self.open_path(&path)?;
        let info = CurrentTrackInfo {
            total_time: stream.total_time().unwrap_or_default(),
            metadata: None,
            path,
            is_advert: true,
            started_at: Instant::now(),
        };
        Ok(Opened { stream, info })
    }

    fn open_path(&self, path: &Path) -> Result<Box<dyn AudioSource>, (PathBuf, SourceError)> {
        self.opener
            .open(path)
            .map_err(|e| (path.to_path_buf(), e))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decode::tests::FakeSource;
    use crate::logger::RecordingLogger;
    use rand::SeedableRng;
    use std::collections::{HashMap, HashSet};

    /// Opens any path as a short fake stream unless its file name contains "broken".
    /// Files under `hi-res/` open at 48 kHz.
    pub(crate) struct FakeOpener {
        pub(crate) frames: u64,
    }

    impl TrackOpener for FakeOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn AudioSource>, SourceError> {
            let name = path.to_string_lossy();
            if name.contains("broken") {
                return Err(SourceError::NotFound(name.into_owned()));
            }
            let rate = if name.starts_with("hi-res/") { 48_000 } else { 1000 };
            Ok(Box::new(FakeSource::new(rate, 2, self.frames, 0.2)))
        }

        fn read_tags(&self, path: &Path) -> Option<MetaData> {
            Some(MetaData::new(Some("Artist"), Some(&base_name_of(path))))
        }
    }

    pub(crate) fn rotation(
        music: &[&str],
        adverts: &[&str],
        logger: Arc<RecordingLogger>,
        seed: u64,
    ) -> Rotation {
        Rotation::new(
            "Test FM",
            logger,
            Arc::new(FakeOpener { frames: 1000 }),
            group_tracks(music.iter().map(PathBuf::from)),
            adverts.iter().map(PathBuf::from).collect(),
            StdRng::seed_from_u64(seed),
        )
    }

    #[test]
    fn parts_share_a_group_by_base_name() {
        let group = TrackGroup::new("Song(Intro).mp3");
        assert!(group.is_file_part_of_this_track(Path::new("Song.mp3")));
        assert!(group.is_file_part_of_this_track(Path::new("Song(Outro 2).mp3")));
        assert!(group.is_file_part_of_this_track(Path::new("dir/Song (Mid).ogg")));
        assert!(!group.is_file_part_of_this_track(Path::new("OtherSong.mp3")));
    }

    #[test]
    fn grouping_classifies_parts() {
        let groups = group_tracks(
            [
                "a/Song (Intro 1).mp3",
                "a/Other.mp3",
                "a/Song.mp3",
                "a/Song (intro 2).mp3",
                "a/Song (Outro).mp3",
                "a/Lonely (Intro).mp3",
            ]
            .into_iter()
            .map(PathBuf::from),
        );
        assert_eq!(groups.len(), 2);
        let song = &groups[0];
        assert_eq!(song.base_name(), "Song");
        assert_eq!(song.intros.len(), 2);
        assert_eq!(song.mid.as_deref(), Some(Path::new("a/Song.mp3")));
        assert_eq!(song.outros, vec![PathBuf::from("a/Song (Outro).mp3")]);
        assert_eq!(groups[1].base_name(), "Other");
    }

    #[test]
    fn every_item_plays_once_before_any_repeats() {
        let logger = Arc::new(RecordingLogger::default());
        let music = ["m1.mp3", "m2.mp3", "m3.mp3", "m4.mp3"];
        let adverts = ["ad1.mp3", "ad2.mp3"];
        let mut rot = rotation(&music, &adverts, logger, 7);

        let mut music_seen = Vec::new();
        let mut advert_seen = Vec::new();
        for _ in 0..60 {
            assert!(rot.advance());
            let current = rot.current().unwrap();
            if current.is_advert {
                advert_seen.push(current.path.clone());
            } else {
                music_seen.push(current.path.clone());
            }
        }

        for (seen, count) in [(&music_seen, music.len()), (&advert_seen, adverts.len())] {
            assert!(seen.len() >= count);
            for window in seen.chunks(count) {
                let unique: HashSet<_> = window.iter().collect();
                assert_eq!(unique.len(), window.len(), "repeat inside {window:?}");
            }
        }
    }

    #[test]
    fn music_is_picked_about_sixty_percent_of_the_time() {
        let logger = Arc::new(RecordingLogger::default());
        let mut rot = rotation(&["m1.mp3", "m2.mp3"], &["ad.mp3"], logger, 42);
        let mut counts: HashMap<bool, u32> = HashMap::new();
        for _ in 0..2000 {
            assert!(rot.advance());
            *counts.entry(rot.current().unwrap().is_advert).or_default() += 1;
        }
        let music = counts.get(&false).copied().unwrap_or(0);
        assert!((1050..1350).contains(&music), "music picked {music} times");
    }

    #[test]
    fn failed_items_are_dropped_and_logged() {
        let logger = Arc::new(RecordingLogger::default());
        let mut rot = rotation(&["ok.mp3", "broken.mp3"], &["broken-ad.mp3"], logger.clone(), 3);
        for _ in 0..20 {
            assert!(rot.advance());
            assert_eq!(rot.current().unwrap().path, PathBuf::from("ok.mp3"));
        }
        assert_eq!(rot.music_count(), 1);
        assert_eq!(rot.advert_count(), 0);
        assert!(logger.contains("Failed to open track 'broken.mp3' for radio 'Test FM'"));
        assert!(logger.contains("Failed to open track 'broken-ad.mp3' for radio 'Test FM'"));
    }

    #[test]
    fn exhausted_rotation_logs_once() {
        let logger = Arc::new(RecordingLogger::default());
        let mut rot = rotation(&["broken.mp3"], &[], logger.clone(), 1);
        assert!(!rot.advance());
        assert!(!rot.advance());
        assert!(rot.is_exhausted());
        assert!(rot.current().is_none());
        let nothing = logger
            .lines()
            .iter()
            .filter(|l| l.contains("nothing to play"))
            .count();
        assert_eq!(nothing, 1);
    }

    #[test]
    fn mixed_formats_inside_a_group_fail_to_open() {
        let logger = Arc::new(RecordingLogger::default());
        let mut rot = rotation(&["hi-res/Song (Intro).mp3", "Song.mp3"], &[], logger.clone(), 5);
        assert!(!rot.advance());
        assert!(logger.contains("Failed to open track 'Song.mp3'"));
    }

    #[test]
    fn music_metadata_comes_from_mid_and_adverts_have_none() {
        let logger = Arc::new(RecordingLogger::default());
        let mut rot = rotation(&["Song (Intro).mp3", "Song.mp3"], &["ad.mp3"], logger, 11);
        let mut saw_music = false;
        let mut saw_advert = false;
        for _ in 0..20 {
            rot.advance();
            let current = rot.current().unwrap();
            if current.is_advert {
                assert!(current.metadata.is_none());
                saw_advert = true;
            } else {
                assert_eq!(current.metadata.as_ref().unwrap().to_string(), "Artist - Song");
                assert_eq!(current.total_time, Duration::from_secs(2));
                saw_music = true;
            }
        }
        assert!(saw_music && saw_advert);
    }

    #[test]
    fn start_broadcast_backdates_the_first_item() {
        let logger = Arc::new(RecordingLogger::default());
        let mut rot = rotation(&["m1.mp3"], &[], logger, 9);
        assert!(!rot.has_broadcast_started());
        assert!(rot.start_broadcast());
        assert!(rot.has_broadcast_started());
        let now = Instant::now();
        let current = rot.current().unwrap();
        let elapsed = current.elapsed(now);
        assert!(elapsed < current.total_time);
        let position = rot.stream_mut().unwrap().position();
        let drift = elapsed.abs_diff(position);
        assert!(drift < Duration::from_millis(50), "drift {drift:?}");
    }

    #[test]
    fn sync_to_clock_advances_only_when_over() {
        let logger = Arc::new(RecordingLogger::default());
        let mut rot = rotation(&["m1.mp3", "m2.mp3"], &[], logger, 2);
        assert!(rot.sync_to_clock(Instant::now()));
        let generation = rot.generation();
        assert!(rot.sync_to_clock(Instant::now()));
        assert_eq!(rot.generation(), generation);
        let later = Instant::now() + Duration::from_secs(5);
        assert!(rot.sync_to_clock(later));
        assert_eq!(rot.generation(), generation + 1);
    }
}
