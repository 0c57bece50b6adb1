//! Now-playing metadata value types.
//!
//! All of these are immutable once built and cheap to clone. The station keeps the
//! latest value in a [`MetadataCell`], which only commits a new value when its display
//! form differs from the previous one.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Artist and title of a track. Either part may be missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaData {
    pub artist: Option<String>,
    pub track: Option<String>,
}

impl MetaData {
    /// Build from raw strings, trimming whitespace and treating blanks as missing.
    pub fn new(artist: Option<&str>, track: Option<&str>) -> Self {
        Self {
            artist: clean(artist),
            track: clean(track),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artist.is_none() && self.track.is_none()
    }
}

impl fmt::Display for MetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.artist, &self.track) {
            (Some(artist), Some(track)) => write!(f, "{artist} - {track}"),
            (None, Some(track)) => f.write_str(track),
            (Some(artist), None) => f.write_str(artist),
            (None, None) => Ok(()),
        }
    }
}

/// Metadata for a fixed window of a continuously looped file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedMetaData {
    pub meta: MetaData,
    pub start: Duration,
    pub end: Duration,
}

impl IndexedMetaData {
    /// Returns `None` when `start > end`.
    pub fn new(meta: MetaData, start: Duration, end: Duration) -> Option<Self> {
        (start <= end).then_some(Self { meta, start, end })
    }

    /// Windows are half-open: `start <= position < end`.
    pub fn contains(&self, position: Duration) -> bool {
        self.start <= position && position < self.end
    }
}

/// First window containing `position`, if any.
pub fn lookup_indexed(entries: &[IndexedMetaData], position: Duration) -> Option<&MetaData> {
    entries
        .iter()
        .find(|entry| entry.contains(position))
        .map(|entry| &entry.meta)
}

/// Title information recovered from an ICY stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMetaData {
    pub meta: MetaData,
    pub stream_title: String,
    pub stream_url: String,
}

impl StreamMetaData {
    /// Build from explicit artist/track (usually parsed from `StreamUrl`). When both are
    /// missing and the title holds exactly one `-`, they are split out of the title.
    pub fn new(
        artist: Option<&str>,
        track: Option<&str>,
        stream_title: impl Into<String>,
        stream_url: impl Into<String>,
    ) -> Self {
        let stream_title = stream_title.into();
        let mut meta = MetaData::new(artist, track);
        if meta.is_empty() {
            meta = split_title(&stream_title);
        }
        Self {
            meta,
            stream_title,
            stream_url: stream_url.into(),
        }
    }
}

impl fmt::Display for StreamMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.meta.is_empty() {
            f.write_str(self.stream_title.trim())
        } else {
            self.meta.fmt(f)
        }
    }
}

fn split_title(title: &str) -> MetaData {
    let mut parts = title.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(artist), Some(track), None) => MetaData::new(Some(artist), Some(track)),
        _ => MetaData::default(),
    }
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Metadata published by any station kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackMetaData {
    Local(MetaData),
    Stream(StreamMetaData),
}

impl TrackMetaData {
    pub fn display(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TrackMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackMetaData::Local(meta) => meta.fmt(f),
            TrackMetaData::Stream(meta) => meta.fmt(f),
        }
    }
}

impl From<MetaData> for TrackMetaData {
    fn from(meta: MetaData) -> Self {
        TrackMetaData::Local(meta)
    }
}

impl From<StreamMetaData> for TrackMetaData {
    fn from(meta: StreamMetaData) -> Self {
        TrackMetaData::Stream(meta)
    }
}

/// Lock-guarded "current metadata" slot of a station.
#[derive(Debug, Default)]
pub struct MetadataCell {
    current: Mutex<Option<TrackMetaData>>,
}

impl MetadataCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<TrackMetaData> {
        self.lock().clone()
    }

    /// Store `next` unless its display form equals the current one.
    ///
    /// Returns `true` when the value was committed.
    pub fn update(&self, next: Option<TrackMetaData>) -> bool {
        let mut current = self.lock();
        let old = current.as_ref().map(TrackMetaData::display).unwrap_or_default();
        let new = next.as_ref().map(TrackMetaData::display).unwrap_or_default();
        if old == new {
            return false;
        }
        *current = next;
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TrackMetaData>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
