//! Station directory loading.
//!
//! The root holds one folder per station, ordered by folder name. What a folder becomes
//! depends on its contents:
//! - a playlist whose first entry is an HTTP(S) URL: a network station
//! - any other playlist: a clustered station over its entries
//! - exactly one audio file: a looped station
//! - several audio files: a clustered station
//!
//! An `[adverts]` folder (inside the station folder, else at the root) feeds clustered
//! stations. An optional `station.toml` names the station, sets its volume and lists
//! time-indexed tracks for looped stations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Deserialize;

use crate::context::RadioContext;
use crate::decode::is_supported_audio;
use crate::metadata::{IndexedMetaData, MetaData};
use crate::rotation::{FileOpener, Rotation, TrackOpener, group_tracks};
use crate::station::{Station, StationSource};
use crate::stations::{ClusteredStation, LoopedStation, NetworkStation};

pub const STATION_CONFIG_FILE: &str = "station.toml";
pub const ADVERTS_DIR: &str = "[adverts]";
pub const PLAYLIST_EXTENSIONS: &[&str] = &["m3u", "m3u8", "pls"];

static PLS_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^File\d+=(.*)$").expect("pls entry regex"));

/// Per-station settings from `station.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct StationConfig {
    /// Display name (defaults to the folder name).
    pub name: Option<String>,
    /// Station volume, 1.0 by default.
    pub volume: Option<f32>,
    /// Time-indexed metadata for looped stations.
    #[serde(default)]
    pub tracks: Vec<TrackConfig>,
}

/// One `[[tracks]]` entry.
#[derive(Debug, Deserialize)]
pub struct TrackConfig {
    pub artist: Option<String>,
    pub track: Option<String>,
    pub start: TimeValue,
    pub end: TimeValue,
}

/// Seconds, or `"m:ss"` / `"h:mm:ss"`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Seconds(f64),
    Text(String),
}

impl TimeValue {
    pub fn to_duration(&self) -> Option<Duration> {
        match self {
            TimeValue::Seconds(s) if s.is_finite() && *s >= 0.0 => Some(Duration::from_secs_f64(*s)),
            TimeValue::Seconds(_) => None,
            TimeValue::Text(text) => parse_time(text),
        }
    }
}

/// Parse `"90"`, `"1:30"`, `"1:01:30"` or `"1:30.5"`.
pub fn parse_time(text: &str) -> Option<Duration> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let last = parts.len() - 1;
    let mut seconds = 0.0f64;
    for (i, part) in parts.iter().enumerate() {
        let value: f64 = part.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 || (i < last && value.fract() != 0.0) {
            return None;
        }
        seconds = seconds * 60.0 + value;
    }
    Some(Duration::from_secs_f64(seconds))
}

impl StationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<StationConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// `station.toml` from `folder`, or defaults when there is none.
    pub fn load_from_folder(folder: &Path) -> Result<Self> {
        let path = folder.join(STATION_CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn indexed_tracks(&self) -> Result<Vec<IndexedMetaData>> {
        self.tracks
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let start = t
                    .start
                    .to_duration()
                    .ok_or_else(|| anyhow!("track {}: invalid start {:?}", i + 1, t.start))?;
                let end = t
                    .end
                    .to_duration()
                    .ok_or_else(|| anyhow!("track {}: invalid end {:?}", i + 1, t.end))?;
                let meta = MetaData::new(t.artist.as_deref(), t.track.as_deref());
                IndexedMetaData::new(meta, start, end)
                    .ok_or_else(|| anyhow!("track {}: start is after end", i + 1))
            })
            .collect()
    }
}

/// What a station folder turns into.
#[derive(Debug, PartialEq)]
pub enum StationPlan {
    Network { url: String },
    Looped { path: PathBuf },
    Clustered { files: Vec<PathBuf>, adverts: Vec<PathBuf> },
}

pub fn is_playlist(path: &Path) -> bool {
    has_extension(path, PLAYLIST_EXTENSIONS)
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn is_url(entry: &str) -> bool {
    let lower = entry.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_adverts_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.eq_ignore_ascii_case(ADVERTS_DIR))
        .unwrap_or(false)
}

/// Regular files directly inside `dir`, sorted by path.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {:?}", dir))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Audio files inside `dir`; empty when the folder does not exist.
pub fn audio_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(sorted_files(dir)?
        .into_iter()
        .filter(|p| is_supported_audio(p))
        .collect())
}

/// Entries of an M3U (skipping blank and `#` lines) or PLS (`FileN=`) playlist.
pub fn read_playlist(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read playlist {:?}", path))?;
    let raw = raw.trim_start_matches('\u{feff}');
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let entries = match ext.as_str() {
        "pls" => read_pls(raw),
        _ => read_m3u(raw),
    };
    Ok(entries)
}

pub fn read_m3u(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn read_pls(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| PLS_ENTRY.captures(l.trim()))
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|e| !e.is_empty())
        .collect()
}

/// Decide what `folder` becomes. `Ok(None)` means nothing playable.
pub fn plan_station(
    folder: &Path,
    shared_adverts: &[PathBuf],
    logger: &dyn crate::logger::RadioLogger,
) -> Result<Option<StationPlan>> {
    let files = sorted_files(folder)?;
    let playlists: Vec<&PathBuf> = files.iter().filter(|p| is_playlist(p)).collect();
    let audio: Vec<PathBuf> = files
        .iter()
        .filter(|p| is_supported_audio(p))
        .cloned()
        .collect();

    let adverts = || -> Result<Vec<PathBuf>> {
        let local = folder.join(ADVERTS_DIR);
        if local.is_dir() {
            audio_files_in(&local)
        } else {
            Ok(shared_adverts.to_vec())
        }
    };

    if let Some(playlist) = playlists.first() {
        if playlists.len() > 1 {
            logger.log(format_args!(
                "{} playlists found in '{}', using '{}' and ignoring the rest",
                playlists.len(),
                folder.display(),
                playlist.display()
            ));
        }
        let entries = read_playlist(playlist)?;
        let Some(first) = entries.first() else {
            logger.log(format_args!("Playlist '{}' is empty", playlist.display()));
            return Ok(None);
        };
        if is_url(first) {
            return Ok(Some(StationPlan::Network {
                url: first.trim().to_string(),
            }));
        }
        let mut files = Vec::new();
        for entry in &entries {
            if is_url(entry) {
                logger.log(format_args!("Skipping URL '{entry}' in a local playlist"));
                continue;
            }
            let path = Path::new(entry);
            let path = if path.is_relative() {
                folder.join(path)
            } else {
                path.to_path_buf()
            };
            if path.is_file() {
                files.push(path);
            } else {
                logger.log(format_args!("Skipping file '{}'. File not found", path.display()));
            }
        }
        return Ok(Some(StationPlan::Clustered {
            files,
            adverts: adverts()?,
        }));
    }

    match audio.len() {
        0 => Ok(None),
        1 => Ok(audio.into_iter().next().map(|path| StationPlan::Looped { path })),
        _ => Ok(Some(StationPlan::Clustered {
            files: audio,
            adverts: adverts()?,
        })),
    }
}

/// Build the station for one folder. `Ok(None)` when the folder has nothing playable.
pub fn load_station(
    folder: &Path,
    shared_adverts: &[PathBuf],
    ctx: &Arc<RadioContext>,
    opener: &Arc<dyn TrackOpener>,
    rng: &mut StdRng,
) -> Result<Option<Station>> {
    let logger = ctx.logger().as_ref();
    let Some(plan) = plan_station(folder, shared_adverts, logger)? else {
        logger.log(format_args!(
            "Skipped folder '{}': nothing playable",
            folder.display()
        ));
        return Ok(None);
    };
    let config = StationConfig::load_from_folder(folder)?;
    let name = config.name.clone().unwrap_or_else(|| {
        folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| folder.display().to_string())
    });
    let volume = config.volume.unwrap_or(1.0);

    let source: Arc<dyn StationSource> = match plan {
        StationPlan::Network { url } => {
            logger.log(format_args!("Added online radio '{name}' ({url})"));
            Arc::new(NetworkStation::new(url))
        }
        StationPlan::Looped { path } => {
            let tracks = config.indexed_tracks()?;
            logger.log(format_args!(
                "Added single-track radio '{name}' with {} indexed tracks",
                tracks.len()
            ));
            Arc::new(LoopedStation::new(path, tracks, opener.clone(), rng))
        }
        StationPlan::Clustered { files, adverts } => {
            let groups = group_tracks(files);
            let rotation = Rotation::new(
                name.clone(),
                ctx.logger().clone(),
                opener.clone(),
                groups,
                adverts,
                StdRng::seed_from_u64(rng.r#gen()),
            );
            logger.log(format_args!(
                "Added clustered radio station '{name}' with {} music tracks and {} adverts",
                rotation.music_count(),
                rotation.advert_count()
            ));
            Arc::new(ClusteredStation::new(rotation))
        }
    };
    Ok(Some(Station::new(name, folder, volume, source, ctx.clone())))
}

/// Load every station under `root`, ordered by folder name. Broken folders are logged
/// and skipped.
pub fn load_stations(root: &Path, ctx: &Arc<RadioContext>) -> Result<Vec<Station>> {
    let opener: Arc<dyn TrackOpener> = Arc::new(FileOpener);
    load_stations_with(root, ctx, &opener, &mut StdRng::from_entropy())
}

pub fn load_stations_with(
    root: &Path,
    ctx: &Arc<RadioContext>,
    opener: &Arc<dyn TrackOpener>,
    rng: &mut StdRng,
) -> Result<Vec<Station>> {
    let mut folders = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("read station root {:?}", root))? {
        let path = entry?.path();
        if path.is_dir() && !is_adverts_dir(&path) {
            folders.push(path);
        }
    }
    folders.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));

    let shared_adverts = audio_files_in(&root.join(ADVERTS_DIR))?;
    let mut stations = Vec::with_capacity(folders.len());
    for folder in folders {
        match load_station(&folder, &shared_adverts, ctx, opener, rng) {
            Ok(Some(station)) => stations.push(station),
            Ok(None) => {}
            Err(e) => ctx.logger().log(format_args!(
                "Skipped folder '{}': {e:#}",
                folder.display()
            )),
        }
    }
    tracing::info!(root = %root.display(), count = stations.len(), "stations loaded");
    Ok(stations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::RecordingLogger;
    use crate::rotation::tests::FakeOpener;
    use crate::station::StationKind;
    use crate::station::tests::test_radio;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("radio-library-{tag}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn m3u_skips_comments_and_blanks() {
        let text = "#EXTM3U\n\n#EXTINF:-1,Live\nhttp://example.com/live\n  \nsecond.mp3\n";
        assert_eq!(read_m3u(text), vec!["http://example.com/live", "second.mp3"]);
    }

    #[test]
    fn pls_takes_file_entries_in_order() {
        let text = "[playlist]\nNumberOfEntries=2\nFile1=a.mp3\nTitle1=A\nFile12=b.mp3\nLength1=-1\n";
        assert_eq!(read_pls(text), vec!["a.mp3", "b.mp3"]);
    }

    #[test]
    fn times_accept_seconds_and_clock_forms() {
        assert_eq!(parse_time("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_time("1:30"), Some(Duration::from_secs(90)));
        assert_eq!(parse_time("1:02:03"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_time("0:01.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_time("1.5:00"), None);
        assert_eq!(parse_time("1:2:3:4"), None);
        assert_eq!(parse_time("abc"), None);
    }

    #[test]
    fn station_config_parses_tracks() {
        let cfg: StationConfig = toml::from_str(
            r#"
            name = "Night Drive"
            volume = 0.8

            [[tracks]]
            artist = "Band"
            track = "Opener"
            start = 0
            end = "3:10"

            [[tracks]]
            track = "Closer"
            start = "3:10"
            end = "7:00"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.name.as_deref(), Some("Night Drive"));
        assert_eq!(cfg.volume, Some(0.8));
        let tracks = cfg.indexed_tracks().unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].end, Duration::from_secs(190));
        assert_eq!(tracks[1].meta.to_string(), "Closer");
    }

    #[test]
    fn reversed_track_window_is_rejected() {
        let cfg: StationConfig =
            toml::from_str("[[tracks]]\ntrack = \"X\"\nstart = \"2:00\"\nend = \"1:00\"\n").unwrap();
        assert!(cfg.indexed_tracks().is_err());
    }

    #[test]
    fn folder_rules_pick_the_station_kind() {
        let root = temp_root("plan");
        let logger = RecordingLogger::default();

        let live = root.join("live");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("stream.pls"), "[playlist]\nFile1=https://example.com/live\n").unwrap();
        assert_eq!(
            plan_station(&live, &[], &logger).unwrap(),
            Some(StationPlan::Network {
                url: "https://example.com/live".into()
            })
        );

        let single = root.join("single");
        touch(&single.join("loop.mp3"));
        touch(&single.join("cover.jpg"));
        assert_eq!(
            plan_station(&single, &[], &logger).unwrap(),
            Some(StationPlan::Looped {
                path: single.join("loop.mp3")
            })
        );

        let shared = vec![root.join("[adverts]").join("shared.mp3")];
        let split = root.join("split");
        touch(&split.join("Song (Intro).mp3"));
        touch(&split.join("Song.ogg"));
        touch(&split.join("[adverts]").join("local.mp3"));
        match plan_station(&split, &shared, &logger).unwrap() {
            Some(StationPlan::Clustered { files, adverts }) => {
                assert_eq!(files.len(), 2);
                assert_eq!(adverts, vec![split.join("[adverts]").join("local.mp3")]);
            }
            other => panic!("unexpected plan {other:?}"),
        }

        let listed = root.join("listed");
        touch(&listed.join("tracks/a.mp3"));
        fs::write(listed.join("list.m3u"), "tracks/a.mp3\nmissing.mp3\n").unwrap();
        match plan_station(&listed, &shared, &logger).unwrap() {
            Some(StationPlan::Clustered { files, adverts }) => {
                assert_eq!(files, vec![listed.join("tracks/a.mp3")]);
                assert_eq!(adverts, shared);
            }
            other => panic!("unexpected plan {other:?}"),
        }
        assert!(logger.contains("missing.mp3"));

        let empty = root.join("empty");
        touch(&empty.join("notes.txt"));
        assert_eq!(plan_station(&empty, &[], &logger).unwrap(), None);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn load_stations_orders_by_folder_and_skips_adverts() {
        let root = temp_root("load");
        touch(&root.join("[adverts]/ad.mp3"));
        touch(&root.join("b-split/one.mp3"));
        touch(&root.join("b-split/two.mp3"));
        touch(&root.join("a-loop/loop.mp3"));
        fs::write(
            root.join("a-loop").join(STATION_CONFIG_FILE),
            "name = \"Loop FM\"\nvolume = 2.0\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("c-live")).unwrap();
        fs::write(root.join("c-live/live.m3u"), "http://127.0.0.1:9/live\n").unwrap();
        fs::create_dir_all(root.join("d-nothing")).unwrap();

        let logger = Arc::new(RecordingLogger::default());
        let ctx = test_radio(logger.clone());
        let opener: Arc<dyn TrackOpener> = Arc::new(FakeOpener { frames: 10_000 });
        let stations =
            load_stations_with(&root, &ctx, &opener, &mut StdRng::seed_from_u64(1)).unwrap();

        let summary: Vec<(String, StationKind)> = stations
            .iter()
            .map(|s| (s.name().to_string(), s.kind()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Loop FM".to_string(), StationKind::Looped),
                ("b-split".to_string(), StationKind::Clustered),
                ("c-live".to_string(), StationKind::Network),
            ]
        );
        assert_eq!(stations[0].volume(), 2.0);
        assert!(logger.contains("with 2 music tracks and 1 adverts"));
        assert!(logger.contains("nothing playable"));

        drop(stations);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn bad_config_skips_only_that_folder() {
        let root = temp_root("badcfg");
        touch(&root.join("good/loop.mp3"));
        touch(&root.join("bad/loop.mp3"));
        fs::write(root.join("bad").join(STATION_CONFIG_FILE), "volume = \"loud\"\n").unwrap();

        let logger = Arc::new(RecordingLogger::default());
        let ctx = test_radio(logger.clone());
        let opener: Arc<dyn TrackOpener> = Arc::new(FakeOpener { frames: 10_000 });
        let stations =
            load_stations_with(&root, &ctx, &opener, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].name(), "good");
        assert!(logger.contains("Skipped folder"));

        drop(stations);
        let _ = fs::remove_dir_all(&root);
    }
}
