//! Logging collaborator used by stations and the tuner.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::metadata::TrackMetaData;

/// Sink for diagnostic lines and now-playing events.
pub trait RadioLogger: Send + Sync {
    fn log(&self, line: fmt::Arguments<'_>);

    /// Called for a now-playing change. Callers skip metadata with an empty display form.
    fn log_track(&self, station: &str, meta: &TrackMetaData) {
        self.log(format_args!("{station}: {meta}"));
    }
}

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl RadioLogger for TracingLogger {
    fn log(&self, line: fmt::Arguments<'_>) {
        tracing::info!("{line}");
    }

    fn log_track(&self, station: &str, meta: &TrackMetaData) {
        tracing::info!(station = %station, now_playing = %meta, "track changed");
    }
}

/// Appends `[HH:MM:SS] line` entries (UTC) to a file and mirrors them to `tracing`.
pub struct FileLogger {
    file: Mutex<File>,
}

impl FileLogger {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {:?}", path))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl RadioLogger for FileLogger {
    fn log(&self, line: fmt::Arguments<'_>) {
        let line = line.to_string();
        tracing::info!("{line}");
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "[{}] {line}", timestamp()) {
            tracing::warn!("log file write failed: {e}");
        }
    }
}

fn timestamp() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
}

/// Keeps every line in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingLogger {
    lines: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingLogger {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

#[cfg(test)]
impl RadioLogger for RecordingLogger {
    fn log(&self, line: fmt::Arguments<'_>) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaData;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn log_track_prefixes_station_name() {
        let logger = RecordingLogger::default();
        logger.log_track("Rock", &MetaData::new(Some("A"), Some("B")).into());
        assert_eq!(logger.lines(), vec!["Rock: A - B".to_string()]);
    }

    #[test]
    fn file_logger_appends_timestamped_lines() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("radio-log-{nanos}.txt"));
        let logger = FileLogger::create(&path).unwrap();
        logger.log(format_args!("hello {}", 42));
        drop(logger);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('['));
        assert!(text.trim_end().ends_with("] hello 42"));
        let _ = std::fs::remove_file(&path);
    }
}
