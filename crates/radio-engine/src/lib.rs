//! Radio station playback engine.
//!
//! A [`Tuner`] owns a list of [`Station`]s loaded from a directory tree by
//! [`library::load_stations`]. Each station decodes its source on a background thread
//! into a bounded buffer that a CPAL output callback drains. Three station kinds exist:
//! - looped: one long file played as an endless loop at a wall-clock position
//! - clustered: split tracks (intro/mid/outro) rotated with adverts
//! - network: an HTTP(S) stream with ICY metadata
//!
//! Hosts talk to the engine through [`RadioContext`]: a logger for now-playing lines, an
//! output provider, and the keep-alive watchdog switch.

pub mod buffer;
pub mod config;
pub mod context;
pub mod decode;
pub mod device;
pub mod error;
pub mod icy;
pub mod library;
pub mod logger;
pub mod metadata;
pub mod output;
pub mod playback;
pub mod resample;
pub mod rotation;
pub mod station;
pub mod stations;
pub mod tags;
pub mod timer;
pub mod tuner;

pub use config::{EngineConfig, HttpSettings};
pub use context::RadioContext;
pub use error::SourceError;
pub use library::{StationConfig, load_stations};
pub use logger::{FileLogger, RadioLogger, TracingLogger};
pub use metadata::{MetaData, TrackMetaData};
pub use output::{CpalOutput, NullOutput, OutputProvider};
pub use station::{PlaybackState, Station, StationKind, StationStatus};
pub use tuner::Tuner;
