use std::time::Duration;

/// Timing and buffering parameters shared by every station.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Keep-alive silence after which the watchdog suspends a station.
    pub watchdog_timeout: Duration,
    /// Extra time added to the watchdog timeout before auto-resume is re-enabled.
    pub auto_resume_margin: Duration,
    /// Interval of the playback/watchdog tick.
    pub tick_interval: Duration,
    /// Buffer target for looped and network stations.
    pub default_buffer: Duration,
    /// Buffer target for clustered stations.
    pub clustered_buffer: Duration,
    /// The device starts once `min(buffer target, start_threshold)` is buffered.
    pub start_threshold: Duration,
    /// While playing, dropping below this reverts to buffering.
    pub stutter_threshold: Duration,
    /// Decode sleep when the buffer is nearly full.
    pub full_buffer_sleep: Duration,
    /// Consecutive malformed frames tolerated before a stream is abandoned.
    pub max_frame_errors: u32,
    pub local_meta_interval: Duration,
    pub network_meta_interval: Duration,
    pub http: HttpSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_millis(1500),
            auto_resume_margin: Duration::from_millis(250),
            tick_interval: Duration::from_millis(250),
            default_buffer: Duration::from_secs(20),
            clustered_buffer: Duration::from_secs(5),
            start_threshold: Duration::from_secs(4),
            stutter_threshold: Duration::from_millis(500),
            full_buffer_sleep: Duration::from_millis(1000),
            max_frame_errors: 5,
            local_meta_interval: Duration::from_secs(3),
            network_meta_interval: Duration::from_secs(15),
            http: HttpSettings::default(),
        }
    }
}

/// HTTP parameters for live streams and metadata polls.
#[derive(Clone, Debug)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    /// Time allowed for the response headers. The body of a live stream has no timeout.
    pub response_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            user_agent: concat!("radio-engine/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
