use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "radio-host", version)]
pub struct Args {
    /// Station root folder (one sub-folder per station)
    pub root: Option<PathBuf>,

    /// Station to play, by index or by (case-insensitive) name
    #[arg(long)]
    pub station: Option<String>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// List the stations found under the root and exit
    #[arg(long)]
    pub list_stations: bool,

    /// Global volume multiplier in [0, 1]
    #[arg(long, default_value_t = 1.0)]
    pub global_volume: f32,

    /// Keep playing even when keep-alives stop arriving
    #[arg(long)]
    pub no_watchdog: bool,

    /// Switch to the next station every N seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    pub cycle_seconds: u64,

    /// Interval between keep-alive calls, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub keep_alive_ms: u64,

    /// Print a status line every N seconds (0 = never)
    #[arg(long, default_value_t = 10)]
    pub status_seconds: u64,

    /// Append station and now-playing lines to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
