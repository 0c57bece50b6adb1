//! Headless host for the radio engine.
//!
//! Loads a station root, plays one station and keeps it alive on a fixed cadence the
//! way an embedding application would. Optionally cycles through the stations.

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use radio_engine::{
    CpalOutput, FileLogger, RadioContext, RadioLogger, Station, TracingLogger, Tuner,
    load_stations,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,radio_engine=info,radio_host=info")
        }))
        .init();

    if args.list_devices {
        radio_engine::device::list_devices(&cpal::default_host())?;
        return Ok(());
    }

    let Some(root) = args.root.clone() else {
        bail!("a station root folder is required");
    };

    let logger: Arc<dyn RadioLogger> = match &args.log_file {
        Some(path) => Arc::new(FileLogger::create(path)?),
        None => Arc::new(TracingLogger),
    };
    let output = Arc::new(CpalOutput::new(args.device.clone()));
    let ctx = Arc::new(RadioContext::new(logger, output));
    ctx.set_pause_if_not_notified(!args.no_watchdog);

    let stations = load_stations(&root, &ctx)
        .with_context(|| format!("load stations from {:?}", root))?;

    if args.list_stations {
        for (i, station) in stations.iter().enumerate() {
            println!("#{i}: {} ({})", station.name(), station.kind());
        }
        return Ok(());
    }
    if stations.is_empty() {
        bail!("no playable stations under {:?}", root);
    }

    let start = match &args.station {
        Some(wanted) => find_station(&stations, wanted)
            .with_context(|| format!("no station matches {wanted:?}"))?,
        None => 0,
    };

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    let mut tuner = Tuner::new(ctx, stations);
    tuner.set_global_volume(args.global_volume);
    tuner.play(Some(start));
    run(&mut tuner, &args, &running);

    tracing::info!("shutting down");
    tuner.stop_current();
    Ok(())
}

fn find_station(stations: &[Station], wanted: &str) -> Option<usize> {
    if let Ok(index) = wanted.parse::<usize>() {
        return (index < stations.len()).then_some(index);
    }
    stations
        .iter()
        .position(|s| s.name().eq_ignore_ascii_case(wanted))
}

/// Drive the keep-alive contract until interrupted.
fn run(tuner: &mut Tuner, args: &cli::Args, running: &AtomicBool) {
    let keep_alive = Duration::from_millis(args.keep_alive_ms.max(10));
    let cycle = (args.cycle_seconds > 0).then(|| Duration::from_secs(args.cycle_seconds));
    let report = (args.status_seconds > 0).then(|| Duration::from_secs(args.status_seconds));
    let mut last_switch = Instant::now();
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) {
        tuner.keep_alive();

        if let Some(cycle) = cycle {
            if last_switch.elapsed() >= cycle {
                if let Some(next) = tuner.move_to_next_station() {
                    tracing::info!(station = %next.name(), "switching station");
                }
                tuner.activate_next_station();
                last_switch = Instant::now();
            }
        }

        if let Some(report) = report {
            if last_report.elapsed() >= report {
                print_status(tuner);
                last_report = Instant::now();
            }
        }

        thread::sleep(keep_alive);
    }
}

fn print_status(tuner: &Tuner) {
    let Some(station) = tuner.active_station() else {
        return;
    };
    let s = station.status();
    tracing::info!(
        station = %s.name,
        kind = %s.kind,
        state = %s.state,
        now_playing = s.now_playing.as_deref().unwrap_or("-"),
        buffered_ms = s.buffered.as_millis() as u64,
        device = s.device.as_deref().unwrap_or("-"),
        volume = s.volume,
        played_frames = s.played_frames,
        underrun_frames = s.underrun_frames,
        underrun_events = s.underrun_events,
        "status"
    );
}
