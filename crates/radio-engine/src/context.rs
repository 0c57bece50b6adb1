//! Explicit runtime context shared by a tuner and its stations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::EngineConfig;
use crate::logger::{RadioLogger, TracingLogger};
use crate::output::{CpalOutput, OutputProvider};

/// Logger, output provider and host-controlled switches for one radio instance.
pub struct RadioContext {
    logger: Arc<dyn RadioLogger>,
    output: Arc<dyn OutputProvider>,
    config: EngineConfig,
    pause_if_not_notified: AtomicBool,
    global_volume: AtomicU32,
}

impl RadioContext {
    pub fn new(logger: Arc<dyn RadioLogger>, output: Arc<dyn OutputProvider>) -> Self {
        Self::with_config(logger, output, EngineConfig::default())
    }

    pub fn with_config(
        logger: Arc<dyn RadioLogger>,
        output: Arc<dyn OutputProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            logger,
            output,
            config,
            pause_if_not_notified: AtomicBool::new(true),
            global_volume: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn logger(&self) -> &Arc<dyn RadioLogger> {
        &self.logger
    }

    pub fn output(&self) -> &Arc<dyn OutputProvider> {
        &self.output
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// When enabled the watchdog suspends stations that stop receiving keep-alives.
    pub fn pause_if_not_notified(&self) -> bool {
        self.pause_if_not_notified.load(Ordering::Relaxed)
    }

    pub fn set_pause_if_not_notified(&self, enabled: bool) {
        self.pause_if_not_notified.store(enabled, Ordering::Relaxed);
    }

    /// Host-supplied volume scale in `[0, 1]`.
    pub fn global_volume(&self) -> f32 {
        f32::from_bits(self.global_volume.load(Ordering::Relaxed))
    }

    /// Stations pick this up on their next volume refresh; see `Tuner::set_global_volume`.
    pub fn set_global_volume(&self, value: f32) {
        let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 1.0 };
        self.global_volume.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for RadioContext {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger), Arc::new(CpalOutput::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_volume_is_clamped() {
        let ctx = RadioContext::default();
        assert_eq!(ctx.global_volume(), 1.0);
        ctx.set_global_volume(1.7);
        assert_eq!(ctx.global_volume(), 1.0);
        ctx.set_global_volume(-3.0);
        assert_eq!(ctx.global_volume(), 0.0);
        ctx.set_global_volume(f32::NAN);
        assert_eq!(ctx.global_volume(), 1.0);
    }

    #[test]
    fn watchdog_flag_defaults_on() {
        let ctx = RadioContext::default();
        assert!(ctx.pause_if_not_notified());
        ctx.set_pause_if_not_notified(false);
        assert!(!ctx.pause_if_not_notified());
    }
}
