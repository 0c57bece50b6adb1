//! Cancellable periodic tasks.

use std::io;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

/// A background thread calling a closure on a fixed interval.
///
/// The closure returns `false` to end the task. Cancelling (or dropping) the handle
/// wakes the thread immediately; it is detached rather than joined so a task may cancel
/// itself from inside its own tick.
pub struct PeriodicTask {
    stop: Option<Sender<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, interval: Duration, immediate: bool, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        thread::Builder::new().name(name.to_string()).spawn(move || {
            if immediate && !tick() {
                return;
            }
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        Ok(Self {
            stop: Some(stop_tx),
        })
    }

    pub fn cancel(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = PeriodicTask::spawn("test-tick", Duration::from_millis(10), false, move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        task.cancel();
        let after_cancel = count.load(Ordering::SeqCst);
        assert!(after_cancel >= 2);
        thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[test]
    fn immediate_tick_runs_before_first_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _task = PeriodicTask::spawn("test-immediate", Duration::from_secs(60), true, move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn returning_false_ends_the_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _task = PeriodicTask::spawn("test-once", Duration::from_millis(5), false, move || {
            c.fetch_add(1, Ordering::SeqCst);
            false
        })
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
