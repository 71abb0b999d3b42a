use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

struct Shared {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// Re-arming timer: runs a callback every `period` on its own thread until
/// cancelled. A slow callback delays subsequent ticks; it never runs
/// concurrently with itself.
pub struct PeriodicTask {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, period: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            cancelled: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let mut cancelled = thread_shared.cancelled.lock();
                if *cancelled {
                    break;
                }
                let timed_out = thread_shared
                    .condvar
                    .wait_for(&mut cancelled, period)
                    .timed_out();
                if *cancelled {
                    break;
                }
                drop(cancelled);
                if timed_out {
                    callback();
                }
            })
            .expect("failed to spawn timer thread");
        Self {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        }
    }

    /// Stops the timer. Idempotent and safe from any thread.
    pub fn cancel(&self) {
        let mut cancelled = self.shared.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            debug!(task = %self.name, "periodic task cancelled");
        }
        self.shared.condvar.notify_all();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_callback_fires_repeatedly() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let task = PeriodicTask::spawn("test-timer", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        task.cancel();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let task = PeriodicTask::spawn("test-cancel", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(30));
        task.cancel();
        task.cancel();
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_no_fire_before_period() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let task = PeriodicTask::spawn("test-slow", Duration::from_secs(60), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        task.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
