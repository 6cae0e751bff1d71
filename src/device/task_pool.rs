//! Cancellable job pool used by the CPU device.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::util::{Error, Result};

/// Receives the message of a job that panicked.
pub(crate) type PanicHandler = Box<dyn Fn(&str) + Send + Sync>;

/// A rayon pool plus an outstanding-job count, so callers can wait for
/// everything they pushed and cancel jobs that have not started yet.
pub(crate) struct TaskPool {
    pool: rayon::ThreadPool,
    outstanding: Mutex<usize>,
    idle: Condvar,
    cancelled: AtomicBool,
    on_panic: PanicHandler,
}

impl TaskPool {
    pub fn new(threads: usize, name: &str, on_panic: PanicHandler) -> Result<Arc<Self>> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| Error::DeviceUnavailable(format!("{name}: {e}")))?;
        Ok(Arc::new(Self {
            pool,
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            cancelled: AtomicBool::new(false),
            on_panic,
        }))
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// The calling thread is one of this pool's workers.
    pub fn on_worker(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }

    /// Jobs check this between units of work.
    pub fn canceled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn push<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.outstanding.lock() += 1;
        let this = Arc::clone(self);
        self.pool.spawn(move || {
            if !this.canceled() {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    tracing::error!("device job panicked: {msg}");
                    (this.on_panic)(&format!("Device job panicked: {msg}"));
                }
            }
            this.finish_one();
        });
    }

    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until every pushed job has finished or been skipped.
    pub fn wait(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.idle.wait(&mut outstanding);
        }
    }

    /// Skip queued jobs, let running ones observe [`canceled`](Self::canceled),
    /// wait for all of them, then accept work again.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wait();
        self.cancelled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_wait_runs_everything() {
        let pool = TaskPool::new(3, "test", Box::new(|_: &str| {})).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = Arc::clone(&count);
            pool.push(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(count.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_cancel_skips_queued() {
        let pool = TaskPool::new(1, "test", Box::new(|_: &str| {})).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let pool2 = Arc::clone(&pool);
            pool.push(move || {
                while !pool2.canceled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
        }
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            pool.push(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.cancel();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert!(!pool.canceled());

        // Usable again after cancel.
        let ran2 = Arc::clone(&ran);
        pool.push(move || {
            ran2.fetch_add(1, Ordering::Relaxed);
        });
        pool.wait();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panic_is_reported() {
        let reported = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&reported);
        let pool = TaskPool::new(2, "test", Box::new(move |msg: &str| sink.lock().push(msg.to_string()))).unwrap();
        pool.push(|| panic!("boom"));
        pool.wait();
        let reported = reported.lock();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("boom"), "{}", reported[0]);
    }
}
