//! Render progress: status text, sample and tile counters, timing,
//! cancellation and the error slot.
//!
//! Shared between the session thread, device workers and the host. Callbacks
//! are invoked without any internal lock held.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::util::{seconds_between, Clock};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct ProgressState {
    pixel_samples: u64,
    total_pixel_samples: u64,
    current_tile_sample: u32,
    rendered_tiles: u32,
    denoised_tiles: u32,

    pass: u32,
    total_time: f64,
    pass_time: f64,

    start_time: Duration,
    render_start_time: Duration,
    end_time: Option<Duration>,

    status: String,
    substatus: String,

    cancel: bool,
    cancel_message: String,
    error: bool,
    error_message: String,
}

pub struct Progress {
    clock: Arc<dyn Clock>,
    state: Mutex<ProgressState>,
    update_cb: RwLock<Option<Callback>>,
    cancel_cb: RwLock<Option<Callback>>,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress").field("state", &*self.state.lock()).finish()
    }
}

impl Progress {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            state: Mutex::new(ProgressState { start_time: now, render_start_time: now, ..Default::default() }),
            update_cb: RwLock::new(None),
            cancel_cb: RwLock::new(None),
        }
    }

    /// Clear everything except the callbacks.
    pub fn reset(&self) {
        let now = self.clock.now();
        *self.state.lock() = ProgressState { start_time: now, render_start_time: now, ..Default::default() };
    }

    /// Clear the counters for a new epoch, keeping status and timing.
    pub fn reset_sample(&self) {
        let mut s = self.state.lock();
        s.pixel_samples = 0;
        s.current_tile_sample = 0;
        s.rendered_tiles = 0;
        s.denoised_tiles = 0;
        s.pass = 0;
    }

    // Cancel

    pub fn set_cancel(&self, message: &str) {
        {
            let mut s = self.state.lock();
            if s.cancel {
                return;
            }
            s.cancel = true;
            s.cancel_message = message.to_string();
        }
        tracing::info!(reason = message, "render cancelled");
        self.fire(&self.cancel_cb);
        self.set_update();
    }

    pub fn get_cancel(&self) -> bool {
        self.state.lock().cancel
    }

    pub fn get_cancel_message(&self) -> String {
        self.state.lock().cancel_message.clone()
    }

    pub fn set_cancel_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.cancel_cb.write() = Some(Arc::new(cb));
    }

    // Error

    /// Record the first error and cancel the render.
    pub fn set_error(&self, message: &str) {
        {
            let mut s = self.state.lock();
            if s.error {
                return;
            }
            s.error = true;
            s.error_message = message.to_string();
        }
        tracing::error!("{message}");
        self.set_cancel(message);
    }

    pub fn get_error(&self) -> bool {
        self.state.lock().error
    }

    pub fn get_error_message(&self) -> String {
        self.state.lock().error_message.clone()
    }

    // Timing

    pub fn set_start_time(&self) {
        let now = self.clock.now();
        let mut s = self.state.lock();
        s.start_time = now;
        s.end_time = None;
    }

    pub fn set_render_start_time(&self) {
        self.state.lock().render_start_time = self.clock.now();
    }

    pub fn set_end_time(&self) {
        self.state.lock().end_time = Some(self.clock.now());
    }

    /// Seconds since start and since the render itself started.
    pub fn get_time(&self) -> (f64, f64) {
        let now = self.clock.now();
        let s = self.state.lock();
        let end = s.end_time.unwrap_or(now);
        (seconds_between(s.start_time, end), seconds_between(s.render_start_time, end))
    }

    /// Record that round `pass` finished.
    pub fn set_pass(&self, pass: u32, total_time: f64, pass_time: f64) {
        let mut s = self.state.lock();
        s.pass = pass;
        s.total_time = total_time;
        s.pass_time = pass_time;
    }

    /// `(pass, total_time, pass_time)` of the last finished round.
    pub fn get_pass(&self) -> (u32, f64, f64) {
        let s = self.state.lock();
        (s.pass, s.total_time, s.pass_time)
    }

    // Samples and tiles

    pub fn set_total_pixel_samples(&self, total: u64) {
        self.state.lock().total_pixel_samples = total;
    }

    pub fn add_samples(&self, pixel_samples: u64, tile_sample: u32) {
        let mut s = self.state.lock();
        s.pixel_samples += pixel_samples;
        s.current_tile_sample = tile_sample;
    }

    pub fn add_finished_tile(&self, denoised: bool) {
        let mut s = self.state.lock();
        if denoised {
            s.denoised_tiles += 1;
        } else {
            s.rendered_tiles += 1;
        }
    }

    /// Fraction of the planned pixel samples done, in `[0, 1]`.
    pub fn get_progress(&self) -> f64 {
        let s = self.state.lock();
        if s.total_pixel_samples == 0 {
            return 0.0;
        }
        (s.pixel_samples as f64 / s.total_pixel_samples as f64).clamp(0.0, 1.0)
    }

    pub fn get_current_sample(&self) -> u32 {
        self.state.lock().current_tile_sample
    }

    pub fn get_rendered_tiles(&self) -> u32 {
        self.state.lock().rendered_tiles
    }

    pub fn get_denoised_tiles(&self) -> u32 {
        self.state.lock().denoised_tiles
    }

    // Status

    pub fn set_status(&self, status: &str, substatus: &str) {
        {
            let mut s = self.state.lock();
            if s.status == status && s.substatus == substatus {
                return;
            }
            s.status = status.to_string();
            s.substatus = substatus.to_string();
        }
        tracing::debug!(status, substatus, "progress");
        self.set_update();
    }

    pub fn set_substatus(&self, substatus: &str) {
        let status = self.state.lock().status.clone();
        self.set_status(&status, substatus);
    }

    pub fn get_status(&self) -> (String, String) {
        let s = self.state.lock();
        (s.status.clone(), s.substatus.clone())
    }

    // Update

    pub fn set_update_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.update_cb.write() = Some(Arc::new(cb));
    }

    /// Notify the host that something changed.
    pub fn set_update(&self) {
        self.fire(&self.update_cb);
    }

    fn fire(&self, slot: &RwLock<Option<Callback>>) {
        let cb = slot.read().clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}
