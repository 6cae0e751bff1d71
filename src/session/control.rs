//! Reset and redraw timing.
//!
//! Resets requested while an image is on screen wait `reset_timeout` so a
//! burst of them (a dragged slider, a resized window) collapses into one.
//! Once the display is already outdated the next reset waits up to
//! `cancel_timeout` instead, so something new gets drawn in between. A reset
//! that has waited `cancel_timeout` cancels the tiles still running.
//! `draw` keeps showing an outdated image for `text_timeout` before it
//! reports that the host should show status text instead.

use std::sync::Arc;
use std::time::Duration;

use crate::util::{seconds_between, Clock};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timeouts {
    pub reset: f64,
    pub cancel: f64,
    pub text: f64,
}

pub struct ResetControl {
    clock: Arc<dyn Clock>,
    timeouts: Timeouts,
    /// When the oldest unapplied reset was requested.
    pending_since: Option<Duration>,
    /// Whether the display had gone stale when the pending reset arrived.
    pending_outdated: bool,
    /// When the last reset was applied.
    reset_time: Duration,
    display_outdated: bool,
}

impl ResetControl {
    pub fn new(clock: Arc<dyn Clock>, timeouts: Timeouts) -> Self {
        let now = clock.now();
        Self {
            clock,
            timeouts,
            pending_since: None,
            pending_outdated: false,
            reset_time: now,
            display_outdated: true,
        }
    }

    pub fn request(&mut self) {
        if self.pending_since.is_none() {
            self.pending_since = Some(self.clock.now());
            self.pending_outdated = self.display_outdated;
        }
    }

    pub fn pending(&self) -> bool {
        self.pending_since.is_some()
    }

    fn waited(&self) -> Option<f64> {
        self.pending_since.map(|since| seconds_between(since, self.clock.now()))
    }

    fn threshold(&self) -> f64 {
        if self.pending_outdated { self.timeouts.cancel } else { self.timeouts.reset }
    }

    /// The pending reset should be applied now.
    pub fn ready(&self) -> bool {
        self.waited().is_some_and(|dt| dt >= self.threshold() || dt >= self.timeouts.cancel)
    }

    /// Running tiles should stop so the pending reset can be applied.
    pub fn cancel_requested(&self) -> bool {
        self.waited().is_some_and(|dt| dt >= self.timeouts.cancel)
    }

    /// Time left until [`ready`](Self::ready), `None` without a pending reset.
    pub fn time_until_ready(&self) -> Option<Duration> {
        let dt = self.waited()?;
        let wait = self.threshold().min(self.timeouts.cancel) - dt;
        Some(Duration::from_secs_f64(wait.max(0.0)))
    }

    /// The pending reset was applied; the display now shows the old image.
    pub fn applied(&mut self) {
        self.pending_since = None;
        self.reset_time = self.clock.now();
        self.display_outdated = true;
    }

    /// A new image reached the display.
    pub fn display_updated(&mut self) {
        self.display_outdated = false;
    }

    pub fn display_outdated(&self) -> bool {
        self.display_outdated
    }

    /// `draw` may still present the display.
    pub fn draw_allowed(&self) -> bool {
        !(self.display_outdated && seconds_between(self.reset_time, self.clock.now()) > self.timeouts.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;

    const TIMEOUTS: Timeouts = Timeouts { reset: 0.1, cancel: 0.5, text: 1.0 };

    fn control() -> (Arc<ManualClock>, ResetControl) {
        let clock = Arc::new(ManualClock::new());
        let control = ResetControl::new(clock.clone(), TIMEOUTS);
        (clock, control)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_reset_on_current_display_waits_reset_timeout() {
        let (clock, mut control) = control();
        control.display_updated();
        control.request();
        assert!(control.pending());
        assert!(!control.ready());
        assert_eq!(control.time_until_ready(), Some(ms(100)));

        clock.advance(ms(99));
        assert!(!control.ready());
        clock.advance(ms(1));
        assert!(control.ready());
        assert!(!control.cancel_requested());

        control.applied();
        assert!(!control.pending());
        assert!(control.display_outdated());
    }

    #[test]
    fn test_reset_on_outdated_display_waits_cancel_timeout() {
        let (clock, mut control) = control();
        control.request();
        clock.advance(ms(300));
        assert!(!control.ready());
        clock.advance(ms(200));
        assert!(control.ready());
        assert!(control.cancel_requested());
    }

    #[test]
    fn test_burst_collapses() {
        let (clock, mut control) = control();
        control.display_updated();
        control.request();
        clock.advance(ms(60));
        // A later request does not restart the wait.
        control.request();
        clock.advance(ms(40));
        assert!(control.ready());
    }

    #[test]
    fn test_draw_text_timeout() {
        let (clock, mut control) = control();
        control.applied();
        assert!(control.draw_allowed());
        clock.advance(ms(1001));
        assert!(!control.draw_allowed());
        control.display_updated();
        assert!(control.draw_allowed());
    }
}
