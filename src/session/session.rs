//! The render session: control thread, tile source and display.
//!
//! Lock order: `delayed_reset` -> `buffers` -> `display` -> `tiles` ->
//! [`RenderBuffers`]. `control` and `state` are leaves held only briefly.
//! `pause` is never taken while holding another session lock except
//! `tiles` and `control` from the waiting control thread. Device workers
//! only touch `tiles`, `control` and tile buffers, so any device call made
//! while holding `display` or `buffers` cannot deadlock against them.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffers::{BufferParams, DisplayBuffer, FilmConstants, PassType, RenderBuffers, SharedBuffers};
use crate::device::{DenoiseParams, Device, DeviceTask, DeviceTaskType, DrawTarget, TileSource, TileTypes};
use crate::tile::{RenderTile, RenderTileNeighbors, RenderTileTask, TileManager, TileState};
use crate::util::{seconds_between, Clock, Result, SystemClock};
use super::control::{ResetControl, Timeouts};
use super::output::FrameCollector;
use super::params::SessionParams;
use super::progress::Progress;
use super::scene::{NullScene, Scene, TileWriter};

/// Longest a waiting thread sleeps before re-checking cancellation.
const POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Not started yet.
    Idle,
    Running,
    Paused,
    /// Background render completed.
    Finished,
    Cancelled,
    /// Kernel load or device failure; see [`Progress::get_error_message`].
    Failed,
}

struct Tiles {
    manager: TileManager,
    /// Bumped by every applied reset; tiles carry the epoch they were issued in.
    epoch: u64,
    /// Whole-frame buffers, `None` while tiles own their buffers.
    buffers: Option<SharedBuffers>,
    denoise: DenoiseParams,
}

/// Film conversion of one finished round.
#[derive(Clone)]
struct Tonemap {
    buffers: SharedBuffers,
    level: BufferParams,
    sample: u32,
}

struct Display {
    buffer: Option<DisplayBuffer>,
    /// Params the host passed to the reset that produced the display.
    requested: BufferParams,
    /// Deferred film conversion waiting for the draw thread.
    pending: Option<Tonemap>,
}

struct SessionInner {
    params: SessionParams,
    device: Arc<dyn Device>,
    scene: Arc<dyn Scene>,
    clock: Arc<dyn Clock>,
    progress: Arc<Progress>,
    writer: RwLock<Option<Arc<dyn TileWriter>>>,
    frame: Arc<FrameCollector>,

    delayed_reset: Mutex<Option<(BufferParams, u32)>>,
    control: Mutex<ResetControl>,
    buffers: Mutex<Option<SharedBuffers>>,
    display: Mutex<Display>,
    display_cond: Condvar,
    tiles: Mutex<Tiles>,
    tiles_cond: Condvar,
    pause: Mutex<bool>,
    pause_cond: Condvar,
    state: Mutex<SessionState>,
}

/// A render of one scene on one device.
///
/// Interactive sessions run until cancelled or dropped, re-rendering on
/// every [`reset`](Self::reset). Background sessions stop once the last
/// sample is written.
pub struct Session {
    inner: Arc<SessionInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(params: SessionParams, device: Arc<dyn Device>) -> Result<Self> {
        Self::with_scene(params, device, Arc::new(NullScene), SystemClock::shared())
    }

    pub fn with_scene(
        params: SessionParams,
        device: Arc<dyn Device>,
        scene: Arc<dyn Scene>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        params.validate()?;
        let timeouts = Timeouts {
            reset: params.reset_timeout,
            cancel: params.cancel_timeout,
            text: params.text_timeout,
        };
        let manager = TileManager::new(params.tile_settings(), params.samples, device.num_logical_devices());
        let display = (!params.background).then(|| DisplayBuffer::new(Arc::clone(&device), params.display_buffer_linear));

        let inner = SessionInner {
            progress: Arc::new(Progress::new(Arc::clone(&clock))),
            control: Mutex::new(ResetControl::new(Arc::clone(&clock), timeouts)),
            writer: RwLock::new(None),
            frame: Arc::new(FrameCollector::new()),
            delayed_reset: Mutex::new(None),
            buffers: Mutex::new(None),
            display: Mutex::new(Display { buffer: display, requested: BufferParams::default(), pending: None }),
            display_cond: Condvar::new(),
            tiles: Mutex::new(Tiles { manager, epoch: 0, buffers: None, denoise: DenoiseParams::default() }),
            tiles_cond: Condvar::new(),
            pause: Mutex::new(false),
            pause_cond: Condvar::new(),
            state: Mutex::new(SessionState::Idle),
            params,
            device,
            scene,
            clock,
        };
        Ok(Self { inner: Arc::new(inner), thread: Mutex::new(None) })
    }

    pub fn params(&self) -> &SessionParams {
        &self.inner.params
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.inner.device
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.inner.progress
    }

    /// Frame assembled from the tiles a background render wrote.
    pub fn frame(&self) -> &Arc<FrameCollector> {
        &self.inner.frame
    }

    /// Also hand finished background tiles to `writer`.
    pub fn set_tile_writer(&self, writer: Arc<dyn TileWriter>) {
        *self.inner.writer.write() = Some(writer);
    }

    /// Spawn the control thread. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            tracing::warn!("session already started");
            return Ok(());
        }
        *self.inner.state.lock() = SessionState::Running;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("render-session".into())
            .spawn(move || inner.run())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Render `params` with `samples` samples from scratch. Applied by the
    /// control thread once the reset timeouts allow it.
    pub fn reset(&self, params: &BufferParams, samples: u32) {
        {
            let mut delayed = self.inner.delayed_reset.lock();
            *delayed = Some((params.clone(), samples));
            self.inner.control.lock().request();
        }
        tracing::debug!(width = params.width, height = params.height, samples, "reset requested");
        let _pause = self.inner.pause.lock();
        self.inner.pause_cond.notify_all();
    }

    /// Change the target sample count of the running render.
    pub fn set_samples(&self, samples: u32) {
        {
            let mut tiles = self.inner.tiles.lock();
            if tiles.manager.num_samples == samples {
                return;
            }
            tiles.manager.set_samples(samples);
            self.inner.progress.set_total_pixel_samples(tiles.manager.state.total_pixel_samples);
        }
        let _pause = self.inner.pause.lock();
        self.inner.pause_cond.notify_all();
    }

    /// Pausing lets the running round finish and then waits.
    pub fn set_pause(&self, pause: bool) {
        let mut paused = self.inner.pause.lock();
        if *paused == pause {
            return;
        }
        *paused = pause;
        tracing::debug!(pause, "set pause");
        self.inner.pause_cond.notify_all();
    }

    pub fn cancel(&self, reason: &str) {
        self.inner.cancel(reason);
    }

    /// Join the control thread. For interactive sessions this returns only
    /// after [`cancel`](Self::cancel).
    pub fn wait(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("session thread panicked");
            }
        }
    }

    pub fn state(&self) -> SessionState {
        let state = *self.inner.state.lock();
        if state == SessionState::Running && *self.inner.pause.lock() {
            return SessionState::Paused;
        }
        state
    }

    /// Draw the display for `params`. False when there is nothing to show
    /// for these params, or the image has been outdated for longer than
    /// `text_timeout` and the host should show status text instead.
    pub fn draw(&self, params: &BufferParams, target: &mut dyn DrawTarget) -> bool {
        let inner = &self.inner;
        let mut display = inner.display.lock();
        if display.requested.modified(params) {
            return false;
        }
        let Display { buffer, pending, .. } = &mut *display;
        let Some(buffer) = buffer.as_mut() else {
            return false;
        };
        if let Some(job) = pending.take() {
            inner.film_convert(buffer, &job);
            inner.control.lock().display_updated();
            inner.display_cond.notify_all();
        }
        if !buffer.draw_ready() {
            return false;
        }
        buffer.draw(target);
        inner.control.lock().draw_allowed()
    }

    /// `(width, height, rgba8)` of the drawable display region.
    pub fn display_pixels(&self) -> Option<(i32, i32, Vec<u8>)> {
        let mut display = self.inner.display.lock();
        let buffer = display.buffer.as_mut()?;
        if !buffer.draw_ready() {
            return None;
        }
        let (w, h) = (buffer.draw_width, buffer.draw_height);
        Some((w, h, buffer.read_pixels()))
    }

    /// Save the current result: the assembled frame of a background render,
    /// or the display of an interactive one.
    #[cfg(feature = "output")]
    pub fn write_output(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let path = path.as_ref();
        let inner = &self.inner;
        if inner.params.background {
            return inner.frame.write(path, &inner.params.film);
        }
        let mut display = inner.display.lock();
        let Display { buffer, pending, .. } = &mut *display;
        let buffer = buffer
            .as_mut()
            .ok_or_else(|| crate::util::Error::other("session has no display"))?;
        if let Some(job) = pending.take() {
            inner.film_convert(buffer, &job);
            inner.control.lock().display_updated();
            inner.display_cond.notify_all();
        }
        buffer.write(path)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let running = self.thread.lock().as_ref().is_some_and(|h| !h.is_finished());
        if running {
            self.inner.cancel("Session closed");
        }
        self.wait();
    }
}

impl SessionInner {
    fn cancel(&self, reason: &str) {
        self.progress.set_cancel(reason);
        {
            let _pause = self.pause.lock();
            self.pause_cond.notify_all();
        }
        self.tiles_cond.notify_all();
        self.display_cond.notify_all();
    }

    fn run(self: &Arc<Self>) {
        tracing::info!(
            device = %self.device.info().description,
            background = self.params.background,
            "session started"
        );
        self.progress.set_start_time();
        if !self.load_kernels() {
            self.finish(SessionState::Failed);
            return;
        }
        self.progress.set_render_start_time();
        let deferred_tonemap = self.device.info().display_device && !self.params.background;

        while !self.progress.get_cancel() {
            self.apply_delayed_reset();

            let paused = *self.pause.lock();
            let have_work = !paused && self.tiles.lock().manager.next();
            if !have_work {
                let done = !paused && self.render_done();
                if self.params.background && done {
                    break;
                }
                self.update_status(paused, done);
                self.wait_for_work();
                continue;
            }

            self.update_status(false, false);
            let round_start = self.clock.now();
            {
                let _buffers = self.buffers.lock();
                if self.scene.need_update() {
                    self.progress.set_status("Updating Scene", "");
                    self.scene.device_update(self.device.as_ref(), &self.progress);
                }
                if self.progress.get_cancel() {
                    break;
                }
                self.path_trace();
            }

            if self.device.have_error() {
                let message = self.device.error_message();
                self.progress.set_error(&message);
                self.progress.set_status("Error", &message);
                break;
            }
            if self.progress.get_cancel() || self.control.lock().cancel_requested() {
                // Incomplete round; a reset replaces it.
                continue;
            }
            self.round_finished(deferred_tonemap, round_start);
        }

        let state = if self.progress.get_error() {
            SessionState::Failed
        } else if self.progress.get_cancel() {
            SessionState::Cancelled
        } else {
            SessionState::Finished
        };
        self.finish(state);
    }

    fn finish(&self, state: SessionState) {
        *self.state.lock() = state;
        self.progress.set_end_time();
        match state {
            SessionState::Finished => self.update_status(false, true),
            SessionState::Cancelled => self.progress.set_status("Cancelled", &self.progress.get_cancel_message()),
            _ => {}
        }
        let (total, render) = self.progress.get_time();
        tracing::info!(?state, total_time = total, render_time = render, "session finished");
        self.progress.set_update();
    }

    fn load_kernels(&self) -> bool {
        self.progress.set_status("Loading render kernels", "");
        let mut features = self.scene.requested_features();
        features.use_denoising |= self.params.run_denoising;
        if self.device.load_kernels(&features) {
            return true;
        }
        let mut message = self.device.error_message();
        if message.is_empty() {
            message = "Failed loading render kernel, see console for errors".into();
        }
        self.progress.set_error(&message);
        self.progress.set_status("Error", &message);
        false
    }

    /// The last applied reset has nothing left to render and no other reset
    /// is waiting.
    fn render_done(&self) -> bool {
        let applied = self.tiles.lock().epoch > 0;
        applied && !self.control.lock().pending()
    }

    fn wait_for_work(&self) {
        let mut paused = self.pause.lock();
        loop {
            if self.progress.get_cancel() {
                return;
            }
            let timeout = {
                let control = self.control.lock();
                if control.pending() && (self.params.background || control.ready()) {
                    return;
                }
                control.time_until_ready().map_or(POLL, |t| t.min(POLL))
            };
            if !*paused && !self.tiles.lock().manager.done() {
                return;
            }
            self.pause_cond.wait_for(&mut paused, timeout.max(Duration::from_millis(1)));
        }
    }

    fn apply_delayed_reset(&self) {
        let mut delayed = self.delayed_reset.lock();
        if delayed.is_none() {
            return;
        }
        if !self.params.background && !self.control.lock().ready() {
            return;
        }
        if let Some((params, samples)) = delayed.take() {
            self.reset_(params, samples);
        }
    }

    /// Caller holds `delayed_reset`.
    fn reset_(&self, requested: BufferParams, samples: u32) {
        let mut full = requested.clone();
        full.denoising_data_pass = self.params.schedule_denoising();

        let mut buffers = self.buffers.lock();
        let mut display = self.display.lock();

        if self.params.whole_frame_buffers() {
            match buffers.as_ref() {
                Some(shared) => {
                    let mut b = shared.lock();
                    if b.params.modified(&full) {
                        b.reset(&full);
                    }
                }
                None => *buffers = Some(RenderBuffers::with_params(Arc::clone(&self.device), &full).shared()),
            }
        }
        if let Some(buffer) = display.buffer.as_mut() {
            if buffer.params.modified(&full) {
                buffer.reset(&full);
            }
        }
        display.requested = requested;
        display.pending = None;

        let total = {
            let mut tiles = self.tiles.lock();
            tiles.manager.reset(&full, samples);
            tiles.epoch += 1;
            tiles.buffers = buffers.clone();
            tiles.denoise = DenoiseParams {
                radius: self.params.denoise_radius,
                strength: self.params.denoise_strength,
                pass_stride: full.get_passes_size(),
                combined_offset: full.pass_offset(PassType::Combined).unwrap_or(0),
                denoised_offset: full.pass_offset(PassType::Denoised),
            };
            tiles.manager.state.total_pixel_samples
        };
        self.tiles_cond.notify_all();

        let film = full.film_constants(self.params.film.exposure);
        self.device.const_copy_to(FilmConstants::NAME, bytemuck::bytes_of(&film));
        if self.params.background {
            self.frame.reset(&full);
        }
        self.scene.resize_camera(full.full_width, full.full_height);

        self.progress.reset_sample();
        self.progress.set_total_pixel_samples(total);
        self.control.lock().applied();
        tracing::debug!(width = full.width, height = full.height, samples, "reset applied");
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn path_trace(self: &Arc<Self>) {
        let (denoise, tile_types) = {
            let tiles = self.tiles.lock();
            let types = if tiles.manager.settings().schedule_denoising {
                TileTypes::PATH_TRACE.union(TileTypes::DENOISE)
            } else {
                TileTypes::PATH_TRACE
            };
            (tiles.denoise, types)
        };
        let mut task = DeviceTask::new(DeviceTaskType::PathTrace);
        task.tile_types = tile_types;
        task.pass_stride = denoise.pass_stride;
        task.film = self.params.film;
        task.denoise = denoise;
        let source: Arc<dyn TileSource> = self.clone();
        task.tile_source = Some(source);

        self.device.task_add(task);
        self.wait_for_device();
    }

    /// Wait for the device to drain. Once a pending reset has waited
    /// `cancel_timeout`, or the session is cancelled, the device is told to
    /// cancel so queued work never runs on the old parameters.
    fn wait_for_device(&self) {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        thread::scope(|scope| {
            let device = &self.device;
            scope.spawn(move || {
                device.task_wait();
                let _ = done_tx.send(());
            });
            let mut cancelled = false;
            loop {
                match done_rx.recv_timeout(POLL) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                if !cancelled && (self.progress.get_cancel() || self.control.lock().cancel_requested()) {
                    tracing::debug!("cancelling device tasks");
                    cancelled = true;
                    self.device.task_cancel();
                }
            }
        });
    }

    fn round_finished(&self, deferred_tonemap: bool, round_start: Duration) {
        let (level, sample, buffers, done) = {
            let tiles = self.tiles.lock();
            let state = &tiles.manager.state;
            let sample = state.pass.max(0) as u32 + state.num_samples;
            (state.buffer.clone(), sample, tiles.buffers.clone(), tiles.manager.done())
        };
        let (total_time, _) = self.progress.get_time();
        self.progress.set_pass(sample, total_time, seconds_between(round_start, self.clock.now()));

        if let Some(buffers) = buffers {
            if self.params.background {
                if done || self.params.progressive_refine {
                    self.write_frame(&buffers, &level, sample, done);
                }
            } else {
                let job = Tonemap { buffers, level, sample };
                if deferred_tonemap {
                    self.defer_tonemap(job);
                } else {
                    self.tonemap(job);
                }
            }
        }
        self.progress.set_update();
    }

    fn tonemap(&self, job: Tonemap) {
        let mut display = self.display.lock();
        if let Some(buffer) = display.buffer.as_mut() {
            self.film_convert(buffer, &job);
            self.control.lock().display_updated();
        }
    }

    /// Leave the conversion to the next `draw` and wait for it, unless a
    /// reset or cancel makes the round obsolete first.
    fn defer_tonemap(&self, job: Tonemap) {
        self.display.lock().pending = Some(job);
        self.progress.set_update();

        let mut display = self.display.lock();
        while display.pending.is_some() {
            if self.progress.get_cancel() || self.control.lock().pending() {
                display.pending = None;
                break;
            }
            self.display_cond.wait_for(&mut display, POLL);
        }
    }

    fn film_convert(&self, display: &mut DisplayBuffer, job: &Tonemap) {
        let level = &job.level;
        let mut task = DeviceTask::new(DeviceTaskType::FilmConvert).with_region(level.full_x, level.full_y, level.width, level.height);
        {
            let b = job.buffers.lock();
            task.buffer = b.buffer.device_pointer;
            task.pass_stride = b.params.get_passes_size();
            task.pass_offset = b.params.pass_offset(PassType::Combined).unwrap_or(0);
            task.stride = b.params.width;
            task.offset = -(level.full_x + level.full_y * b.params.width);
        }
        task.sample = job.sample;
        task.film = self.params.film;
        if display.half_float {
            task.rgba_half = display.rgba().device_pointer;
        } else {
            task.rgba_byte = display.rgba().device_pointer;
        }
        self.device.task_add(task);
        self.device.task_wait();
        display.draw_set(level.width.min(display.params.width), level.height.min(display.params.height));
    }

    /// Hand the whole-frame buffers of a progressive background render to
    /// the writers.
    fn write_frame(&self, buffers: &SharedBuffers, level: &BufferParams, sample: u32, last: bool) {
        let mut b = buffers.lock();
        b.copy_from_device();
        let tile = RenderTile {
            x: level.full_x,
            y: level.full_y,
            w: level.width,
            h: level.height,
            num_samples: sample,
            sample,
            resolution: 1,
            pass_stride: b.params.get_passes_size(),
            ..Default::default()
        };
        let writer = self.writer.read().clone();
        if last {
            self.frame.write_render_tile(&tile, &b);
            if let Some(writer) = writer {
                writer.write_render_tile(&tile, &b);
            }
        } else {
            self.frame.update_render_tile(&tile, &b);
            if let Some(writer) = writer {
                writer.update_render_tile(&tile, &b);
            }
        }
    }

    fn write_tile(&self, tile: &RenderTile, buffers: &SharedBuffers) {
        let mut b = buffers.lock();
        b.copy_from_device();
        self.frame.write_render_tile(tile, &b);
        if let Some(writer) = self.writer.read().clone() {
            writer.write_render_tile(tile, &b);
        }
    }

    fn update_status(&self, paused: bool, done: bool) {
        let substatus = {
            let tiles = self.tiles.lock();
            let manager = &tiles.manager;
            if self.params.tiled_output() {
                let mut s = format!("Rendered {}/{} Tiles", self.progress.get_rendered_tiles(), manager.state.tiles.len());
                if manager.settings().schedule_denoising {
                    s += &format!(", Denoised {} Tiles", self.progress.get_denoised_tiles());
                }
                s
            } else if manager.state.resolution_divider > 1 {
                format!("Preview 1/{}", manager.state.resolution_divider)
            } else {
                let sample = (manager.state.pass.max(0) as u32 + manager.state.num_samples).min(manager.num_samples);
                format!("Sample {}/{}", sample, manager.num_samples)
            }
        };
        let status = if paused {
            "Rendering Paused"
        } else if done {
            "Rendering Done"
        } else {
            "Rendering"
        };
        self.progress.set_status(status, &substatus);
    }
}

/// Where `buffers` place pixel `(x, y)` of a tile at `level`.
fn tile_addressing(level: &BufferParams, whole_frame: bool, buffers: &RenderBuffers) -> (i32, i32) {
    if whole_frame {
        (-(level.full_x + level.full_y * buffers.params.width), buffers.params.width)
    } else {
        buffers.params.get_offset_stride()
    }
}

fn bind_buffers(tile: &mut RenderTile, level: &BufferParams, whole_frame: bool, buffers: SharedBuffers) {
    {
        let b = buffers.lock();
        tile.buffer = b.buffer.device_pointer;
        tile.rng_state = b.rng_state.device_pointer;
        tile.pass_stride = b.params.get_passes_size();
        (tile.offset, tile.stride) = tile_addressing(level, whole_frame, &b);
    }
    tile.buffers = Some(buffers);
}

impl TileSource for SessionInner {
    fn acquire_tile(&self, device: &Arc<dyn Device>, rtile: &mut RenderTile, tile_types: TileTypes) -> bool {
        let device_num = self.device.device_number(device.as_ref());
        let mut tiles = self.tiles.lock();
        let index = loop {
            if self.get_cancel() || self.device.have_error() {
                return false;
            }
            if let Some(index) = tiles.manager.next_tile(device_num, tile_types) {
                break index;
            }
            // Denoise tiles appear as neighbours finish rendering.
            if tile_types.contains(TileTypes::DENOISE) && tiles.manager.may_need_denoise() && tiles.manager.has_tiles() {
                self.tiles_cond.wait_for(&mut tiles, POLL);
                continue;
            }
            return false;
        };

        let epoch = tiles.epoch;
        let whole = tiles.buffers.clone();
        let state = &tiles.manager.state;
        let level = state.buffer.clone();
        let tile = &state.tiles[index];
        let (tx, ty, tw, th) = (tile.x, tile.y, tile.w, tile.h);
        let denoise = tile.state == TileState::Denoise;
        let tile_buffers = tile.buffers.clone();
        let pass = state.pass.max(0) as u32;
        let num_samples = state.num_samples;

        *rtile = RenderTile {
            x: level.full_x + tx,
            y: level.full_y + ty,
            w: tw,
            h: th,
            start_sample: pass,
            num_samples,
            sample: if denoise { pass + num_samples } else { pass },
            resolution: state.resolution_divider.max(1) as u32,
            tile_index: index,
            task: if denoise { RenderTileTask::Denoise } else { RenderTileTask::PathTrace },
            epoch,
            ..Default::default()
        };

        if let Some(whole) = whole {
            drop(tiles);
            bind_buffers(rtile, &level, true, whole);
            self.device.map_tile(device.as_ref(), rtile);
            return true;
        }

        // Per-tile buffers live on the device that renders the tile.
        let buffers = match tile_buffers {
            Some(buffers) => buffers,
            None => {
                let mut params = tiles.manager.params.clone();
                params.width = tw;
                params.height = th;
                params.full_x = level.full_x + tx;
                params.full_y = level.full_y + ty;
                let buffers = RenderBuffers::with_params(Arc::clone(device), &params).shared();
                tiles.manager.state.tiles[index].buffers = Some(Arc::clone(&buffers));
                buffers
            }
        };
        drop(tiles);
        bind_buffers(rtile, &level, false, buffers);
        true
    }

    fn update_progress(&self, tile: Option<&RenderTile>, pixel_samples: u64) {
        self.progress.add_samples(pixel_samples, tile.map_or(0, |t| t.sample));
    }

    fn release_tile(&self, _device: &Arc<dyn Device>, rtile: &mut RenderTile) {
        let buffers = rtile.buffers.take();
        let denoise = rtile.task == RenderTileTask::Denoise;
        let finished = {
            let mut tiles = self.tiles.lock();
            if rtile.epoch != tiles.epoch {
                tracing::trace!(tile = rtile.tile_index, "stale tile discarded");
                return;
            }
            if !denoise && !rtile.is_complete() {
                // Cancelled part way; the round is abandoned.
                return;
            }
            let finished = tiles.manager.finish_tile(rtile.tile_index);
            if finished.delete {
                tiles.manager.state.tiles[rtile.tile_index].buffers = None;
            }
            finished
        };
        self.tiles_cond.notify_all();

        self.progress.add_finished_tile(denoise);
        if denoise {
            self.progress.add_samples(rtile.num_pixels(), rtile.sample);
        }
        if finished.write && self.params.tiled_output() {
            if let Some(buffers) = buffers {
                self.write_tile(rtile, &buffers);
            }
        }
    }

    fn get_cancel(&self) -> bool {
        self.progress.get_cancel() || self.control.lock().cancel_requested()
    }

    fn map_neighbor_tiles(&self, neighbors: &mut RenderTileNeighbors, device: &Arc<dyn Device>) {
        let center = neighbors.center().clone();
        let mut found: Vec<(usize, RenderTile, SharedBuffers)> = Vec::new();
        let (level, whole) = {
            let tiles = self.tiles.lock();
            if center.epoch != tiles.epoch {
                return;
            }
            let state = &tiles.manager.state;
            for n in 0..RenderTileNeighbors::SIZE {
                if n == RenderTileNeighbors::CENTER {
                    continue;
                }
                let Some(nindex) = tiles.manager.get_neighbor_index(center.tile_index, n) else { continue };
                let tile = &state.tiles[nindex];
                let Some(buffers) = tiles.buffers.clone().or_else(|| tile.buffers.clone()) else { continue };
                let rtile = RenderTile {
                    x: state.buffer.full_x + tile.x,
                    y: state.buffer.full_y + tile.y,
                    w: tile.w,
                    h: tile.h,
                    start_sample: center.start_sample,
                    num_samples: center.num_samples,
                    sample: center.sample,
                    resolution: center.resolution,
                    tile_index: nindex,
                    task: RenderTileTask::Denoise,
                    epoch: center.epoch,
                    ..Default::default()
                };
                found.push((n, rtile, buffers));
            }
            (state.buffer.clone(), tiles.buffers.is_some())
        };

        for (n, mut rtile, buffers) in found {
            bind_buffers(&mut rtile, &level, whole, buffers);
            neighbors.tiles[n] = rtile;
        }
        self.device.map_neighbor_tiles(device.as_ref(), neighbors);
    }

    fn unmap_neighbor_tiles(&self, neighbors: &mut RenderTileNeighbors, device: &Arc<dyn Device>) {
        self.device.unmap_neighbor_tiles(device.as_ref(), neighbors);
    }
}
