//! Session configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::buffers::FilmParams;
use crate::tile::{TileOrder, TileSettings};
use crate::util::{Error, Result};

/// Immutable configuration a session is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// Render to completion without a display and stop.
    pub background: bool,
    /// One sample per round, starting at a coarse resolution when interactive.
    pub progressive: bool,
    /// Background render that writes the whole frame after every pass.
    pub progressive_refine: bool,
    pub samples: u32,
    pub tile_size: (i32, i32),
    pub tile_order: TileOrder,
    /// Interactive start resolution: the first level has at most this many
    /// pixels squared. `None` starts at full resolution.
    pub start_resolution: Option<i32>,
    /// CPU worker threads, 0 = all cores.
    pub threads: usize,
    /// Keep display pixels as linear half floats.
    pub display_buffer_linear: bool,
    pub film: FilmParams,

    // Denoising
    pub run_denoising: bool,
    pub denoise_radius: i32,
    pub denoise_strength: f32,

    // Timeouts, in seconds
    /// Resets arriving while the display is current are applied after this.
    pub reset_timeout: f64,
    /// Longest a pending reset waits; running tiles are cancelled after it.
    pub cancel_timeout: f64,
    /// How long `draw` keeps showing an outdated image.
    pub text_timeout: f64,

    /// Written by [`Session::write_output`](super::Session::write_output)
    /// callers such as the CLI.
    pub output_path: Option<PathBuf>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            background: false,
            progressive: true,
            progressive_refine: false,
            samples: 16,
            tile_size: (64, 64),
            tile_order: TileOrder::Center,
            start_resolution: Some(64),
            threads: 0,
            display_buffer_linear: false,
            film: FilmParams::default(),
            run_denoising: false,
            denoise_radius: 4,
            denoise_strength: 0.5,
            reset_timeout: 0.1,
            cancel_timeout: 0.1,
            text_timeout: 1.0,
            output_path: None,
        }
    }
}

impl SessionParams {
    /// Background render of `samples` samples per pixel.
    pub fn background(samples: u32) -> Self {
        Self {
            background: true,
            progressive: false,
            samples,
            start_resolution: None,
            ..Default::default()
        }
    }

    /// Read a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        tracing::debug!(path = %path.display(), "loaded session params");
        Ok(params)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size.0 <= 0 || self.tile_size.1 <= 0 {
            return Err(Error::invalid(format!("tile size {:?} must be positive", self.tile_size)));
        }
        if matches!(self.start_resolution, Some(r) if r <= 0) {
            return Err(Error::invalid("start_resolution must be positive"));
        }
        for (name, value) in [
            ("reset_timeout", self.reset_timeout),
            ("cancel_timeout", self.cancel_timeout),
            ("text_timeout", self.text_timeout),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::invalid(format!("{name} must be a non-negative number of seconds")));
            }
        }
        if self.denoise_radius < 0 {
            return Err(Error::invalid("denoise_radius must not be negative"));
        }
        if self.progressive_refine && !self.background {
            return Err(Error::invalid("progressive_refine requires background rendering"));
        }
        Ok(())
    }

    /// True when going from `self` to `other` needs a new session. The
    /// sample count and output path can change on a running session.
    pub fn modified(&self, other: &SessionParams) -> bool {
        !(self.background == other.background
            && self.progressive == other.progressive
            && self.progressive_refine == other.progressive_refine
            && self.tile_size == other.tile_size
            && self.tile_order == other.tile_order
            && self.start_resolution == other.start_resolution
            && self.threads == other.threads
            && self.display_buffer_linear == other.display_buffer_linear
            && self.film == other.film
            && self.run_denoising == other.run_denoising
            && self.denoise_radius == other.denoise_radius
            && self.denoise_strength == other.denoise_strength
            && self.reset_timeout == other.reset_timeout
            && self.cancel_timeout == other.cancel_timeout
            && self.text_timeout == other.text_timeout)
    }

    /// Rounds render one sample each.
    pub fn is_progressive(&self) -> bool {
        self.progressive || self.progressive_refine
    }

    /// One accumulation buffer for the whole frame, kept across rounds. Only
    /// a non-progressive background render uses per-tile buffers instead.
    pub fn whole_frame_buffers(&self) -> bool {
        !self.background || self.is_progressive()
    }

    /// Per-tile buffers written out as tiles finish.
    pub fn tiled_output(&self) -> bool {
        !self.whole_frame_buffers()
    }

    /// Denoise tiles are scheduled between render tiles.
    pub fn schedule_denoising(&self) -> bool {
        self.run_denoising && self.tiled_output()
    }

    pub fn tile_settings(&self) -> TileSettings {
        TileSettings {
            progressive: self.is_progressive(),
            tile_size: self.tile_size,
            min_size: if self.background { None } else { self.start_resolution },
            // Whole-frame buffers are read back in per-device bands.
            preserve_tile_device: self.whole_frame_buffers(),
            background: self.background,
            tile_order: self.tile_order,
            schedule_denoising: self.schedule_denoising(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SessionParams::default().validate().unwrap();
        SessionParams::background(4).validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let bad = SessionParams { tile_size: (0, 32), ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = SessionParams { cancel_timeout: f64::NAN, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = SessionParams { progressive_refine: true, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_modified_ignores_samples() {
        let a = SessionParams::default();
        let mut b = a.clone();
        b.samples = 1000;
        b.output_path = Some("out.png".into());
        assert!(!a.modified(&b));
        b.tile_size = (32, 32);
        assert!(a.modified(&b));
    }

    #[test]
    fn test_tile_settings() {
        let interactive = SessionParams::default().tile_settings();
        assert!(interactive.preserve_tile_device);
        assert_eq!(interactive.min_size, Some(64));

        let mut params = SessionParams::background(8);
        params.run_denoising = true;
        params.start_resolution = Some(16);
        let background = params.tile_settings();
        assert!(!background.preserve_tile_device);
        assert!(background.schedule_denoising);
        assert_eq!(background.min_size, None);

        params.progressive_refine = true;
        let refine = params.tile_settings();
        assert!(refine.progressive);
        assert!(refine.preserve_tile_device);
        assert!(!refine.schedule_denoising);
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{ "samples": 3, "background": true, "progressive": false }"#).unwrap();
        let params = SessionParams::load(&path).unwrap();
        assert_eq!(params.samples, 3);
        assert!(params.background);
        assert_eq!(params.tile_size, (64, 64));

        params.save(&path).unwrap();
        assert_eq!(SessionParams::load(&path).unwrap(), params);

        std::fs::write(&path, r#"{ "tile_size": [0, 0] }"#).unwrap();
        assert!(matches!(SessionParams::load(&path), Err(Error::InvalidParams(_))));
    }
}
