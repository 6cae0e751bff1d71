//! Neighbour-aware tile denoising.
//!
//! A joint bilateral filter over the combined pass. Filtering a tile reads a
//! `radius` pixel apron from its neighbours, which is why denoise tiles are
//! only scheduled once all neighbours have rendered.

use glam::Vec4;
use serde::{Deserialize, Serialize};

use crate::util::Rect;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseParams {
    /// Filter radius in pixels.
    pub radius: i32,
    /// Relative colour difference at which a neighbour's weight drops off.
    pub strength: f32,
    pub pass_stride: usize,
    pub combined_offset: usize,
    /// Where the result goes; `None` filters the combined pass in place.
    pub denoised_offset: Option<usize>,
}

impl Default for DenoiseParams {
    fn default() -> Self {
        Self {
            radius: 4,
            strength: 0.5,
            pass_stride: 4,
            combined_offset: 0,
            denoised_offset: None,
        }
    }
}

impl DenoiseParams {
    pub fn output_offset(&self) -> usize {
        self.denoised_offset.unwrap_or(self.combined_offset)
    }
}

/// Gathered input pixels around a tile. Pixels no neighbour provided stay
/// invalid and are skipped by the filter.
#[derive(Clone, Debug)]
pub struct Window {
    pub rect: Rect,
    color: Vec<Vec4>,
    valid: Vec<bool>,
}

impl Window {
    pub fn new(rect: Rect) -> Self {
        let n = rect.area();
        Self { rect, color: vec![Vec4::ZERO; n], valid: vec![false; n] }
    }

    #[inline]
    fn index(&self, x: i32, y: i32) -> Option<usize> {
        self.rect
            .contains(x, y)
            .then(|| ((y - self.rect.y) * self.rect.w + (x - self.rect.x)) as usize)
    }

    pub fn set(&mut self, x: i32, y: i32, color: Vec4) {
        if let Some(i) = self.index(x, y) {
            self.color[i] = color;
            self.valid[i] = true;
        }
    }

    pub fn get(&self, x: i32, y: i32) -> Option<Vec4> {
        let i = self.index(x, y)?;
        self.valid[i].then_some(self.color[i])
    }
}

/// Filter `target` (which must lie inside the window), row-major output.
pub fn filter_region(window: &Window, target: Rect, params: &DenoiseParams) -> Vec<Vec4> {
    let radius = params.radius.max(0);
    let sigma_s = (radius as f32 * 0.5).max(0.5);
    let inv_2s2 = 1.0 / (2.0 * sigma_s * sigma_s);
    let sigma_r = params.strength.max(1e-4);
    let inv_2r2 = 1.0 / (2.0 * sigma_r * sigma_r);

    let mut out = Vec::with_capacity(target.area());
    for y in target.y..target.bottom() {
        for x in target.x..target.right() {
            let Some(center) = window.get(x, y) else {
                out.push(Vec4::ZERO);
                continue;
            };
            let norm = center.truncate().length_squared() + 1e-4;
            let mut sum = Vec4::ZERO;
            let mut weight = 0.0f32;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let Some(c) = window.get(x + dx, y + dy) else { continue };
                    let d2 = (dx * dx + dy * dy) as f32;
                    let diff = (c - center).truncate().length_squared() / norm;
                    let w = (-d2 * inv_2s2 - diff * inv_2r2).exp();
                    sum += c * w;
                    weight += w;
                }
            }
            out.push(if weight > 0.0 { sum / weight } else { center });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds() {
        let mut window = Window::new(Rect::new(10, 10, 4, 4));
        window.set(11, 12, Vec4::ONE);
        window.set(0, 0, Vec4::ONE);
        assert_eq!(window.get(11, 12), Some(Vec4::ONE));
        assert_eq!(window.get(10, 10), None);
        assert_eq!(window.get(0, 0), None);
    }

    #[test]
    fn test_constant_image_unchanged() {
        let rect = Rect::new(0, 0, 8, 8);
        let mut window = Window::new(rect);
        for y in 0..8 {
            for x in 0..8 {
                window.set(x, y, Vec4::new(0.5, 0.25, 1.0, 1.0));
            }
        }
        let out = filter_region(&window, Rect::new(2, 2, 4, 4), &DenoiseParams::default());
        assert_eq!(out.len(), 16);
        for c in out {
            assert!((c - Vec4::new(0.5, 0.25, 1.0, 1.0)).abs().max_element() < 1e-5);
        }
    }

    #[test]
    fn test_noise_reduced() {
        let rect = Rect::new(0, 0, 9, 9);
        let mut window = Window::new(rect);
        for y in 0..9 {
            for x in 0..9 {
                let v = if (x + y) % 2 == 0 { 1.2 } else { 0.8 };
                window.set(x, y, Vec4::new(v, v, v, 1.0));
            }
        }
        let params = DenoiseParams { strength: 2.0, ..Default::default() };
        let out = filter_region(&window, Rect::new(4, 4, 1, 1), &params);
        assert!((out[0].x - 1.0).abs() < 0.1, "{:?}", out[0]);
    }

    #[test]
    fn test_edges_preserved() {
        let rect = Rect::new(0, 0, 8, 8);
        let mut window = Window::new(rect);
        for y in 0..8 {
            for x in 0..8 {
                let v = if x < 4 { 0.0 } else { 10.0 };
                window.set(x, y, Vec4::new(v, v, v, 1.0));
            }
        }
        let params = DenoiseParams { strength: 0.1, ..Default::default() };
        let out = filter_region(&window, Rect::new(4, 4, 1, 1), &params);
        assert!(out[0].x > 9.9);
    }
}
