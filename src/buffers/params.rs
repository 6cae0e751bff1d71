//! Buffer extents and pass layout.

use serde::{Deserialize, Serialize};

use crate::util::align_up;
use super::passes::{FilmConstants, PassType};

/// Extents of a buffer plus the passes it stores.
///
/// `width`/`height` is the region actually stored. `full_*` places it inside
/// the full image, which is what kernels address pixels in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferParams {
    pub width: i32,
    pub height: i32,
    pub full_x: i32,
    pub full_y: i32,
    pub full_width: i32,
    pub full_height: i32,
    pub passes: Vec<PassType>,
    /// Keep a denoised copy of the combined pass.
    pub denoising_data_pass: bool,
}

impl Default for BufferParams {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            full_x: 0,
            full_y: 0,
            full_width: 0,
            full_height: 0,
            passes: vec![PassType::Combined],
            denoising_data_pass: false,
        }
    }
}

impl BufferParams {
    /// Full-frame params for a `width` x `height` image with the combined pass.
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            full_width: width,
            full_height: height,
            ..Default::default()
        }
    }

    /// True when reallocation is needed to go from `self` to `other`.
    pub fn modified(&self, other: &BufferParams) -> bool {
        !(self.full_x == other.full_x
            && self.full_y == other.full_y
            && self.width == other.width
            && self.height == other.height
            && self.full_width == other.full_width
            && self.full_height == other.full_height
            && self.passes == other.passes
            && self.denoising_data_pass == other.denoising_data_pass)
    }

    /// Floats per pixel, aligned to 4.
    pub fn get_passes_size(&self) -> usize {
        let mut size: usize = self.passes.iter().map(|p| p.components()).sum();
        if self.denoising_data_pass && !self.passes.contains(&PassType::Denoised) {
            size += PassType::Denoised.components();
        }
        align_up(size, 4)
    }

    /// Offset in floats of `pass` inside a pixel, if stored.
    pub fn pass_offset(&self, pass: PassType) -> Option<usize> {
        let mut offset = 0;
        for p in &self.passes {
            if *p == pass {
                return Some(offset);
            }
            offset += p.components();
        }
        if pass == PassType::Denoised && self.denoising_data_pass {
            return Some(offset);
        }
        None
    }

    /// `(offset, stride)` turning full-image pixel coordinates into indices of
    /// this buffer: `index = offset + x + y * stride`.
    pub fn get_offset_stride(&self) -> (i32, i32) {
        (-(self.full_x + self.full_y * self.width), self.width)
    }

    #[inline]
    pub fn num_pixels(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize)
    }

    /// Film constants matching this layout.
    pub fn film_constants(&self, exposure: f32) -> FilmConstants {
        let off = |p| self.pass_offset(p).map(|o| o as u32).unwrap_or(FilmConstants::ABSENT);
        FilmConstants {
            pass_stride: self.get_passes_size() as u32,
            pass_combined: off(PassType::Combined),
            pass_depth: off(PassType::Depth),
            pass_normal: off(PassType::Normal),
            pass_denoised: off(PassType::Denoised),
            pass_motion: off(PassType::Motion),
            pass_motion_weight: off(PassType::MotionWeight),
            exposure,
        }
    }

    /// The same region at `1/divider` resolution.
    pub fn downscaled(&self, divider: i32) -> BufferParams {
        let divider = divider.max(1);
        BufferParams {
            width: self.width / divider,
            height: self.height / divider,
            full_x: self.full_x / divider,
            full_y: self.full_y / divider,
            full_width: self.full_width / divider,
            full_height: self.full_height / divider,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified() {
        let a = BufferParams::new(64, 32);
        let mut b = a.clone();
        assert!(!a.modified(&b));
        b.full_x = 3;
        assert!(a.modified(&b));
        let mut c = a.clone();
        c.passes.push(PassType::Depth);
        assert!(a.modified(&c));
    }

    #[test]
    fn test_passes_size_aligned() {
        let mut params = BufferParams::new(4, 4);
        assert_eq!(params.get_passes_size(), 4);
        params.passes.push(PassType::Depth);
        assert_eq!(params.get_passes_size(), 8);
        params.passes.push(PassType::Mist);
        assert_eq!(params.get_passes_size(), 8);
        assert_eq!(params.pass_offset(PassType::Mist), Some(5));
        assert_eq!(params.pass_offset(PassType::Normal), None);
    }

    #[test]
    fn test_denoising_pass_appended() {
        let mut params = BufferParams::new(4, 4);
        params.passes.push(PassType::Depth);
        params.denoising_data_pass = true;
        assert_eq!(params.pass_offset(PassType::Denoised), Some(5));
        assert_eq!(params.get_passes_size(), 12);
        let film = params.film_constants(2.0);
        assert_eq!(film.pass_denoised, 5);
        assert_eq!(film.pass_stride, 12);
        assert_eq!(film.exposure, 2.0);
        assert!(!FilmConstants::has(film.pass_normal));
    }

    #[test]
    fn test_offset_stride_maps_to_local() {
        let mut params = BufferParams::new(16, 8);
        params.full_x = 32;
        params.full_y = 16;
        let (offset, stride) = params.get_offset_stride();
        assert_eq!(offset + 32 + 16 * stride, 0);
        assert_eq!(offset + 33 + 17 * stride, 17);
    }

    #[test]
    fn test_downscaled() {
        let params = BufferParams::new(100, 50).downscaled(4);
        assert_eq!((params.width, params.height), (25, 12));
        assert_eq!(params.full_width, 25);
    }
}
