//! Film conversion: accumulated radiance to display pixels.

use glam::{Mat3, Vec3, Vec4};
use half::f16;
use serde::{Deserialize, Serialize};

/// Display transform applied after exposure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToneMap {
    #[default]
    None,
    Aces,
    Reinhard,
    Agx,
}

impl ToneMap {
    pub fn apply(self, color: Vec3) -> Vec3 {
        match self {
            ToneMap::None => color,
            ToneMap::Aces => aces(color),
            ToneMap::Reinhard => color / (color + Vec3::ONE),
            ToneMap::Agx => agx_eotf(agx(color)),
        }
    }
}

/// How the session turns buffers into display pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilmParams {
    pub exposure: f32,
    pub tonemap: ToneMap,
    /// Write linear half floats instead of sRGB bytes.
    pub use_half: bool,
}

impl Default for FilmParams {
    fn default() -> Self {
        Self { exposure: 1.0, tonemap: ToneMap::None, use_half: false }
    }
}

/// Normalised, exposed and tone-mapped colour of one accumulated pixel.
/// Alpha is only normalised and clamped.
#[inline]
pub fn film_map(pixel: Vec4, sample_scale: f32, film: &FilmParams) -> Vec4 {
    let rgb = film.tonemap.apply(pixel.truncate() * (sample_scale * film.exposure));
    rgb.max(Vec3::ZERO).extend((pixel.w * sample_scale).clamp(0.0, 1.0))
}

/// sRGB encoded 8-bit display pixel.
#[inline]
pub fn film_map_byte(pixel: Vec4, sample_scale: f32, film: &FilmParams) -> [u8; 4] {
    let c = film_map(pixel, sample_scale, film);
    [
        to_byte(linear_to_srgb(c.x)),
        to_byte(linear_to_srgb(c.y)),
        to_byte(linear_to_srgb(c.z)),
        to_byte(c.w),
    ]
}

/// Linear half-float display pixel.
#[inline]
pub fn film_map_half(pixel: Vec4, sample_scale: f32, film: &FilmParams) -> [f16; 4] {
    let c = film_map(pixel, sample_scale, film);
    [f16::from_f32(c.x), f16::from_f32(c.y), f16::from_f32(c.z), f16::from_f32(c.w)]
}

#[inline]
fn to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

#[inline]
pub fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn aces(color: Vec3) -> Vec3 {
    let input = Mat3::from_cols(
        Vec3::new(0.59719, 0.07600, 0.02840),
        Vec3::new(0.35458, 0.90834, 0.13383),
        Vec3::new(0.04823, 0.01566, 0.83777),
    );
    let output = Mat3::from_cols(
        Vec3::new(1.60475, -0.10208, -0.00327),
        Vec3::new(-0.53108, 1.10813, -0.07276),
        Vec3::new(-0.07367, -0.00605, 1.07602),
    );
    let v = input * color;
    let a = v * (v + Vec3::splat(0.024_578_6)) - Vec3::splat(0.000_090_537);
    let b = v * (v * 0.983_729 + Vec3::splat(0.432_951)) + Vec3::splat(0.238_081);
    (output * (a / b)).clamp(Vec3::ZERO, Vec3::ONE)
}

fn agx_contrast(x: Vec3) -> Vec3 {
    let x2 = x * x;
    let x4 = x2 * x2;
    x4 * x2 * 15.5 - x4 * x * 40.14 + x4 * 31.96 - x2 * x * 6.868 + x2 * 0.4298 + x * 0.1191
        - Vec3::splat(0.00232)
}

fn agx(v: Vec3) -> Vec3 {
    const MIN_EV: f32 = -12.473_93;
    const MAX_EV: f32 = 4.026_069;
    let m = Mat3::from_cols(
        Vec3::new(0.842_479_06, 0.078_433_6, 0.079_223_745),
        Vec3::new(0.042_328_242, 0.878_468_6, 0.079_166_13),
        Vec3::new(0.042_375_655, 0.078_433_6, 0.879_142_97),
    );
    let v = m * v;
    let log = Vec3::new(
        v.x.max(1e-10).log2(),
        v.y.max(1e-10).log2(),
        v.z.max(1e-10).log2(),
    )
    .clamp(Vec3::splat(MIN_EV), Vec3::splat(MAX_EV));
    agx_contrast((log - Vec3::splat(MIN_EV)) / (MAX_EV - MIN_EV))
}

fn agx_eotf(v: Vec3) -> Vec3 {
    let inv = Mat3::from_cols(
        Vec3::new(1.196_879, -0.098_020_88, -0.099_029_74),
        Vec3::new(-0.052_896_85, 1.151_903_1, -0.098_961_18),
        Vec3::new(-0.052_971_635, -0.098_043_45, 1.151_073_7),
    );
    let v = (inv * v).max(Vec3::ZERO);
    Vec3::new(v.x.powf(2.2), v.y.powf(2.2), v.z.powf(2.2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_scale_and_exposure() {
        let film = FilmParams { exposure: 2.0, ..Default::default() };
        let c = film_map(Vec4::new(4.0, 2.0, 0.0, 4.0), 0.25, &film);
        assert_eq!(c, Vec4::new(2.0, 1.0, 0.0, 1.0));
    }

    #[test]
    fn test_byte_encoding() {
        let film = FilmParams::default();
        assert_eq!(film_map_byte(Vec4::new(1.0, 0.0, 8.0, 1.0), 1.0, &film), [255, 0, 255, 255]);
        // Mid grey in linear is ~188 in sRGB.
        let grey = film_map_byte(Vec4::new(0.5, 0.5, 0.5, 0.5), 1.0, &film);
        assert_eq!(grey[0], 188);
        assert_eq!(grey[3], 128);
    }

    #[test]
    fn test_half_is_linear() {
        let film = FilmParams { use_half: true, ..Default::default() };
        let px = film_map_half(Vec4::new(3.0, 1.5, 0.0, 3.0), 1.0 / 3.0, &film);
        assert_eq!(px[0].to_f32(), 1.0);
        assert_eq!(px[1].to_f32(), 0.5);
    }

    #[test]
    fn test_tonemaps_bounded() {
        for map in [ToneMap::Aces, ToneMap::Reinhard, ToneMap::Agx] {
            let c = map.apply(Vec3::splat(100.0));
            assert!(c.max_element() <= 1.05, "{map:?} -> {c:?}");
            assert!(c.min_element() >= 0.0);
        }
        assert_eq!(ToneMap::Reinhard.apply(Vec3::ONE), Vec3::splat(0.5));
    }
}
