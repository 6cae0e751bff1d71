//! Render pass layout.
//!
//! Every pixel of an accumulation buffer is a block of `pass_stride` floats;
//! each requested pass occupies a fixed run of components inside it.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Named accumulation channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassType {
    Combined,
    Depth,
    Mist,
    Normal,
    Uv,
    ObjectId,
    MaterialId,
    Motion,
    MotionWeight,
    Emission,
    Background,
    Ao,
    Shadow,
    DiffuseColor,
    GlossyColor,
    TransmissionColor,
    DiffuseDirect,
    DiffuseIndirect,
    GlossyDirect,
    GlossyIndirect,
    TransmissionDirect,
    TransmissionIndirect,
    /// Output of the tile denoiser, same layout as Combined.
    Denoised,
}

impl PassType {
    /// Floats this pass takes per pixel.
    pub const fn components(self) -> usize {
        match self {
            PassType::Depth
            | PassType::Mist
            | PassType::ObjectId
            | PassType::MaterialId
            | PassType::MotionWeight => 1,
            _ => 4,
        }
    }

    /// Accumulated over samples, so reading it divides by the sample count.
    pub const fn filter(self) -> bool {
        !matches!(
            self,
            PassType::Depth
                | PassType::ObjectId
                | PassType::MaterialId
                | PassType::Motion
                | PassType::MotionWeight
        )
    }

    /// Scaled by film exposure when read.
    pub const fn exposure(self) -> bool {
        matches!(
            self,
            PassType::Combined
                | PassType::Emission
                | PassType::Background
                | PassType::DiffuseDirect
                | PassType::DiffuseIndirect
                | PassType::GlossyDirect
                | PassType::GlossyIndirect
                | PassType::TransmissionDirect
                | PassType::TransmissionIndirect
                | PassType::Denoised
        )
    }

    /// Light passes stored pre-multiplied by a colour pass get divided by it.
    pub const fn divide_by(self) -> Option<PassType> {
        match self {
            PassType::DiffuseDirect | PassType::DiffuseIndirect => Some(PassType::DiffuseColor),
            PassType::GlossyDirect | PassType::GlossyIndirect => Some(PassType::GlossyColor),
            PassType::TransmissionDirect | PassType::TransmissionIndirect => {
                Some(PassType::TransmissionColor)
            }
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PassType::Combined => "Combined",
            PassType::Depth => "Depth",
            PassType::Mist => "Mist",
            PassType::Normal => "Normal",
            PassType::Uv => "UV",
            PassType::ObjectId => "IndexOB",
            PassType::MaterialId => "IndexMA",
            PassType::Motion => "Vector",
            PassType::MotionWeight => "VectorWeight",
            PassType::Emission => "Emit",
            PassType::Background => "Env",
            PassType::Ao => "AO",
            PassType::Shadow => "Shadow",
            PassType::DiffuseColor => "DiffCol",
            PassType::GlossyColor => "GlossCol",
            PassType::TransmissionColor => "TransCol",
            PassType::DiffuseDirect => "DiffDir",
            PassType::DiffuseIndirect => "DiffInd",
            PassType::GlossyDirect => "GlossDir",
            PassType::GlossyIndirect => "GlossInd",
            PassType::TransmissionDirect => "TransDir",
            PassType::TransmissionIndirect => "TransInd",
            PassType::Denoised => "Denoised",
        }
    }
}

/// Append `pass` unless already present. Motion implies its weight pass and
/// light passes imply their colour pass.
pub fn add_pass(passes: &mut Vec<PassType>, pass: PassType) {
    if passes.contains(&pass) {
        return;
    }
    passes.push(pass);
    if pass == PassType::Motion {
        add_pass(passes, PassType::MotionWeight);
    }
    if let Some(color) = pass.divide_by() {
        add_pass(passes, color);
    }
}

/// Pass offsets uploaded to kernels under [`FilmConstants::NAME`].
///
/// Offsets are in floats from the start of a pixel; `u32::MAX` marks an
/// absent pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FilmConstants {
    pub pass_stride: u32,
    pub pass_combined: u32,
    pub pass_depth: u32,
    pub pass_normal: u32,
    pub pass_denoised: u32,
    pub pass_motion: u32,
    pub pass_motion_weight: u32,
    pub exposure: f32,
}

impl FilmConstants {
    pub const NAME: &'static str = "film";
    pub const ABSENT: u32 = u32::MAX;

    pub fn has(offset: u32) -> bool {
        offset != Self::ABSENT
    }
}

impl Default for FilmConstants {
    fn default() -> Self {
        Self {
            pass_stride: 4,
            pass_combined: 0,
            pass_depth: Self::ABSENT,
            pass_normal: Self::ABSENT,
            pass_denoised: Self::ABSENT,
            pass_motion: Self::ABSENT,
            pass_motion_weight: Self::ABSENT,
            exposure: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components() {
        assert_eq!(PassType::Combined.components(), 4);
        assert_eq!(PassType::Depth.components(), 1);
        assert_eq!(PassType::MotionWeight.components(), 1);
        assert_eq!(PassType::Denoised.components(), 4);
    }

    #[test]
    fn test_add_pass_dependencies() {
        let mut passes = vec![PassType::Combined];
        add_pass(&mut passes, PassType::Motion);
        add_pass(&mut passes, PassType::GlossyDirect);
        add_pass(&mut passes, PassType::Combined);
        assert_eq!(
            passes,
            vec![
                PassType::Combined,
                PassType::Motion,
                PassType::MotionWeight,
                PassType::GlossyDirect,
                PassType::GlossyColor,
            ]
        );
    }

    #[test]
    fn test_flags() {
        assert!(PassType::Combined.filter() && PassType::Combined.exposure());
        assert!(!PassType::Depth.filter());
        assert!(!PassType::Normal.exposure());
        assert_eq!(PassType::DiffuseIndirect.divide_by(), Some(PassType::DiffuseColor));
    }

    #[test]
    fn test_film_constants_default() {
        let film = FilmConstants::default();
        assert_eq!(film.pass_stride, 4);
        assert!(FilmConstants::has(film.pass_combined));
        assert!(!FilmConstants::has(film.pass_denoised));
        assert_eq!(bytemuck::bytes_of(&film).len(), 32);
    }
}
