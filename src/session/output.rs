//! Frame assembly from written tiles.

use glam::Vec4;
use parking_lot::Mutex;

use crate::buffers::{film_map_byte, BufferParams, FilmParams, PassType, RenderBuffers};
use crate::tile::RenderTile;
use super::scene::TileWriter;

#[derive(Debug, Default)]
struct Frame {
    params: BufferParams,
    /// Normalised RGBA, row-major over `params.width x params.height`.
    pixels: Vec<f32>,
    written: usize,
}

/// [`TileWriter`] that pastes every tile into one full-frame image.
#[derive(Debug, Default)]
pub struct FrameCollector {
    frame: Mutex<Frame>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, params: &BufferParams) {
        let mut frame = self.frame.lock();
        frame.params = params.clone();
        frame.pixels = vec![0.0; params.num_pixels() * 4];
        frame.written = 0;
    }

    /// `(width, height)` of the frame.
    pub fn size(&self) -> (i32, i32) {
        let frame = self.frame.lock();
        (frame.params.width, frame.params.height)
    }

    /// Tiles stored since the last reset.
    pub fn tiles_written(&self) -> usize {
        self.frame.lock().written
    }

    /// Copy of the normalised RGBA pixels.
    pub fn pixels(&self) -> Vec<f32> {
        self.frame.lock().pixels.clone()
    }

    /// RGBA of pixel `(x, y)` in frame coordinates.
    pub fn pixel(&self, x: i32, y: i32) -> Option<[f32; 4]> {
        let frame = self.frame.lock();
        if x < 0 || y < 0 || x >= frame.params.width || y >= frame.params.height {
            return None;
        }
        let i = (y * frame.params.width + x) as usize * 4;
        frame.pixels.get(i..i + 4).map(|p| [p[0], p[1], p[2], p[3]])
    }

    fn store(&self, tile: &RenderTile, buffers: &RenderBuffers) {
        let src = &buffers.params;
        let pass = if src.denoising_data_pass { PassType::Denoised } else { PassType::Combined };
        let mut rect = vec![0.0f32; src.num_pixels() * 4];
        if !buffers.get_pass_rect(pass, 1.0, tile.sample, 4, &mut rect) {
            tracing::warn!(?pass, "tile buffers lack the output pass");
            return;
        }

        let mut frame = self.frame.lock();
        let (fw, fh) = (frame.params.width, frame.params.height);
        let (dx, dy) = (src.full_x - frame.params.full_x, src.full_y - frame.params.full_y);
        for y in 0..src.height {
            let fy = dy + y;
            if fy < 0 || fy >= fh {
                continue;
            }
            for x in 0..src.width {
                let fx = dx + x;
                if fx < 0 || fx >= fw {
                    continue;
                }
                let s = (y * src.width + x) as usize * 4;
                let d = (fy * fw + fx) as usize * 4;
                frame.pixels[d..d + 4].copy_from_slice(&rect[s..s + 4]);
            }
        }
        frame.written += 1;
    }

    /// Display-referred RGBA8 pixels of the whole frame.
    pub fn to_rgba8(&self, film: &FilmParams) -> Vec<u8> {
        let frame = self.frame.lock();
        frame
            .pixels
            .chunks_exact(4)
            .flat_map(|p| film_map_byte(Vec4::from_slice(p), 1.0, film))
            .collect()
    }

    #[cfg(feature = "output")]
    pub fn write(&self, path: &std::path::Path, film: &FilmParams) -> crate::util::Result<()> {
        let (w, h) = self.size();
        if w <= 0 || h <= 0 {
            return Err(crate::util::Error::other("no frame to write"));
        }
        let image = image::RgbaImage::from_raw(w as u32, h as u32, self.to_rgba8(film))
            .ok_or_else(|| crate::util::Error::other("frame pixel count mismatch"))?;
        image.save(path)?;
        tracing::info!("Wrote {}x{} image to {}", w, h, path.display());
        Ok(())
    }
}

impl TileWriter for FrameCollector {
    fn write_render_tile(&self, tile: &RenderTile, buffers: &RenderBuffers) {
        self.store(tile, buffers);
    }

    fn update_render_tile(&self, tile: &RenderTile, buffers: &RenderBuffers) {
        self.store(tile, buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;

    #[test]
    fn test_tiles_land_at_their_position() {
        let collector = FrameCollector::new();
        collector.reset(&BufferParams::new(4, 4));

        let mut params = BufferParams::new(2, 2);
        params.full_x = 2;
        params.full_y = 1;
        params.full_width = 4;
        params.full_height = 4;
        let mut buffers = RenderBuffers::with_params(CpuDevice::with_threads(1), &params);
        for px in buffers.buffer.host_mut::<f32>().chunks_exact_mut(4) {
            px.copy_from_slice(&[2.0, 4.0, 6.0, 2.0]);
        }
        let tile = RenderTile { x: 2, y: 1, w: 2, h: 2, sample: 2, ..Default::default() };
        collector.write_render_tile(&tile, &buffers);

        assert_eq!(collector.tiles_written(), 1);
        assert_eq!(collector.pixel(2, 1), Some([1.0, 2.0, 3.0, 1.0]));
        assert_eq!(collector.pixel(3, 2), Some([1.0, 2.0, 3.0, 1.0]));
        assert_eq!(collector.pixel(1, 1), Some([0.0; 4]));
        assert_eq!(collector.pixel(4, 0), None);
    }
}
