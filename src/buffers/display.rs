//! Display surface: film-converted pixels ready to draw or save.

use std::sync::Arc;

use half::f16;

use crate::device::{DataType, Device, DeviceMemory, DrawRegion, DrawTarget, MemoryType};
use super::params::BufferParams;

/// RGBA display pixels kept on the device, byte or half float.
pub struct DisplayBuffer {
    pub params: BufferParams,
    pub rgba_byte: DeviceMemory,
    pub rgba_half: DeviceMemory,
    /// Region of the buffer that holds valid pixels for the current draw.
    pub draw_width: i32,
    pub draw_height: i32,
    pub transparent: bool,
    pub half_float: bool,
    device: Arc<dyn Device>,
}

impl DisplayBuffer {
    pub fn new(device: Arc<dyn Device>, half_float: bool) -> Self {
        Self {
            params: BufferParams::default(),
            rgba_byte: DeviceMemory::new("display_rgba_byte", MemoryType::Pixels, DataType::Uchar, 4),
            rgba_half: DeviceMemory::new("display_rgba_half", MemoryType::Pixels, DataType::Half, 4),
            draw_width: 0,
            draw_height: 0,
            transparent: true,
            half_float,
            device,
        }
    }

    /// Reallocate for `params`. Nothing is drawable until the next
    /// [`draw_set`](Self::draw_set).
    pub fn reset(&mut self, params: &BufferParams) {
        self.draw_width = 0;
        self.draw_height = 0;
        self.params = params.clone();
        self.device_free();

        let (w, h) = (params.width.max(0) as usize, params.height.max(0) as usize);
        let device = self.device.clone();
        let rgba = self.rgba_mut();
        rgba.resize(w, h);
        device.mem_alloc(rgba);
        device.mem_zero(rgba);
    }

    /// Mark the top-left `width` x `height` pixels as drawable.
    pub fn draw_set(&mut self, width: i32, height: i32) {
        debug_assert!(width <= self.params.width && height <= self.params.height);
        self.draw_width = width;
        self.draw_height = height;
    }

    pub fn draw_ready(&self) -> bool {
        self.draw_width != 0 && self.draw_height != 0
    }

    /// The active pixel block.
    pub fn rgba(&self) -> &DeviceMemory {
        if self.half_float { &self.rgba_half } else { &self.rgba_byte }
    }

    pub fn rgba_mut(&mut self) -> &mut DeviceMemory {
        if self.half_float { &mut self.rgba_half } else { &mut self.rgba_byte }
    }

    /// Draw the drawable region, stretched to the full params size.
    pub fn draw(&mut self, target: &mut dyn DrawTarget) {
        if !self.draw_ready() {
            return;
        }
        // Rows are sent with the buffer's full row stride.
        let stride = self.params.width;
        let region = DrawRegion {
            width: stride,
            height: self.draw_height,
            dx: self.params.full_x,
            dy: self.params.full_y,
            dw: self.params.width,
            dh: self.params.height,
            transparent: self.transparent,
        };
        let device = self.device.clone();
        let h = self.draw_height;
        let rgba = self.rgba_mut();
        device.draw_pixels(rgba, 0, stride, h, &region, target);
    }

    /// Copy the drawable region back and return it as tightly packed RGBA8.
    pub fn read_pixels(&mut self) -> Vec<u8> {
        let (w, h) = (self.draw_width.max(0) as usize, self.draw_height.max(0) as usize);
        let stride = self.params.width.max(0) as usize;
        let device = self.device.clone();
        let rgba = self.rgba_mut();
        let item = rgba.item_size();
        device.mem_copy_from(rgba, 0, stride, h, item);

        let mut out = Vec::with_capacity(w * h * 4);
        if self.half_float {
            let src = self.rgba_half.host::<f16>();
            for y in 0..h {
                for v in &src[y * stride * 4..(y * stride + w) * 4] {
                    out.push((v.to_f32().clamp(0.0, 1.0) * 255.0 + 0.5) as u8);
                }
            }
        } else {
            let src = self.rgba_byte.host::<u8>();
            for y in 0..h {
                out.extend_from_slice(&src[y * stride * 4..(y * stride + w) * 4]);
            }
        }
        out
    }

    /// Save the drawable region as an image file.
    #[cfg(feature = "output")]
    pub fn write(&mut self, path: &std::path::Path) -> crate::util::Result<()> {
        if !self.draw_ready() {
            return Err(crate::util::Error::other("display buffer has nothing to write"));
        }
        let (w, h) = (self.draw_width as u32, self.draw_height as u32);
        let pixels = self.read_pixels();
        let image = image::RgbaImage::from_raw(w, h, pixels)
            .ok_or_else(|| crate::util::Error::other("display pixel count mismatch"))?;
        image.save(path)?;
        tracing::info!("Wrote {}x{} image to {}", w, h, path.display());
        Ok(())
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    fn device_free(&mut self) {
        self.device.mem_free(&mut self.rgba_byte);
        self.device.mem_free(&mut self.rgba_half);
    }
}

impl Drop for DisplayBuffer {
    fn drop(&mut self) {
        self.device_free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CpuDevice, DrawPixels};

    #[derive(Default)]
    struct Recorder {
        bound: usize,
        bytes: usize,
        region: DrawRegion,
    }

    impl DrawTarget for Recorder {
        fn bind(&mut self) {
            self.bound += 1;
        }
        fn draw(&mut self, pixels: DrawPixels<'_>, region: &DrawRegion) {
            if let DrawPixels::Byte(p) = pixels {
                self.bytes = p.len();
            }
            self.region = *region;
        }
    }

    #[test]
    fn test_not_ready_until_set() {
        let mut display = DisplayBuffer::new(CpuDevice::with_threads(1), false);
        display.reset(&BufferParams::new(4, 2));
        assert!(!display.draw_ready());
        let mut target = Recorder::default();
        display.draw(&mut target);
        assert_eq!(target.bound, 0);

        display.draw_set(2, 1);
        display.draw(&mut target);
        assert_eq!(target.bound, 1);
        assert_eq!(target.bytes, 4 * 4);
        assert_eq!(target.region.dw, 4);
    }

    #[test]
    fn test_read_pixels_packs_rows() {
        let device = CpuDevice::with_threads(1);
        let mut display = DisplayBuffer::new(device.clone(), false);
        display.reset(&BufferParams::new(3, 2));
        for (i, b) in display.rgba_byte.host_mut::<u8>().iter_mut().enumerate() {
            *b = i as u8;
        }
        device.mem_copy_to(&mut display.rgba_byte);
        display.draw_set(2, 2);
        let px = display.read_pixels();
        assert_eq!(px.len(), 16);
        assert_eq!(&px[8..12], &[12, 13, 14, 15]);
    }

    #[cfg(feature = "output")]
    #[test]
    fn test_write_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let mut display = DisplayBuffer::new(CpuDevice::with_threads(1), false);
        display.reset(&BufferParams::new(4, 4));
        assert!(display.write(&path).is_err());
        display.draw_set(4, 4);
        display.write(&path).unwrap();
        assert!(path.exists());
    }
}
