//! Frame buffer types for pixels that have been read back into CPU memory.

use crate::geometry::Size;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;

/// Pixel format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit BGRA (32 bits per pixel), the default readback layout
    #[default]
    Bgra8,
    /// 8-bit RGBA (32 bits per pixel), the texture storage layout
    Rgba8,
    /// 5-6-5 packed RGB (16 bits per pixel, little endian)
    Rgb565,
    /// 8-bit single channel
    Gray8,
    /// YUV 4:2:0 planar (YV12 plane sizes)
    Yuv420P,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, or 0 for planar.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra8 | Self::Rgba8 => 4,
            Self::Rgb565 => 2,
            Self::Gray8 => 1,
            Self::Yuv420P => 0, // Planar
        }
    }

    /// Whether pixels of this format can be produced by a texture readback.
    pub fn is_readback_format(self) -> bool {
        matches!(self, Self::Bgra8 | Self::Rgba8 | Self::Rgb565)
    }

    /// Calculate total bytes needed for a tightly packed frame of this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            Self::Yuv420P => {
                // Y + U + V planes (U/V at half resolution)
                w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
            }
            packed => w * h * packed.bytes_per_pixel(),
        }
    }

    /// Convert a row of RGBA8 pixels into this format.
    ///
    /// `dst` must hold `src.len() / 4 * bytes_per_pixel()` bytes.
    pub fn convert_row_from_rgba(self, src: &[u8], dst: &mut [u8]) {
        match self {
            Self::Rgba8 => dst.copy_from_slice(src),
            Self::Bgra8 => {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
                    d.copy_from_slice(&[s[2], s[1], s[0], s[3]]);
                }
            }
            Self::Rgb565 => {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(2)) {
                    d.copy_from_slice(&pack_rgb565(s[0], s[1], s[2]).to_le_bytes());
                }
            }
            Self::Gray8 => {
                for (s, d) in src.chunks_exact(4).zip(dst.iter_mut()) {
                    *d = s[0];
                }
            }
            Self::Yuv420P => {}
        }
    }
}

/// Pack an 8-bit RGB triple into 5-6-5 bits.
#[inline]
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// A plane of pixel data with stride information.
#[derive(Debug, Clone)]
pub struct FramePlane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Bytes per row (may include padding)
    pub stride: usize,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per pixel
    pub bytes_per_pixel: usize,
}

impl FramePlane {
    /// Create a new frame plane with the given dimensions.
    pub fn new(width: u32, height: u32, bytes_per_pixel: usize) -> Self {
        // Align stride to 64 bytes for SIMD and GPU compatibility
        let min_stride = (width as usize) * bytes_per_pixel;
        let stride = (min_stride + 63) & !63;
        let data = vec![0u8; stride * height as usize];
        Self {
            data,
            stride,
            width,
            height,
            bytes_per_pixel,
        }
    }

    /// Get a row of pixel data.
    #[inline]
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        let end = start + self.width as usize * self.bytes_per_pixel;
        &self.data[start..end]
    }

    /// Get a mutable row of pixel data.
    #[inline]
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let end = start + self.width as usize * self.bytes_per_pixel;
        &mut self.data[start..end]
    }

    /// Mutable row `y`, or `None` when it lies outside the plane.
    pub fn get_row_mut(&mut self, y: u32) -> Option<&mut [u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        let end = start + self.width as usize * self.bytes_per_pixel;
        self.data.get_mut(start..end)
    }

    /// Fill every pixel with the same value.
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }
}

/// A frame in CPU memory.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    /// Pixel format
    pub format: PixelFormat,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel data planes (1 or 3 depending on format)
    pub planes: SmallVec<[FramePlane; 3]>,
}

impl FrameBuffer {
    /// Create a new frame buffer with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let planes = match format {
            PixelFormat::Yuv420P => {
                let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
                smallvec::smallvec![
                    FramePlane::new(width, height, 1), // Y
                    FramePlane::new(cw, ch, 1),        // U
                    FramePlane::new(cw, ch, 1),        // V
                ]
            }
            packed => smallvec::smallvec![FramePlane::new(width, height, packed.bytes_per_pixel())],
        };

        Self {
            format,
            width,
            height,
            planes,
        }
    }

    #[inline]
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Total memory usage of this frame in bytes.
    pub fn memory_size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }

    /// Get the primary plane (plane 0).
    #[inline]
    pub fn primary_plane(&self) -> &FramePlane {
        &self.planes[0]
    }

    /// Get the primary plane mutably.
    #[inline]
    pub fn primary_plane_mut(&mut self) -> &mut FramePlane {
        &mut self.planes[0]
    }

    /// Pixel rows packed without stride padding, as uploaded to a texture.
    pub fn to_packed(&self) -> Vec<u8> {
        let plane = self.primary_plane();
        (0..plane.height).flat_map(|y| plane.row(y).iter().copied()).collect()
    }

    /// RGBA frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut frame = Self::new(width, height, PixelFormat::Rgba8);
        let plane = frame.primary_plane_mut();
        for y in 0..height {
            for px in plane.row_mut(y).chunks_exact_mut(4) {
                px.copy_from_slice(&rgba);
            }
        }
        frame
    }

    /// RGBA checkerboard with square cells of `cell` pixels.
    pub fn checkerboard(width: u32, height: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = cell.max(1);
        let mut frame = Self::new(width, height, PixelFormat::Rgba8);
        let plane = frame.primary_plane_mut();
        for y in 0..height {
            let row = plane.row_mut(y);
            for x in 0..width {
                let i = (x * 4) as usize;
                let color = if (x / cell + y / cell) % 2 == 0 { a } else { b };
                row[i..i + 4].copy_from_slice(&color);
            }
        }
        frame
    }

    /// Create a test pattern frame (color bars).
    pub fn test_pattern(width: u32, height: u32) -> Self {
        let colors: [[u8; 4]; 8] = [
            [255, 255, 255, 255], // White
            [255, 255, 0, 255],   // Yellow
            [0, 255, 255, 255],   // Cyan
            [0, 255, 0, 255],     // Green
            [255, 0, 255, 255],   // Magenta
            [255, 0, 0, 255],     // Red
            [0, 0, 255, 255],     // Blue
            [0, 0, 0, 255],       // Black
        ];
        let mut frame = Self::new(width, height, PixelFormat::Rgba8);
        let plane = frame.primary_plane_mut();

        for y in 0..height {
            let row = plane.row_mut(y);
            for x in 0..width {
                let i = (x * 4) as usize;
                let bar = (x * 8 / width.max(1)) as usize;
                row[i..i + 4].copy_from_slice(&colors[bar.min(7)]);
            }
        }

        frame
    }
}

/// Caller-owned destination for packed readback pixels.
pub type SharedPixels = Arc<Mutex<Vec<u8>>>;

/// Caller-owned planar frame filled by YUV readbacks.
pub type SharedFrame = Arc<Mutex<FrameBuffer>>;
