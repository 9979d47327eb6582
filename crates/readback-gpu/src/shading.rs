//! CPU evaluation of the draw shaders.
//!
//! Mirrors `shaders.wgsl` texel for texel: texture coordinates are in texels,
//! sampling clamps to the edge, and output row `y` reads source row
//! `dst_h - 1 - y` when flipping.

use crate::context::{Axis, DrawPass, PassKind};
use glam::{Vec4, Vec4Swizzles};
use rayon::prelude::*;
use readback_core::Size;

/// BT.601 studio-swing RGB to Y weights (`dot(rgb, w.xyz) + w.w`).
pub const RGB_TO_Y: [f32; 4] = [0.257, 0.504, 0.098, 0.0625];
/// RGB to U (Cb).
pub const RGB_TO_U: [f32; 4] = [-0.148, -0.291, 0.439, 0.5];
/// RGB to V (Cr).
pub const RGB_TO_V: [f32; 4] = [0.439, -0.368, -0.071, 0.5];

/// Catmull-Rom cubic (a = -0.5).
#[inline]
pub fn catmull_rom(x: f32) -> f32 {
    let x = x.abs();
    if x < 1.0 {
        1.5 * x * x * x - 2.5 * x * x + 1.0
    } else if x < 2.0 {
        -0.5 * x * x * x + 2.5 * x * x - 4.0 * x + 2.0
    } else {
        0.0
    }
}

#[inline]
fn reduce(weights: Vec4, color: Vec4) -> f32 {
    weights.xyz().dot(color.xyz()) + weights.w
}

#[inline]
pub fn quantize(color: Vec4) -> [u8; 4] {
    let c = (color.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round();
    [c.x as u8, c.y as u8, c.z as u8, c.w as u8]
}

/// Read-only RGBA8 texels.
pub struct TexelView<'a> {
    data: &'a [u8],
    size: Size,
}

impl<'a> TexelView<'a> {
    pub fn new(data: &'a [u8], size: Size) -> Self {
        Self { data, size }
    }

    fn fetch(&self, x: i64, y: i64) -> Vec4 {
        let x = x.clamp(0, self.size.width as i64 - 1) as usize;
        let y = y.clamp(0, self.size.height as i64 - 1) as usize;
        let i = (y * self.size.width as usize + x) * 4;
        let px = &self.data[i..i + 4];
        Vec4::new(px[0] as f32, px[1] as f32, px[2] as f32, px[3] as f32) / 255.0
    }

    /// Bilinear sample at texel coordinates `(u, v)`.
    pub fn bilinear(&self, u: f32, v: f32) -> Vec4 {
        if self.size.is_empty() {
            return Vec4::ZERO;
        }
        let (tx, ty) = (u - 0.5, v - 0.5);
        let (x0, y0) = (tx.floor(), ty.floor());
        let (fx, fy) = (tx - x0, ty - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);

        let top = self.fetch(x0, y0).lerp(self.fetch(x0 + 1, y0), fx);
        let bottom = self.fetch(x0, y0 + 1).lerp(self.fetch(x0 + 1, y0 + 1), fx);
        top.lerp(bottom, fy)
    }

    /// Catmull-Rom along `axis`, with the kernel widened by `scale` when
    /// downscaling so every source texel contributes.
    pub fn bicubic(&self, u: f32, v: f32, axis: Axis, scale: f32) -> Vec4 {
        if self.size.is_empty() {
            return Vec4::ZERO;
        }
        let width = scale.max(1.0);
        let center = match axis {
            Axis::Horizontal => u,
            Axis::Vertical => v,
        };
        let first = (center - 0.5 - 2.0 * width).floor() as i64;
        let last = (center - 0.5 + 2.0 * width).ceil() as i64;

        let mut sum = Vec4::ZERO;
        let mut total = 0.0;
        for i in first..=last {
            let tap = i as f32 + 0.5;
            let w = catmull_rom((tap - center) / width);
            if w == 0.0 {
                continue;
            }
            let color = match axis {
                Axis::Horizontal => self.bilinear(tap, v),
                Axis::Vertical => self.bilinear(u, tap),
            };
            sum += color * w;
            total += w;
        }
        if total == 0.0 {
            sum
        } else {
            sum / total
        }
    }

    /// Non-separable Catmull-Rom over the 4x4 texels around `(u, v)`.
    pub fn bicubic_2d(&self, u: f32, v: f32) -> Vec4 {
        if self.size.is_empty() {
            return Vec4::ZERO;
        }
        let (bx, by) = ((u - 0.5).floor() as i64, (v - 0.5).floor() as i64);
        let mut sum = Vec4::ZERO;
        let mut total = 0.0;
        for j in -1..=2 {
            let wy = catmull_rom((by + j) as f32 + 0.5 - v);
            for i in -1..=2 {
                let w = catmull_rom((bx + i) as f32 + 0.5 - u) * wy;
                sum += self.fetch(bx + i, by + j) * w;
                total += w;
            }
        }
        if total == 0.0 {
            sum
        } else {
            sum / total
        }
    }
}

/// Evaluate one output texel. The second colour is only meaningful for
/// two-target passes.
pub fn shade_texel(pass: &DrawPass, src: &TexelView<'_>, dst: Size, x: u32, y: u32) -> [Vec4; 2] {
    let [sx, sy, sw, sh] = pass.src_rect;
    let row = if pass.flip_vertically {
        dst.height - 1 - y
    } else {
        y
    };
    let v = sy + (row as f32 + 0.5) * sh / dst.height as f32;
    let spt = pass.kind.samples_per_texel();
    let step = sw / (dst.width * spt) as f32;
    let sample_u = |k: u32| sx + ((x * spt + k) as f32 + 0.5) * step;

    let mut out = match pass.kind {
        PassKind::Bilinear => [src.bilinear(sample_u(0), v), Vec4::ZERO],
        PassKind::Bicubic(axis) => {
            let scale = match axis {
                Axis::Horizontal => sw / dst.width as f32,
                Axis::Vertical => sh / dst.height as f32,
            };
            [src.bicubic(sample_u(0), v, axis, scale), Vec4::ZERO]
        }
        PassKind::Bicubic2d => [src.bicubic_2d(sample_u(0), v), Vec4::ZERO],
        PassKind::Planar { weights } => {
            let w = Vec4::from(weights);
            let packed = Vec4::from(std::array::from_fn::<f32, 4, _>(|k| {
                reduce(w, src.bilinear(sample_u(k as u32), v))
            }));
            [packed, Vec4::ZERO]
        }
        PassKind::YuvMrtPass1 => {
            let c: [Vec4; 4] = std::array::from_fn(|k| src.bilinear(sample_u(k as u32), v));
            let (wy, wu, wv) = (
                Vec4::from(RGB_TO_Y),
                Vec4::from(RGB_TO_U),
                Vec4::from(RGB_TO_V),
            );
            let luma = Vec4::new(
                reduce(wy, c[0]),
                reduce(wy, c[1]),
                reduce(wy, c[2]),
                reduce(wy, c[3]),
            );
            let left = (c[0] + c[1]) * 0.5;
            let right = (c[2] + c[3]) * 0.5;
            let chroma = Vec4::new(
                reduce(wu, left),
                reduce(wv, left),
                reduce(wu, right),
                reduce(wv, right),
            );
            [luma, chroma]
        }
        PassKind::YuvMrtPass2 => {
            let t0 = src.bilinear(sample_u(0), v);
            let t1 = src.bilinear(sample_u(1), v);
            [
                Vec4::new(t0.x, t0.z, t1.x, t1.z),
                Vec4::new(t0.y, t0.w, t1.y, t1.w),
            ]
        }
    };

    if pass.swizzle {
        out[0] = out[0].zyxw();
    }
    out
}

/// Run a pass over a whole destination, returning one RGBA8 image per
/// output target.
pub fn render(pass: &DrawPass, src: &TexelView<'_>, dst: Size) -> Vec<Vec<u8>> {
    let outputs = pass.kind.output_count();
    let row_bytes = dst.width as usize * 4;
    if dst.is_empty() {
        return vec![Vec::new(); outputs];
    }

    let mut primary = vec![0u8; row_bytes * dst.height as usize];
    if outputs == 1 {
        primary
            .par_chunks_mut(row_bytes)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, px) in row.chunks_exact_mut(4).enumerate() {
                    let [c, _] = shade_texel(pass, src, dst, x as u32, y as u32);
                    px.copy_from_slice(&quantize(c));
                }
            });
        return vec![primary];
    }

    let mut secondary = vec![0u8; row_bytes * dst.height as usize];
    primary
        .par_chunks_mut(row_bytes)
        .zip(secondary.par_chunks_mut(row_bytes))
        .enumerate()
        .for_each(|(y, (row0, row1))| {
            for x in 0..dst.width as usize {
                let [c0, c1] = shade_texel(pass, src, dst, x as u32, y as u32);
                row0[x * 4..x * 4 + 4].copy_from_slice(&quantize(c0));
                row1[x * 4..x * 4 + 4].copy_from_slice(&quantize(c1));
            }
        });
    vec![primary, secondary]
}
