//! WGSL for the draw passes.
//!
//! Coordinates follow `shading.rs`: texels are fetched with `textureLoad`
//! and filtered by hand, so both backends clamp and round identically.

use crate::context::{Axis, DrawPass, PassKind};
use bytemuck::{Pod, Zeroable};

/// Uniform block shared by every fragment entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PassParams {
    pub src_rect: [f32; 4],
    pub src_size: [f32; 2],
    pub dst_size: [f32; 2],
    pub weights: [f32; 4],
    /// (1, 0) horizontal, (0, 1) vertical.
    pub axis: [f32; 2],
    pub flip: f32,
    pub swizzle: f32,
}

impl PassParams {
    pub fn new(pass: &DrawPass, src_size: [u32; 2], dst_size: [u32; 2]) -> Self {
        let weights = match pass.kind {
            PassKind::Planar { weights } => weights,
            _ => [0.0; 4],
        };
        let axis = match pass.kind {
            PassKind::Bicubic(Axis::Horizontal) => [1.0, 0.0],
            PassKind::Bicubic(Axis::Vertical) => [0.0, 1.0],
            _ => [0.0, 0.0],
        };
        Self {
            src_rect: pass.src_rect,
            src_size: [src_size[0] as f32, src_size[1] as f32],
            dst_size: [dst_size[0] as f32, dst_size[1] as f32],
            weights,
            axis,
            flip: if pass.flip_vertically { 1.0 } else { 0.0 },
            swizzle: if pass.swizzle { 1.0 } else { 0.0 },
        }
    }
}

/// Fragment entry point for a pass kind.
pub fn entry_point(kind: &PassKind) -> &'static str {
    match kind {
        PassKind::Bilinear => "fs_bilinear",
        PassKind::Bicubic(_) => "fs_bicubic",
        PassKind::Bicubic2d => "fs_bicubic_2d",
        PassKind::Planar { .. } => "fs_planar",
        PassKind::YuvMrtPass1 => "fs_mrt_pass1",
        PassKind::YuvMrtPass2 => "fs_mrt_pass2",
    }
}

pub const READBACK_SHADER: &str = r#"
struct Params {
    src_rect: vec4<f32>,
    src_size: vec2<f32>,
    dst_size: vec2<f32>,
    weights: vec4<f32>,
    axis: vec2<f32>,
    flip: f32,
    swizzle: f32,
};

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var<uniform> params: Params;

const RGB_TO_Y = vec4<f32>(0.257, 0.504, 0.098, 0.0625);
const RGB_TO_U = vec4<f32>(-0.148, -0.291, 0.439, 0.5);
const RGB_TO_V = vec4<f32>(0.439, -0.368, -0.071, 0.5);

// Fullscreen triangle.
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    return vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
}

fn fetch(x: i32, y: i32) -> vec4<f32> {
    let size = vec2<i32>(textureDimensions(src));
    return textureLoad(src, clamp(vec2<i32>(x, y), vec2<i32>(0), size - 1), 0);
}

fn bilinear(uv: vec2<f32>) -> vec4<f32> {
    let t = uv - 0.5;
    let base = floor(t);
    let f = t - base;
    let x0 = i32(base.x);
    let y0 = i32(base.y);
    let top = mix(fetch(x0, y0), fetch(x0 + 1, y0), f.x);
    let bottom = mix(fetch(x0, y0 + 1), fetch(x0 + 1, y0 + 1), f.x);
    return mix(top, bottom, f.y);
}

fn catmull_rom(v: f32) -> f32 {
    let x = abs(v);
    if (x < 1.0) {
        return 1.5 * x * x * x - 2.5 * x * x + 1.0;
    }
    if (x < 2.0) {
        return -0.5 * x * x * x + 2.5 * x * x - 4.0 * x + 2.0;
    }
    return 0.0;
}

fn reduce(w: vec4<f32>, c: vec4<f32>) -> f32 {
    return dot(w.xyz, c.xyz) + w.w;
}

fn source_row(frag_y: f32) -> f32 {
    var row = floor(frag_y);
    if (params.flip > 0.5) {
        row = params.dst_size.y - 1.0 - row;
    }
    return params.src_rect.y + (row + 0.5) * params.src_rect.w / params.dst_size.y;
}

fn sample_x(frag_x: f32, k: f32, per_texel: f32) -> f32 {
    let spacing = params.src_rect.z / (params.dst_size.x * per_texel);
    return params.src_rect.x + (floor(frag_x) * per_texel + k + 0.5) * spacing;
}

fn finish(color: vec4<f32>) -> vec4<f32> {
    if (params.swizzle > 0.5) {
        return color.bgra;
    }
    return color;
}

@fragment
fn fs_bilinear(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    return finish(bilinear(vec2<f32>(sample_x(pos.x, 0.0, 1.0), source_row(pos.y))));
}

@fragment
fn fs_bicubic(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let uv = vec2<f32>(sample_x(pos.x, 0.0, 1.0), source_row(pos.y));
    let horizontal = params.axis.x > 0.5;
    var center = uv.y;
    var scale = params.src_rect.w / params.dst_size.y;
    if (horizontal) {
        center = uv.x;
        scale = params.src_rect.z / params.dst_size.x;
    }
    let width = max(scale, 1.0);
    let lo = i32(floor(center - 0.5 - 2.0 * width));
    let hi = i32(ceil(center - 0.5 + 2.0 * width));

    var sum = vec4<f32>(0.0);
    var total = 0.0;
    for (var i = lo; i <= hi; i++) {
        let tap = f32(i) + 0.5;
        let w = catmull_rom((tap - center) / width);
        var p = vec2<f32>(uv.x, tap);
        if (horizontal) {
            p = vec2<f32>(tap, uv.y);
        }
        sum += bilinear(p) * w;
        total += w;
    }
    if (total != 0.0) {
        sum = sum / total;
    }
    return finish(sum);
}

@fragment
fn fs_bicubic_2d(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let uv = vec2<f32>(sample_x(pos.x, 0.0, 1.0), source_row(pos.y));
    let base = vec2<i32>(floor(uv - 0.5));
    var sum = vec4<f32>(0.0);
    var total = 0.0;
    for (var j = -1; j <= 2; j++) {
        let wy = catmull_rom(f32(base.y + j) + 0.5 - uv.y);
        for (var i = -1; i <= 2; i++) {
            let w = catmull_rom(f32(base.x + i) + 0.5 - uv.x) * wy;
            sum += fetch(base.x + i, base.y + j) * w;
            total += w;
        }
    }
    if (total != 0.0) {
        sum = sum / total;
    }
    return finish(sum);
}

@fragment
fn fs_planar(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let v = source_row(pos.y);
    let w = params.weights;
    return finish(vec4<f32>(
        reduce(w, bilinear(vec2<f32>(sample_x(pos.x, 0.0, 4.0), v))),
        reduce(w, bilinear(vec2<f32>(sample_x(pos.x, 1.0, 4.0), v))),
        reduce(w, bilinear(vec2<f32>(sample_x(pos.x, 2.0, 4.0), v))),
        reduce(w, bilinear(vec2<f32>(sample_x(pos.x, 3.0, 4.0), v))),
    ));
}

struct MrtOutput {
    @location(0) primary: vec4<f32>,
    @location(1) secondary: vec4<f32>,
};

@fragment
fn fs_mrt_pass1(@builtin(position) pos: vec4<f32>) -> MrtOutput {
    let v = source_row(pos.y);
    let c0 = bilinear(vec2<f32>(sample_x(pos.x, 0.0, 4.0), v));
    let c1 = bilinear(vec2<f32>(sample_x(pos.x, 1.0, 4.0), v));
    let c2 = bilinear(vec2<f32>(sample_x(pos.x, 2.0, 4.0), v));
    let c3 = bilinear(vec2<f32>(sample_x(pos.x, 3.0, 4.0), v));
    let left = (c0 + c1) * 0.5;
    let right = (c2 + c3) * 0.5;

    var outputs: MrtOutput;
    outputs.primary = vec4<f32>(
        reduce(RGB_TO_Y, c0),
        reduce(RGB_TO_Y, c1),
        reduce(RGB_TO_Y, c2),
        reduce(RGB_TO_Y, c3),
    );
    outputs.secondary = vec4<f32>(
        reduce(RGB_TO_U, left),
        reduce(RGB_TO_V, left),
        reduce(RGB_TO_U, right),
        reduce(RGB_TO_V, right),
    );
    return outputs;
}

@fragment
fn fs_mrt_pass2(@builtin(position) pos: vec4<f32>) -> MrtOutput {
    let v = source_row(pos.y);
    let t0 = bilinear(vec2<f32>(sample_x(pos.x, 0.0, 2.0), v));
    let t1 = bilinear(vec2<f32>(sample_x(pos.x, 1.0, 2.0), v));

    var outputs: MrtOutput;
    outputs.primary = vec4<f32>(t0.x, t0.z, t1.x, t1.z);
    outputs.secondary = vec4<f32>(t0.y, t0.w, t1.y, t1.w);
    return outputs;
}
"#;
