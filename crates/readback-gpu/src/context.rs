//! GPU command stream abstraction.
//!
//! A `GpuContext` is one in-order command stream with GL-like object
//! handles and bind points. Commands are issued synchronously and are cheap;
//! only `read_pixels` and `poll(true)` block the calling thread.

use readback_core::{Mailbox, PixelFormat, ReadbackCallback, Rect, Result, Size, SyncPoint};
use std::sync::Arc;

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u32);

        impl $name {
            /// The "none" handle.
            pub const NONE: Self = Self(0);

            #[inline]
            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }
    };
}

gpu_handle!(
    /// Handle to a 2D RGBA8 texture. Zero denotes none/invalid.
    TextureId
);
gpu_handle!(
    /// Handle to a framebuffer (a set of colour attachments).
    FramebufferId
);
gpu_handle!(
    /// Handle to a pixel-pack buffer used for asynchronous readback.
    BufferId
);

/// What the context can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_texture_size: u32,
    /// Colour attachments one draw can write; 1 means no MRT support.
    pub max_draw_buffers: u32,
    pub rgb565_readback: bool,
    pub bgra_readback: bool,
}

/// Filter axis for separable passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// The shader a draw runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassKind {
    /// One bilinear tap per output pixel.
    Bilinear,
    /// Catmull-Rom along one axis, kernel widened by the downscale factor.
    Bicubic(Axis),
    /// 4x4 Catmull-Rom in both axes at once. Upscales only.
    Bicubic2d,
    /// Four horizontally adjacent samples per RGBA output texel, each
    /// reduced to one channel by `dot(weights.rgb, color) + weights.a`.
    Planar { weights: [f32; 4] },
    /// Target 0: packed Y. Target 1: packed (U, V) of horizontal pixel pairs.
    YuvMrtPass1,
    /// From pass 1's UV texture. Target 0: packed U. Target 1: packed V.
    YuvMrtPass2,
}

impl PassKind {
    /// Number of colour attachments the pass writes.
    pub fn output_count(&self) -> usize {
        match self {
            Self::YuvMrtPass1 | Self::YuvMrtPass2 => 2,
            _ => 1,
        }
    }

    /// Source samples taken along x per output texel.
    pub fn samples_per_texel(&self) -> u32 {
        match self {
            Self::Planar { .. } | Self::YuvMrtPass1 => 4,
            Self::YuvMrtPass2 => 2,
            _ => 1,
        }
    }
}

/// One draw: sample the bound texture over `src_rect` and fill every
/// attachment of the bound framebuffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawPass {
    pub kind: PassKind,
    /// Source region in texels of the bound texture (x, y, width, height).
    pub src_rect: [f32; 4],
    pub flip_vertically: bool,
    /// Swap R and B in the output.
    pub swizzle: bool,
}

/// One in-order GPU command stream.
pub trait GpuContext: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    // ── Objects ────────────────────────────────

    fn gen_texture(&self) -> Result<TextureId>;
    fn delete_texture(&self, texture: TextureId);
    /// (Re)allocate storage, optionally initialised with tightly packed RGBA8
    /// rows. Fails with `OutOfMemory` when the backend cannot allocate.
    fn tex_image_2d(&self, texture: TextureId, size: Size, pixels: Option<&[u8]>) -> Result<()>;
    fn tex_sub_image_2d(&self, texture: TextureId, rect: Rect, pixels: &[u8]) -> Result<()>;
    fn texture_size(&self, texture: TextureId) -> Option<Size>;

    fn gen_framebuffer(&self) -> Result<FramebufferId>;
    fn delete_framebuffer(&self, framebuffer: FramebufferId);
    fn framebuffer_texture(
        &self,
        framebuffer: FramebufferId,
        attachment: usize,
        texture: TextureId,
    ) -> Result<()>;

    fn gen_buffer(&self) -> Result<BufferId>;
    fn delete_buffer(&self, buffer: BufferId);

    // ── Bind points (NONE unbinds) ─────────────

    fn bind_texture(&self, texture: TextureId);
    fn bind_framebuffer(&self, framebuffer: FramebufferId);
    fn bind_pack_buffer(&self, buffer: BufferId);

    // ── Rendering and transfer ─────────────────

    fn draw(&self, pass: &DrawPass) -> Result<()>;
    /// Blocking read of attachment 0 of the bound framebuffer.
    fn read_pixels(&self, rect: Rect, format: PixelFormat, out: &mut [u8]) -> Result<()>;
    /// Non-blocking read of attachment 0 into the bound pack buffer.
    fn read_pixels_to_pack_buffer(&self, rect: Rect, format: PixelFormat) -> Result<()>;
    /// Tightly packed contents of a pack buffer whose read has completed.
    fn map_pack_buffer(&self, buffer: BufferId) -> Result<Vec<u8>>;
    /// Copy from attachment 0 of the bound framebuffer into the bound texture.
    fn copy_tex_sub_image_2d(&self, dst_x: u32, dst_y: u32, src_rect: Rect) -> Result<()>;

    // ── Ordering ───────────────────────────────

    fn flush(&self);
    /// Run `done` once every previously issued command has completed.
    /// Runs with `false` if the context is lost first.
    fn signal_completion(&self, done: ReadbackCallback);
    /// Dispatch ready completions in issue order. Returns how many ran.
    fn poll(&self, wait: bool) -> usize;
    fn insert_sync_point(&self) -> SyncPoint;
    /// Stall this stream (not the CPU) until `point` has been reached.
    fn wait_sync_point(&self, point: SyncPoint);

    // ── Cross-context sharing ──────────────────

    fn gen_mailbox(&self) -> Mailbox;
    fn produce_texture(&self, texture: TextureId, mailbox: &Mailbox) -> Result<()>;
    fn consume_texture(&self, texture: TextureId, mailbox: &Mailbox) -> Result<()>;

    fn is_context_lost(&self) -> bool;
}

/// Reference-counted context handle shared by helpers, scalers and requests.
pub type SharedContext = Arc<dyn GpuContext>;
