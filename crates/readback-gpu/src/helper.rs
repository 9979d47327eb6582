//! Readback helper: the public face of the pipeline.
//!
//! Wraps one `GpuContext` and offers crop/scale/readback, texture copies,
//! mailbox hand-off and scaler/YUV pipeline construction. Every object the
//! helper creates internally is released before the call returns or, for
//! asynchronous readbacks, once the request completes. Failures are reported
//! through the callback (`false`) or a sentinel return value, never a panic.
//! Callbacks only ever run from `GpuContext::poll` or teardown, including
//! those of requests rejected up front.

use crate::context::{GpuContext, SharedContext, TextureId};
use crate::readback::{copy_pack_buffer, issue_pack_read, ReadbackQueue};
use crate::scaler::{self, Scaler};
use crate::scoped::{
    ScopedFlush, ScopedFramebuffer, ScopedFramebufferBinder, ScopedTexture, ScopedTextureBinder,
};
use crate::yuv::{ReadbackYuv, YuvReadbackPipeline};
use readback_core::{
    Mailbox, PixelFormat, ReadbackCallback, ReadbackConfig, ReadbackError, Rect, Region, Result,
    ScalerQuality, SharedPixels, Size, SyncPoint,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Texture readback and scaling on top of one GPU context.
pub struct ReadbackHelper {
    gl: SharedContext,
    config: ReadbackConfig,
    readbacks: ReadbackQueue,
    rgb565_support: OnceLock<bool>,
}

impl ReadbackHelper {
    pub fn new(gl: SharedContext) -> Self {
        Self::with_config(gl, ReadbackConfig::default())
    }

    pub fn with_config(gl: SharedContext, config: ReadbackConfig) -> Self {
        let caps = gl.capabilities();
        info!(
            max_texture_size = caps.max_texture_size,
            draw_buffers = caps.max_draw_buffers,
            bgra = caps.bgra_readback,
            quality = config.default_quality.name(),
            "Readback helper ready"
        );
        Self {
            readbacks: ReadbackQueue::new(gl.clone()),
            gl,
            config,
            rgb565_support: OnceLock::new(),
        }
    }

    pub fn context(&self) -> &SharedContext {
        &self.gl
    }

    pub fn config(&self) -> &ReadbackConfig {
        &self.config
    }

    /// Readbacks whose callbacks have not run yet.
    pub fn pending_readbacks(&self) -> usize {
        self.readbacks.pending()
    }

    // ── Readback ───────────────────────────────

    /// Crop `src_subrect` out of `src_texture`, scale it to `dst_size`
    /// (flipping vertically), and read it back into `out` as `format`.
    ///
    /// Intermediate textures are deleted once the readback completes. The
    /// callback runs exactly once.
    #[allow(clippy::too_many_arguments)]
    pub fn crop_scale_readback_and_clean_texture(
        &self,
        src_texture: TextureId,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        out: SharedPixels,
        format: PixelFormat,
        callback: impl Into<ReadbackCallback>,
    ) {
        let callback = callback.into();
        let _flush = ScopedFlush::new(self.gl.as_ref());

        let read_format = match self.check_readback(format, dst_size, &out) {
            Ok(read_format) => read_format,
            Err(e) => {
                warn!(?format, error = %e, "Rejected readback");
                self.readbacks.reject(callback);
                return;
            }
        };
        let swizzle = read_format != format;

        let scaled = match self.scale_to_new_texture(
            src_texture,
            src_size,
            src_subrect,
            dst_size,
            true,
            swizzle,
            self.config.default_quality,
        ) {
            Ok(scaled) => scaled,
            Err(e) => {
                warn!(%src_size, %dst_size, error = %e, "Crop and scale failed");
                self.readbacks.reject(callback);
                return;
            }
        };

        let texture = scaled.id();
        self.start_readback(texture, Some(scaled), dst_size, out, read_format, callback);
    }

    /// As [`Self::crop_scale_readback_and_clean_texture`], with the source
    /// consumed from a mailbox. The consumed texture is deleted afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn crop_scale_readback_and_clean_mailbox(
        &self,
        mailbox: &Mailbox,
        sync_point: SyncPoint,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        out: SharedPixels,
        format: PixelFormat,
        callback: impl Into<ReadbackCallback>,
    ) {
        let callback = callback.into();
        let texture = self.consume_mailbox_to_texture(mailbox, sync_point);
        if !texture.is_valid() {
            self.readbacks.reject(callback);
            return;
        }
        let texture = ScopedTexture::adopt(&self.gl, texture);
        self.crop_scale_readback_and_clean_texture(
            texture.id(),
            src_size,
            src_subrect,
            dst_size,
            out,
            format,
            callback,
        );
    }

    /// Blocking read of `src_rect` of `texture` into `out`.
    pub fn readback_texture_sync(
        &self,
        texture: TextureId,
        src_rect: Rect,
        out: &mut [u8],
        format: PixelFormat,
    ) -> Result<()> {
        let read_format = self.native_read_format(format)?;
        let framebuffer = ScopedFramebuffer::new(&self.gl)?;
        self.gl.framebuffer_texture(framebuffer.id(), 0, texture)?;
        let _fb = ScopedFramebufferBinder::new(self.gl.as_ref(), framebuffer.id());
        self.gl.read_pixels(src_rect, read_format, out)?;

        if read_format != format {
            for px in out[..src_rect.area() * 4].chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
        Ok(())
    }

    /// Asynchronous read of the `dst_size` region at the origin of `texture`.
    pub fn readback_texture_async(
        &self,
        texture: TextureId,
        dst_size: Size,
        out: SharedPixels,
        format: PixelFormat,
        callback: impl Into<ReadbackCallback>,
    ) {
        let callback = callback.into();
        let _flush = ScopedFlush::new(self.gl.as_ref());

        let read_format = match self.check_readback(format, dst_size, &out) {
            Ok(read_format) => read_format,
            Err(e) => {
                warn!(?format, error = %e, "Rejected readback");
                self.readbacks.reject(callback);
                return;
            }
        };

        if read_format == format {
            self.start_readback(texture, None, dst_size, out, format, callback);
            return;
        }

        // No native BGRA: swap channels in a copy pass first.
        match self.scale_to_new_texture(
            texture,
            dst_size,
            dst_size.to_rect(),
            dst_size,
            false,
            true,
            ScalerQuality::Fast,
        ) {
            Ok(swizzled) => {
                let id = swizzled.id();
                self.start_readback(id, Some(swizzled), dst_size, out, read_format, callback);
            }
            Err(e) => {
                warn!(error = %e, "Swizzle pass failed");
                self.readbacks.reject(callback);
            }
        }
    }

    /// Decide the format to read from the GPU and validate the destination.
    fn check_readback(&self, format: PixelFormat, dst_size: Size, out: &SharedPixels) -> Result<PixelFormat> {
        let read_format = self.native_read_format(format)?;
        let needed = format.frame_size(dst_size.width, dst_size.height);
        let available = out.lock().len();
        if available < needed {
            return Err(ReadbackError::InvalidParameter(format!(
                "output holds {} bytes, {} {:?} needs {}",
                available, dst_size, format, needed
            )));
        }
        Ok(read_format)
    }

    fn native_read_format(&self, format: PixelFormat) -> Result<PixelFormat> {
        match format {
            PixelFormat::Rgb565 if !self.can_use_rgb565_readback() => {
                warn!("RGB565 readback requested but not supported by this context");
                Err(ReadbackError::UnsupportedFormat("RGB565 readback".into()))
            }
            PixelFormat::Bgra8 if !self.gl.capabilities().bgra_readback => Ok(PixelFormat::Rgba8),
            f if f.is_readback_format() => Ok(f),
            f => Err(ReadbackError::UnsupportedFormat(format!("{:?} readback", f))),
        }
    }

    /// Issue the pack read and queue the request. `owned` is deleted when
    /// the request finishes either way.
    fn start_readback(
        &self,
        texture: TextureId,
        owned: Option<ScopedTexture>,
        size: Size,
        out: SharedPixels,
        read_format: PixelFormat,
        callback: ReadbackCallback,
    ) {
        let buffer = match issue_pack_read(&self.gl, texture, size.to_rect(), read_format) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(texture = texture.0, error = %e, "Failed to start readback");
                self.readbacks.reject(callback);
                return;
            }
        };
        let len = read_format.frame_size(size.width, size.height);
        self.readbacks.submit(
            Box::new(move |gl: &dyn GpuContext| {
                let _owned = owned;
                copy_pack_buffer(gl, buffer.id(), &out, len)
            }),
            callback,
        );
        debug!(texture = texture.0, %size, format = ?read_format, "Readback started");
    }

    // ── Copies ─────────────────────────────────

    /// Scale into a new texture owned by the returned guard.
    #[allow(clippy::too_many_arguments)]
    fn scale_to_new_texture(
        &self,
        source: TextureId,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        flip_vertically: bool,
        swizzle: bool,
        quality: ScalerQuality,
    ) -> Result<ScopedTexture> {
        let scaler = scaler::create_scaler(
            &self.gl,
            quality,
            src_size,
            src_subrect,
            dst_size,
            flip_vertically,
            swizzle,
        )?;
        let dest = ScopedTexture::new(&self.gl)?;
        self.gl.tex_image_2d(dest.id(), dst_size, None)?;
        scaler.scale(source, dest.id())?;
        Ok(dest)
    }

    /// Copy `texture` into a new texture of the same size. Returns
    /// `TextureId::NONE` on failure.
    pub fn copy_texture(&self, texture: TextureId, size: Size) -> TextureId {
        self.copy_and_scale_texture(texture, size, size, false, ScalerQuality::Fast)
    }

    /// Scale `texture` into a new texture. Returns `TextureId::NONE` on failure.
    pub fn copy_and_scale_texture(
        &self,
        texture: TextureId,
        src_size: Size,
        dst_size: Size,
        vertically_flip: bool,
        quality: ScalerQuality,
    ) -> TextureId {
        let _flush = ScopedFlush::new(self.gl.as_ref());
        match self.scale_to_new_texture(
            texture,
            src_size,
            src_size.to_rect(),
            dst_size,
            vertically_flip,
            false,
            quality,
        ) {
            Ok(dest) => dest.into_raw(),
            Err(e) => {
                warn!(%src_size, %dst_size, error = %e, "Texture copy failed");
                TextureId::NONE
            }
        }
    }

    /// Copy the parts of `old_damage` not covered by `new_damage` from
    /// `previous_texture` into `texture`.
    pub fn copy_sub_buffer_damage(
        &self,
        texture: TextureId,
        previous_texture: TextureId,
        new_damage: &Region,
        old_damage: &Region,
    ) -> Result<()> {
        let mut region = old_damage.clone();
        region.subtract(new_damage);
        if region.is_empty() {
            return Ok(());
        }

        let framebuffer = ScopedFramebuffer::new(&self.gl)?;
        self.gl.framebuffer_texture(framebuffer.id(), 0, previous_texture)?;
        let _fb = ScopedFramebufferBinder::new(self.gl.as_ref(), framebuffer.id());
        let _tex = ScopedTextureBinder::new(self.gl.as_ref(), texture);
        for rect in region.rects() {
            self.gl.copy_tex_sub_image_2d(rect.x, rect.y, *rect)?;
        }
        debug!(rects = region.rects().len(), area = region.area(), "Copied undamaged region");
        Ok(())
    }

    /// Copy `rect` of the bound framebuffer into the same place in `texture`.
    pub fn copy_texture_sub_image(&self, texture: TextureId, rect: Rect) -> Result<()> {
        let _tex = ScopedTextureBinder::new(self.gl.as_ref(), texture);
        self.gl.copy_tex_sub_image_2d(rect.x, rect.y, rect)
    }

    /// Reallocate `texture` at `size` and fill it from the bound framebuffer.
    pub fn copy_texture_full_image(&self, texture: TextureId, size: Size) -> Result<()> {
        self.gl.tex_image_2d(texture, size, None)?;
        let _tex = ScopedTextureBinder::new(self.gl.as_ref(), texture);
        self.gl.copy_tex_sub_image_2d(0, 0, size.to_rect())
    }

    // ── Textures ───────────────────────────────

    /// Returns `TextureId::NONE` on failure.
    pub fn create_texture(&self) -> TextureId {
        self.gl.gen_texture().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to create texture");
            TextureId::NONE
        })
    }

    pub fn delete_texture(&self, texture: TextureId) {
        if texture.is_valid() {
            self.gl.delete_texture(texture);
        }
    }

    /// Reallocate storage (contents undefined, zeroed in practice).
    pub fn resize_texture(&self, texture: TextureId, size: Size) -> Result<()> {
        self.gl.tex_image_2d(texture, size, None)
    }

    // ── Synchronization and mailboxes ──────────

    pub fn insert_sync_point(&self) -> SyncPoint {
        self.gl.insert_sync_point()
    }

    pub fn wait_sync_point(&self, sync_point: SyncPoint) {
        self.gl.wait_sync_point(sync_point)
    }

    /// Publish `texture` under a new mailbox. Returns the zero mailbox and
    /// `SyncPoint::NONE` on failure.
    pub fn produce_mailbox_from_texture(&self, texture: TextureId) -> (Mailbox, SyncPoint) {
        if !texture.is_valid() {
            return (Mailbox::zero(), SyncPoint::NONE);
        }
        let mailbox = self.gl.gen_mailbox();
        if let Err(e) = self.gl.produce_texture(texture, &mailbox) {
            warn!(texture = texture.0, error = %e, "Failed to produce mailbox");
            return (Mailbox::zero(), SyncPoint::NONE);
        }
        (mailbox, self.gl.insert_sync_point())
    }

    /// Wait for `sync_point`, then bind the mailbox's texture to a new name.
    /// Returns `TextureId::NONE` on failure.
    pub fn consume_mailbox_to_texture(&self, mailbox: &Mailbox, sync_point: SyncPoint) -> TextureId {
        if mailbox.is_zero() {
            return TextureId::NONE;
        }
        self.gl.wait_sync_point(sync_point);

        let texture = match ScopedTexture::new(&self.gl) {
            Ok(texture) => texture,
            Err(e) => {
                warn!(error = %e, "Failed to create texture for mailbox");
                return TextureId::NONE;
            }
        };
        match self.gl.consume_texture(texture.id(), mailbox) {
            Ok(()) => texture.into_raw(),
            Err(e) => {
                warn!(?mailbox, error = %e, "Failed to consume mailbox");
                TextureId::NONE
            }
        }
    }

    // ── Capabilities and pipelines ─────────────

    /// Whether RGB565 can be read back, probed once with a 1x1 read.
    pub fn can_use_rgb565_readback(&self) -> bool {
        *self.rgb565_support.get_or_init(|| {
            let supported = self.gl.capabilities().rgb565_readback && self.probe_rgb565().is_ok();
            debug!(supported, "Probed RGB565 readback");
            supported
        })
    }

    fn probe_rgb565(&self) -> Result<()> {
        let texture = ScopedTexture::new(&self.gl)?;
        self.gl.tex_image_2d(texture.id(), Size::new(1, 1), None)?;
        let framebuffer = ScopedFramebuffer::new(&self.gl)?;
        self.gl.framebuffer_texture(framebuffer.id(), 0, texture.id())?;
        let _fb = ScopedFramebufferBinder::new(self.gl.as_ref(), framebuffer.id());
        let mut pixel = [0u8; 2];
        self.gl.read_pixels(Rect::new(0, 0, 1, 1), PixelFormat::Rgb565, &mut pixel)
    }

    pub fn max_draw_buffers(&self) -> u32 {
        self.gl.capabilities().max_draw_buffers
    }

    /// A reusable scaler. Falls back to lower quality tiers when
    /// intermediates cannot be allocated.
    pub fn create_scaler(
        &self,
        quality: ScalerQuality,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        vertically_flip: bool,
        swizzle: bool,
    ) -> Result<Box<dyn Scaler>> {
        let scaler = scaler::create_scaler(
            &self.gl,
            quality,
            src_size,
            src_subrect,
            dst_size,
            vertically_flip,
            swizzle,
        )?;
        Ok(Box::new(scaler))
    }

    /// A reusable RGB to YUV 4:2:0 readback pipeline.
    ///
    /// `dst_size` and `dst_subrect` must have even origin and dimensions.
    /// The multi-render-target path is used only when requested, enabled in
    /// the config, and supported by the context.
    #[allow(clippy::too_many_arguments)]
    pub fn create_readback_pipeline_yuv(
        &self,
        quality: ScalerQuality,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        dst_subrect: Rect,
        flip_vertically: bool,
        use_mrt: bool,
    ) -> Result<Box<dyn ReadbackYuv>> {
        let mrt_available = self.max_draw_buffers() >= 2;
        if use_mrt && !mrt_available {
            debug!("Multiple render targets unavailable; using three planar passes");
        }
        let pipeline = YuvReadbackPipeline::new(
            &self.gl,
            quality,
            src_size,
            src_subrect,
            dst_size,
            dst_subrect,
            flip_vertically,
            use_mrt && self.config.use_mrt && mrt_available,
            self.config.yuv_pool_budget,
        )?;
        Ok(Box::new(pipeline))
    }
}
