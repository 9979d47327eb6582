//! RGB to YUV 4:2:0 readback.
//!
//! The source is cropped and scaled to `dst_subrect.size()`, converted to
//! three planes packed four samples per RGBA texel, read back asynchronously
//! and written into the caller's frame at `dst_subrect`. Two conversion
//! strategies produce the same planes:
//!
//! - three planar passes (Y, U, V), each sampling the scaled image;
//! - two multi-render-target passes: Y plus interleaved UV, then U and V
//!   from the UV texture.

use crate::context::{GpuContext, PassKind, SharedContext};
use crate::readback::{issue_pack_read, FinishFn, ReadbackQueue};
use crate::scaler::{create_scaler, MultiPassScaler, Scaler};
use crate::scoped::{ScopedFlush, ScopedTexture};
use crate::shading::{RGB_TO_U, RGB_TO_V, RGB_TO_Y};
use crate::texture_pool::TexturePool;
use parking_lot::Mutex;
use readback_core::{
    limits::PLANAR_PACKING, Mailbox, PixelFormat, ReadbackCallback, ReadbackError, Rect, Result,
    ScalerQuality, SharedFrame, Size, SyncPoint,
};
use tracing::{debug, info, warn};

/// A reusable pipeline reading mailbox textures back as YUV 4:2:0.
pub trait ReadbackYuv: Send + Sync {
    /// Consume `mailbox` (after waiting on `sync_point`), convert, and fill
    /// `target`. The callback runs exactly once.
    fn readback_yuv(
        &self,
        mailbox: &Mailbox,
        sync_point: SyncPoint,
        target: &SharedFrame,
        callback: ReadbackCallback,
    );

    /// The RGB crop/scale stage.
    fn scaler(&self) -> &dyn Scaler;
}

/// Sizes of the packed plane textures and of the planes they hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub y_texels: Size,
    pub chroma_texels: Size,
    pub y_size: Size,
    pub chroma_size: Size,
}

impl PlaneLayout {
    /// Layout for an even-sized image.
    pub fn new(size: Size) -> Self {
        let pack = PLANAR_PACKING;
        Self {
            y_texels: Size::new(size.width.div_ceil(pack), size.height),
            chroma_texels: Size::new(size.width.div_ceil(2 * pack), size.height / 2),
            y_size: size,
            chroma_size: Size::new(size.width / 2, size.height / 2),
        }
    }

    fn plane(&self, index: usize) -> (Size, Size) {
        if index == 0 {
            (self.y_texels, self.y_size)
        } else {
            (self.chroma_texels, self.chroma_size)
        }
    }
}

enum PlanePasses {
    Sequential {
        y: MultiPassScaler,
        u: MultiPassScaler,
        v: MultiPassScaler,
    },
    MultiTarget {
        pass1: MultiPassScaler,
        pass2: MultiPassScaler,
    },
}

/// Scaler plus plane conversion passes plus a private readback queue.
pub struct YuvReadbackPipeline {
    gl: SharedContext,
    scaler: MultiPassScaler,
    planes: PlanePasses,
    layout: PlaneLayout,
    dst_size: Size,
    dst_subrect: Rect,
    pool: Mutex<TexturePool>,
    readbacks: ReadbackQueue,
}

impl YuvReadbackPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gl: &SharedContext,
        quality: ScalerQuality,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        dst_subrect: Rect,
        flip_vertically: bool,
        use_mrt: bool,
        pool_budget: usize,
    ) -> Result<Self> {
        if !dst_size.is_even() || !dst_subrect.is_even() {
            return Err(ReadbackError::InvalidParameter(format!(
                "YUV 4:2:0 needs even geometry, got {} and {}",
                dst_size, dst_subrect
            )));
        }
        if dst_subrect.is_empty() || !dst_size.contains_rect(dst_subrect) {
            return Err(ReadbackError::InvalidParameter(format!(
                "subrect {} does not fit in {}",
                dst_subrect, dst_size
            )));
        }

        let scaled = dst_subrect.size();
        let scaler = create_scaler(
            gl,
            quality,
            src_size,
            src_subrect,
            scaled,
            flip_vertically,
            false,
        )?;

        let layout = PlaneLayout::new(scaled);
        let pack = PLANAR_PACKING;
        // Sample rects cover whole texels; columns past the edge repeat it.
        let luma_rect = Rect::new(0, 0, layout.y_texels.width * pack, scaled.height);
        let chroma_rect = Rect::new(0, 0, layout.chroma_texels.width * 2 * pack, scaled.height);

        let planes = if use_mrt {
            let uv_rect = Rect::new(0, 0, layout.chroma_texels.width * 2, layout.y_texels.height);
            PlanePasses::MultiTarget {
                pass1: MultiPassScaler::single_pass(
                    gl,
                    PassKind::YuvMrtPass1,
                    scaled,
                    luma_rect,
                    layout.y_texels,
                )?,
                pass2: MultiPassScaler::single_pass(
                    gl,
                    PassKind::YuvMrtPass2,
                    layout.y_texels,
                    uv_rect,
                    layout.chroma_texels,
                )?,
            }
        } else {
            PlanePasses::Sequential {
                y: MultiPassScaler::planar(gl, scaled, luma_rect, layout.y_texels, RGB_TO_Y)?,
                u: MultiPassScaler::planar(gl, scaled, chroma_rect, layout.chroma_texels, RGB_TO_U)?,
                v: MultiPassScaler::planar(gl, scaled, chroma_rect, layout.chroma_texels, RGB_TO_V)?,
            }
        };

        info!(
            %src_size,
            %dst_size,
            dst_subrect = %dst_subrect,
            quality = scaler.quality().name(),
            mrt = use_mrt,
            "Created YUV readback pipeline"
        );

        Ok(Self {
            gl: gl.clone(),
            scaler,
            planes,
            layout,
            dst_size,
            dst_subrect,
            pool: Mutex::new(TexturePool::new(pool_budget)),
            readbacks: ReadbackQueue::new(gl.clone()),
        })
    }

    pub fn uses_mrt(&self) -> bool {
        matches!(self.planes, PlanePasses::MultiTarget { .. })
    }

    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    pub fn pending_readbacks(&self) -> usize {
        self.readbacks.pending()
    }

    /// Run every pass and start the three plane reads.
    fn issue(&self, mailbox: &Mailbox, sync_point: SyncPoint, target: &SharedFrame) -> Result<FinishFn> {
        {
            let frame = target.lock();
            if frame.format != PixelFormat::Yuv420P || frame.size() != self.dst_size {
                return Err(ReadbackError::InvalidParameter(format!(
                    "target is a {:?} {} frame, expected Yuv420P {}",
                    frame.format,
                    frame.size(),
                    self.dst_size
                )));
            }
        }
        if mailbox.is_zero() {
            return Err(ReadbackError::InvalidParameter("zero mailbox".into()));
        }

        self.gl.wait_sync_point(sync_point);
        let source = ScopedTexture::new(&self.gl)?;
        self.gl.consume_texture(source.id(), mailbox)?;

        let gl = &self.gl;
        let layout = self.layout;
        let mut pool = self.pool.lock();

        let scaled = pool.acquire(gl, self.dst_subrect.size())?;
        self.scaler.scale(source.id(), scaled.id())?;

        let y = pool.acquire(gl, layout.y_texels)?;
        let u = pool.acquire(gl, layout.chroma_texels)?;
        let v = pool.acquire(gl, layout.chroma_texels)?;
        match &self.planes {
            PlanePasses::Sequential {
                y: y_pass,
                u: u_pass,
                v: v_pass,
            } => {
                y_pass.scale(scaled.id(), y.id())?;
                u_pass.scale(scaled.id(), u.id())?;
                v_pass.scale(scaled.id(), v.id())?;
            }
            PlanePasses::MultiTarget { pass1, pass2 } => {
                let uv = pool.acquire(gl, layout.y_texels)?;
                pass1.scale_into(scaled.id(), &[y.id(), uv.id()])?;
                pass2.scale_into(uv.id(), &[u.id(), v.id()])?;
                pool.release(uv);
            }
        }

        let buffers = [
            issue_pack_read(gl, y.id(), layout.y_texels.to_rect(), PixelFormat::Rgba8)?,
            issue_pack_read(gl, u.id(), layout.chroma_texels.to_rect(), PixelFormat::Rgba8)?,
            issue_pack_read(gl, v.id(), layout.chroma_texels.to_rect(), PixelFormat::Rgba8)?,
        ];

        // Later commands are ordered after these reads, so the textures can
        // be handed out again right away.
        for texture in [scaled, y, u, v] {
            pool.release(texture);
        }
        drop(pool);

        let target = target.clone();
        let origin = (self.dst_subrect.x, self.dst_subrect.y);
        let dst_size = self.dst_size;
        Ok(Box::new(move |gl: &dyn GpuContext| {
            let mut planes = Vec::with_capacity(buffers.len());
            for buffer in &buffers {
                match gl.map_pack_buffer(buffer.id()) {
                    Ok(pixels) => planes.push(pixels),
                    Err(e) => {
                        warn!(error = %e, "Failed to map YUV plane");
                        return false;
                    }
                }
            }

            // The caller may have replaced the frame while the read was in flight.
            let mut frame = target.lock();
            if frame.format != PixelFormat::Yuv420P || frame.size() != dst_size {
                warn!(
                    format = ?frame.format,
                    size = %frame.size(),
                    expected = %dst_size,
                    "YUV target changed during readback"
                );
                return false;
            }
            for (index, pixels) in planes.iter().enumerate() {
                let shift = if index == 0 { 0 } else { 1 };
                let (texels, size) = layout.plane(index);
                let src_stride = texels.width as usize * 4;
                let (x0, y0) = ((origin.0 >> shift) as usize, origin.1 >> shift);
                let width = size.width as usize;
                let Some(plane) = frame.planes.get_mut(index) else {
                    warn!(plane = index, "YUV target is missing a plane");
                    return false;
                };
                for row in 0..size.height {
                    let start = row as usize * src_stride;
                    let (Some(src), Some(dst)) = (
                        pixels.get(start..start + width),
                        plane
                            .get_row_mut(y0 + row)
                            .and_then(|line| line.get_mut(x0..x0 + width)),
                    ) else {
                        warn!(plane = index, row, "YUV plane size mismatch");
                        return false;
                    };
                    dst.copy_from_slice(src);
                }
            }
            true
        }))
    }
}

impl ReadbackYuv for YuvReadbackPipeline {
    fn readback_yuv(
        &self,
        mailbox: &Mailbox,
        sync_point: SyncPoint,
        target: &SharedFrame,
        callback: ReadbackCallback,
    ) {
        let _flush = ScopedFlush::new(self.gl.as_ref());
        match self.issue(mailbox, sync_point, target) {
            Ok(finish) => {
                self.readbacks.submit(finish, callback);
                debug!(pending = self.readbacks.pending(), "YUV readback started");
            }
            Err(e) => {
                warn!(error = %e, "YUV readback failed");
                self.readbacks.reject(callback);
            }
        }
    }

    fn scaler(&self) -> &dyn Scaler {
        &self.scaler
    }
}
