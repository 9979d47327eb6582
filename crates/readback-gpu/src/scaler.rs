//! Multi-pass texture scaler.
//!
//! A scaler is planned once for a fixed (source size, source subrect,
//! destination size) and then run any number of times. Downscales at `Good`
//! and `Best` quality go through successive 50% reductions so every source
//! texel contributes to the output; `Best` splits every reduction into
//! separable bicubic passes. Upscales are always one pass.

use crate::context::{Axis, DrawPass, PassKind, SharedContext, TextureId};
use crate::scoped::{ScopedFramebuffer, ScopedFramebufferBinder, ScopedTexture, ScopedTextureBinder};
use readback_core::{ReadbackError, Rect, Result, ScalerQuality, Size};
use tracing::{debug, warn};

/// Scales a region of one texture into another.
pub trait Scaler: Send + Sync {
    /// Scale `source` into `dest`. `dest` must already be allocated at
    /// `dst_size()`.
    fn scale(&self, source: TextureId, dest: TextureId) -> Result<()>;
    fn src_size(&self) -> Size;
    fn src_subrect(&self) -> Rect;
    fn dst_size(&self) -> Size;
    /// The tier actually in use, which may be below the one requested.
    fn quality(&self) -> ScalerQuality;
}

/// One planned draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalerStage {
    pub kind: PassKind,
    /// Region read from this stage's input, in texels.
    pub src_rect: Rect,
    pub dst_size: Size,
    pub flip_vertically: bool,
    pub swizzle: bool,
}

impl ScalerStage {
    fn new(kind: PassKind, src_rect: Rect, dst_size: Size) -> Self {
        Self {
            kind,
            src_rect,
            dst_size,
            flip_vertically: false,
            swizzle: false,
        }
    }

    pub fn draw_pass(&self) -> DrawPass {
        DrawPass {
            kind: self.kind,
            src_rect: [
                self.src_rect.x as f32,
                self.src_rect.y as f32,
                self.src_rect.width as f32,
                self.src_rect.height as f32,
            ],
            flip_vertically: self.flip_vertically,
            swizzle: self.swizzle,
        }
    }
}

#[inline]
fn halve(current: u32, target: u32) -> u32 {
    if current / 2 >= target {
        current / 2
    } else {
        current
    }
}

fn push_resize(stages: &mut Vec<ScalerStage>, quality: ScalerQuality, from: Rect, to: Size) {
    match quality {
        ScalerQuality::Best if to.width >= from.width && to.height >= from.height => {
            stages.push(ScalerStage::new(PassKind::Bicubic2d, from, to));
        }
        ScalerQuality::Best => {
            let mut from = from;
            if from.width != to.width {
                let mid = Size::new(to.width, from.height);
                stages.push(ScalerStage::new(PassKind::Bicubic(Axis::Horizontal), from, mid));
                from = mid.to_rect();
            }
            if from.height != to.height {
                stages.push(ScalerStage::new(PassKind::Bicubic(Axis::Vertical), from, to));
            }
        }
        _ => stages.push(ScalerStage::new(PassKind::Bilinear, from, to)),
    }
}

/// Plan the draws that take `src_subrect` to `dst_size`.
///
/// Flip and swizzle are applied by the last draw only.
pub fn plan_stages(
    quality: ScalerQuality,
    src_subrect: Rect,
    dst_size: Size,
    flip_vertically: bool,
    swizzle: bool,
) -> Vec<ScalerStage> {
    let mut stages = Vec::new();

    if quality == ScalerQuality::Fast || src_subrect.size() == dst_size {
        stages.push(ScalerStage::new(PassKind::Bilinear, src_subrect, dst_size));
    } else {
        let mut rect = src_subrect;
        loop {
            let current = rect.size();
            let next = Size::new(
                halve(current.width, dst_size.width),
                halve(current.height, dst_size.height),
            );
            if next == current {
                break;
            }
            push_resize(&mut stages, quality, rect, next);
            rect = next.to_rect();
        }
        if rect.size() != dst_size {
            push_resize(&mut stages, quality, rect, dst_size);
        }
    }

    if let Some(last) = stages.last_mut() {
        last.flip_vertically = flip_vertically;
        last.swizzle = swizzle;
    }
    stages
}

/// Check sizes and clamp the subrect to the source bounds.
fn validate(gl: &SharedContext, src_size: Size, src_subrect: Rect, dst_size: Size) -> Result<Rect> {
    if src_size.is_empty() || dst_size.is_empty() {
        return Err(ReadbackError::InvalidParameter(format!(
            "cannot scale {} to {}",
            src_size, dst_size
        )));
    }
    let max = gl.capabilities().max_texture_size;
    if dst_size.width > max || dst_size.height > max {
        return Err(ReadbackError::InvalidParameter(format!(
            "destination {} exceeds the {} texture limit",
            dst_size, max
        )));
    }
    let clamped = src_subrect.clamp_to(src_size);
    if clamped.is_empty() {
        return Err(ReadbackError::InvalidParameter(format!(
            "subrect {} lies outside the {} source",
            src_subrect, src_size
        )));
    }
    if clamped != src_subrect {
        warn!(requested = %src_subrect, clamped = %clamped, "Source subrect clamped to texture bounds");
    }
    Ok(clamped)
}

/// Scaler that runs its planned stages through owned intermediate textures.
pub struct MultiPassScaler {
    gl: SharedContext,
    quality: ScalerQuality,
    src_size: Size,
    src_subrect: Rect,
    dst_size: Size,
    stages: Vec<ScalerStage>,
    /// Output of every stage but the last.
    intermediates: Vec<ScopedTexture>,
    framebuffer: ScopedFramebuffer,
}

impl MultiPassScaler {
    /// Plan and allocate a scaler at exactly `quality`.
    ///
    /// Fails with an allocation error when intermediates do not fit; see
    /// [`create_scaler`] for the falling-back constructor.
    pub fn new(
        gl: &SharedContext,
        quality: ScalerQuality,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        flip_vertically: bool,
        swizzle: bool,
    ) -> Result<Self> {
        let src_subrect = validate(gl, src_size, src_subrect, dst_size)?;
        let stages = plan_stages(quality, src_subrect, dst_size, flip_vertically, swizzle);
        Self::from_stages(gl, quality, src_size, src_subrect, dst_size, stages)
    }

    /// Single draw that packs four samples of one channel per output texel.
    ///
    /// `src_rect` may extend past the source; edge texels are repeated.
    pub fn planar(
        gl: &SharedContext,
        src_size: Size,
        src_rect: Rect,
        dst_size: Size,
        weights: [f32; 4],
    ) -> Result<Self> {
        Self::single_pass(gl, PassKind::Planar { weights }, src_size, src_rect, dst_size)
    }

    /// Single draw of an arbitrary pass, including multi-target ones.
    pub fn single_pass(
        gl: &SharedContext,
        kind: PassKind,
        src_size: Size,
        src_rect: Rect,
        dst_size: Size,
    ) -> Result<Self> {
        if dst_size.is_empty() || src_rect.is_empty() {
            return Err(ReadbackError::InvalidParameter(format!(
                "cannot run {:?} from {} to {}",
                kind, src_rect, dst_size
            )));
        }
        let stages = vec![ScalerStage::new(kind, src_rect, dst_size)];
        Self::from_stages(gl, ScalerQuality::Fast, src_size, src_rect, dst_size, stages)
    }

    fn from_stages(
        gl: &SharedContext,
        quality: ScalerQuality,
        src_size: Size,
        src_subrect: Rect,
        dst_size: Size,
        stages: Vec<ScalerStage>,
    ) -> Result<Self> {
        let mut intermediates = Vec::with_capacity(stages.len().saturating_sub(1));
        for stage in &stages[..stages.len().saturating_sub(1)] {
            let texture = ScopedTexture::new(gl)?;
            gl.tex_image_2d(texture.id(), stage.dst_size, None)?;
            intermediates.push(texture);
        }
        let framebuffer = ScopedFramebuffer::new(gl)?;

        debug!(
            quality = quality.name(),
            passes = stages.len(),
            %src_size,
            src_subrect = %src_subrect,
            %dst_size,
            "Created scaler"
        );

        Ok(Self {
            gl: gl.clone(),
            quality,
            src_size,
            src_subrect,
            dst_size,
            stages,
            intermediates,
            framebuffer,
        })
    }

    pub fn stages(&self) -> &[ScalerStage] {
        &self.stages
    }

    pub fn intermediate_count(&self) -> usize {
        self.intermediates.len()
    }

    /// Run every stage, writing the last one into `dests` (one texture per
    /// output of the final pass).
    pub fn scale_into(&self, source: TextureId, dests: &[TextureId]) -> Result<()> {
        let last = self.stages.len() - 1;
        let outputs = self.stages[last].kind.output_count();
        if dests.len() != outputs {
            return Err(ReadbackError::InvalidParameter(format!(
                "{} destinations for a {} target pass",
                dests.len(),
                outputs
            )));
        }
        for &dest in dests {
            if self.gl.texture_size(dest) != Some(self.dst_size) {
                return Err(ReadbackError::InvalidParameter(format!(
                    "destination texture {} is not {}",
                    dest.0, self.dst_size
                )));
            }
        }

        let gl = self.gl.as_ref();
        let fb = self.framebuffer.id();
        for (i, stage) in self.stages.iter().enumerate() {
            let input = if i == 0 {
                source
            } else {
                self.intermediates[i - 1].id()
            };
            if i == last {
                for (attachment, &dest) in dests.iter().enumerate() {
                    gl.framebuffer_texture(fb, attachment, dest)?;
                }
            } else {
                gl.framebuffer_texture(fb, 0, self.intermediates[i].id())?;
            }

            let _fb = ScopedFramebufferBinder::new(gl, fb);
            let _tex = ScopedTextureBinder::new(gl, input);
            gl.draw(&stage.draw_pass())?;
        }
        Ok(())
    }
}

impl Scaler for MultiPassScaler {
    fn scale(&self, source: TextureId, dest: TextureId) -> Result<()> {
        self.scale_into(source, &[dest])
    }

    fn src_size(&self) -> Size {
        self.src_size
    }

    fn src_subrect(&self) -> Rect {
        self.src_subrect
    }

    fn dst_size(&self) -> Size {
        self.dst_size
    }

    fn quality(&self) -> ScalerQuality {
        self.quality
    }
}

/// Create a scaler, stepping down one quality tier at a time while
/// allocation fails. Never steps up.
pub fn create_scaler(
    gl: &SharedContext,
    quality: ScalerQuality,
    src_size: Size,
    src_subrect: Rect,
    dst_size: Size,
    flip_vertically: bool,
    swizzle: bool,
) -> Result<MultiPassScaler> {
    let mut last_error = None;
    for tier in quality.fallback_chain() {
        match MultiPassScaler::new(
            gl,
            tier,
            src_size,
            src_subrect,
            dst_size,
            flip_vertically,
            swizzle,
        ) {
            Ok(scaler) => {
                if tier != quality {
                    warn!(
                        requested = quality.name(),
                        using = tier.name(),
                        "Scaler quality reduced after allocation failure"
                    );
                }
                return Ok(scaler);
            }
            Err(e) if e.is_allocation_failure() => {
                debug!(quality = tier.name(), error = %e, "Scaler allocation failed");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| ReadbackError::Internal("no scaler tier attempted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareContext;
    use proptest::prelude::*;
    use readback_core::SoftwareConfig;
    use std::sync::Arc;

    fn sizes(stages: &[ScalerStage]) -> Vec<Size> {
        stages.iter().map(|s| s.dst_size).collect()
    }

    #[test]
    fn test_good_plan_halves_then_stops() {
        let stages = plan_stages(
            ScalerQuality::Good,
            Rect::new(0, 0, 1024, 768),
            Size::new(256, 192),
            false,
            false,
        );
        assert_eq!(sizes(&stages), vec![Size::new(512, 384), Size::new(256, 192)]);
        assert!(stages.iter().all(|s| s.kind == PassKind::Bilinear));
    }

    #[test]
    fn test_good_plan_finishes_with_exact_pass() {
        let stages = plan_stages(
            ScalerQuality::Good,
            Rect::new(0, 0, 1024, 768),
            Size::new(300, 200),
            true,
            false,
        );
        assert_eq!(
            sizes(&stages),
            vec![Size::new(512, 384), Size::new(300, 200)]
        );
        assert!(!stages[0].flip_vertically);
        assert!(stages[1].flip_vertically);
    }

    #[test]
    fn test_best_plan_is_separable() {
        let stages = plan_stages(
            ScalerQuality::Best,
            Rect::new(0, 0, 1024, 768),
            Size::new(256, 192),
            false,
            true,
        );
        assert_eq!(stages.len(), 4);
        assert_eq!(stages[0].kind, PassKind::Bicubic(Axis::Horizontal));
        assert_eq!(stages[0].dst_size, Size::new(512, 768));
        assert_eq!(stages[1].kind, PassKind::Bicubic(Axis::Vertical));
        assert_eq!(stages[3].dst_size, Size::new(256, 192));
        assert!(stages[3].swizzle);
        assert!(!stages[0].swizzle);
    }

    #[test]
    fn test_fast_and_identity_are_single_pass() {
        let fast = plan_stages(
            ScalerQuality::Fast,
            Rect::new(8, 8, 100, 100),
            Size::new(10, 10),
            false,
            false,
        );
        assert_eq!(fast.len(), 1);
        assert_eq!(fast[0].src_rect, Rect::new(8, 8, 100, 100));

        let copy = plan_stages(
            ScalerQuality::Best,
            Rect::new(0, 0, 64, 64),
            Size::new(64, 64),
            true,
            false,
        );
        assert_eq!(copy.len(), 1);
        assert_eq!(copy[0].kind, PassKind::Bilinear);
    }

    #[test]
    fn test_upscale_has_no_halving() {
        for quality in [ScalerQuality::Fast, ScalerQuality::Good, ScalerQuality::Best] {
            let stages = plan_stages(
                quality,
                Rect::new(0, 0, 100, 50),
                Size::new(400, 200),
                true,
                false,
            );
            assert_eq!(sizes(&stages), vec![Size::new(400, 200)], "{:?}", quality);
            assert!(stages[0].flip_vertically);
        }

        let best = plan_stages(
            ScalerQuality::Best,
            Rect::new(0, 0, 100, 50),
            Size::new(100, 200),
            false,
            false,
        );
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].kind, PassKind::Bicubic2d);
    }

    #[test]
    fn test_best_upscale_runs_one_draw() {
        let ctx = Arc::new(SoftwareContext::new());
        let gl: SharedContext = ctx.clone();
        let src = gl.gen_texture().unwrap();
        gl.tex_image_2d(src, Size::new(8, 6), Some(&[0, 0, 255, 255].repeat(48)))
            .unwrap();
        let dst = gl.gen_texture().unwrap();
        gl.tex_image_2d(dst, Size::new(32, 24), None).unwrap();

        let scaler = MultiPassScaler::new(
            &gl,
            ScalerQuality::Best,
            Size::new(8, 6),
            Rect::new(0, 0, 8, 6),
            Size::new(32, 24),
            false,
            false,
        )
        .unwrap();
        assert_eq!(scaler.intermediate_count(), 0);
        scaler.scale(src, dst).unwrap();
        assert_eq!(ctx.texture_pixels(dst).unwrap(), [0, 0, 255, 255].repeat(32 * 24));
    }

    #[test]
    fn test_scaler_runs_and_preserves_solid() {
        let ctx = Arc::new(SoftwareContext::new());
        let gl: SharedContext = ctx.clone();
        let src = gl.gen_texture().unwrap();
        let size = Size::new(64, 48);
        gl.tex_image_2d(src, size, Some(&[0, 255, 0, 255].repeat(size.area())))
            .unwrap();
        let dst = gl.gen_texture().unwrap();
        gl.tex_image_2d(dst, Size::new(16, 12), None).unwrap();

        let scaler = MultiPassScaler::new(
            &gl,
            ScalerQuality::Best,
            size,
            size.to_rect(),
            Size::new(16, 12),
            false,
            false,
        )
        .unwrap();
        assert_eq!(scaler.intermediate_count(), scaler.stages().len() - 1);
        scaler.scale(src, dst).unwrap();
        assert_eq!(ctx.texture_pixels(dst).unwrap(), [0, 255, 0, 255].repeat(16 * 12));
    }

    #[test]
    fn test_subrect_is_clamped() {
        let gl: SharedContext = Arc::new(SoftwareContext::new());
        let scaler = MultiPassScaler::new(
            &gl,
            ScalerQuality::Fast,
            Size::new(10, 10),
            Rect::new(5, 5, 20, 20),
            Size::new(5, 5),
            false,
            false,
        )
        .unwrap();
        assert_eq!(scaler.src_subrect(), Rect::new(5, 5, 5, 5));

        let outside = MultiPassScaler::new(
            &gl,
            ScalerQuality::Fast,
            Size::new(10, 10),
            Rect::new(20, 20, 5, 5),
            Size::new(5, 5),
            false,
            false,
        );
        assert!(outside.is_err());
    }

    #[test]
    fn test_fallback_steps_down_until_it_fits() {
        // Room for Good's 512x384 intermediate but not Best's 512x768 one.
        let ctx = Arc::new(SoftwareContext::with_config(SoftwareConfig {
            max_texture_memory: Some(512 * 384 * 4 + 1024),
            ..Default::default()
        }));
        let gl: SharedContext = ctx.clone();
        let scaler = create_scaler(
            &gl,
            ScalerQuality::Best,
            Size::new(1024, 768),
            Rect::new(0, 0, 1024, 768),
            Size::new(256, 192),
            false,
            false,
        )
        .unwrap();
        assert_eq!(scaler.quality(), ScalerQuality::Good);
        assert_eq!(ctx.texture_memory(), 512 * 384 * 4);
    }

    proptest! {
        #[test]
        fn prop_plan_reaches_exact_size(
            sw in 1u32..2048,
            sh in 1u32..2048,
            dw in 1u32..2048,
            dh in 1u32..2048,
            q in 1u8..=3,
        ) {
            let quality = ScalerQuality::from_u8(q).unwrap();
            let src = Rect::new(0, 0, sw, sh);
            let stages = plan_stages(quality, src, Size::new(dw, dh), true, false);

            prop_assert!(!stages.is_empty());
            prop_assert_eq!(stages[0].src_rect, src);
            prop_assert_eq!(stages.last().unwrap().dst_size, Size::new(dw, dh));
            for pair in stages.windows(2) {
                prop_assert_eq!(pair[1].src_rect, pair[0].dst_size.to_rect());
                prop_assert!(!pair[0].flip_vertically);
            }
            if quality == ScalerQuality::Fast || (dw >= sw && dh >= sh) {
                prop_assert_eq!(stages.len(), 1);
            }

            let good = plan_stages(ScalerQuality::Good, src, Size::new(dw, dh), false, false);
            let best = plan_stages(ScalerQuality::Best, src, Size::new(dw, dh), false, false);
            prop_assert!(best.len() >= good.len());
        }
    }
}
