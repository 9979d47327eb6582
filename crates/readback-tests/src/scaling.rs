//! Scaling pipeline scenarios: exact output sizes, channel order across
//! quality tiers, and quality fallback.

use crate::common::{software_helper, upload};
use readback_core::{FrameBuffer, PixelFormat, Rect, ScalerQuality, Size, SoftwareConfig};
use readback_gpu::{ReadbackHelper, TextureId};

fn scale_and_read(
    helper: &ReadbackHelper,
    source: TextureId,
    src_size: Size,
    src_subrect: Rect,
    dst_size: Size,
    quality: ScalerQuality,
) -> Vec<u8> {
    let scaler = helper
        .create_scaler(quality, src_size, src_subrect, dst_size, false, false)
        .unwrap();
    let dest = helper.create_texture();
    helper.resize_texture(dest, dst_size).unwrap();
    scaler.scale(source, dest).unwrap();

    let mut out = vec![0u8; dst_size.area() * 4];
    helper
        .readback_texture_sync(dest, dst_size.to_rect(), &mut out, PixelFormat::Bgra8)
        .unwrap();
    helper.delete_texture(dest);
    out
}

fn pixel(pixels: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let i = ((y * width + x) * 4) as usize;
    [pixels[i], pixels[i + 1], pixels[i + 2], pixels[i + 3]]
}

fn near(a: [u8; 4], b: [u8; 4], tolerance: u8) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x.abs_diff(*y) <= tolerance)
}

#[test]
fn solid_red_downscale_at_good_quality() {
    let (_ctx, helper) = software_helper(SoftwareConfig::default());
    let src_size = Size::new(1024, 768);
    let source = upload(&helper, &FrameBuffer::solid(1024, 768, [255, 0, 0, 255]));

    let dst_size = Size::new(256, 192);
    let out = scale_and_read(
        &helper,
        source,
        src_size,
        Rect::new(0, 0, 1024, 768),
        dst_size,
        ScalerQuality::Good,
    );

    assert_eq!(out.len(), 256 * 192 * 4);
    for px in out.chunks_exact(4) {
        assert!(near([px[0], px[1], px[2], px[3]], [0, 0, 255, 255], 1), "{:?}", px);
    }
}

#[test]
fn output_dimensions_match_destination_for_every_tier() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let pairs = [
        (Size::new(640, 480), Size::new(640, 480)),
        (Size::new(640, 480), Size::new(320, 240)),
        (Size::new(640, 480), Size::new(100, 75)),
        (Size::new(333, 201), Size::new(17, 9)),
        (Size::new(64, 64), Size::new(1, 1)),
    ];

    for (src_size, dst_size) in pairs {
        let source = upload(&helper, &FrameBuffer::test_pattern(src_size.width, src_size.height));
        for quality in ScalerQuality::ALL {
            let scaler = helper
                .create_scaler(quality, src_size, src_size.to_rect(), dst_size, true, false)
                .unwrap();
            assert_eq!(scaler.dst_size(), dst_size);

            let dest = helper.create_texture();
            helper.resize_texture(dest, dst_size).unwrap();
            scaler.scale(source, dest).unwrap();
            assert_eq!(ctx.texture_pixels(dest).unwrap().len(), dst_size.area() * 4);
            helper.delete_texture(dest);
        }
        helper.delete_texture(source);
    }
}

#[test]
fn best_and_fast_agree_on_channel_order() {
    let (_ctx, helper) = software_helper(SoftwareConfig::default());
    // Left half red, right half blue.
    let mut frame = FrameBuffer::solid(256, 128, [255, 0, 0, 255]);
    for y in 0..128 {
        let row = frame.primary_plane_mut().row_mut(y);
        for px in row[128 * 4..].chunks_exact_mut(4) {
            px.copy_from_slice(&[0, 0, 255, 255]);
        }
    }
    let source = upload(&helper, &frame);
    let src_size = Size::new(256, 128);
    let dst_size = Size::new(64, 32);

    let fast = scale_and_read(&helper, source, src_size, src_size.to_rect(), dst_size, ScalerQuality::Fast);
    let best = scale_and_read(&helper, source, src_size, src_size.to_rect(), dst_size, ScalerQuality::Best);
    assert_eq!(fast.len(), best.len());

    for out in [&fast, &best] {
        assert!(near(pixel(out, 64, 4, 16), [0, 0, 255, 255], 2));
        assert!(near(pixel(out, 64, 60, 16), [255, 0, 0, 255], 2));
    }
}

#[test]
fn crop_reads_only_the_subrect() {
    let (_ctx, helper) = software_helper(SoftwareConfig::default());
    let mut frame = FrameBuffer::solid(256, 128, [255, 0, 0, 255]);
    for y in 0..128 {
        let row = frame.primary_plane_mut().row_mut(y);
        for px in row[128 * 4..].chunks_exact_mut(4) {
            px.copy_from_slice(&[0, 255, 0, 255]);
        }
    }
    let source = upload(&helper, &frame);
    let src_size = Size::new(256, 128);
    let dst_size = Size::new(32, 32);

    for quality in ScalerQuality::ALL {
        let out = scale_and_read(&helper, source, src_size, Rect::new(128, 0, 128, 128), dst_size, quality);
        for y in 0..32 {
            for x in 4..28 {
                assert!(
                    near(pixel(&out, 32, x, y), [0, 255, 0, 255], 2),
                    "{} at ({}, {})",
                    quality.name(),
                    x,
                    y
                );
            }
        }
    }
}

#[test]
fn allocation_failure_steps_down_one_tier_at_a_time() {
    let source_bytes = 1024 * 768 * 4;
    let good_intermediates = 512 * 384 * 4;

    // Room for Good's single intermediate but not Best's first one.
    let (_ctx, helper) = software_helper(SoftwareConfig {
        max_texture_memory: Some(source_bytes + good_intermediates + 1024),
        ..Default::default()
    });
    let source = upload(&helper, &FrameBuffer::solid(1024, 768, [0, 0, 0, 255]));
    let src_size = Size::new(1024, 768);
    let dst_size = Size::new(256, 192);

    let scaler = helper
        .create_scaler(ScalerQuality::Best, src_size, src_size.to_rect(), dst_size, false, false)
        .unwrap();
    assert_eq!(scaler.quality(), ScalerQuality::Good);
    drop(scaler);

    // Requests below the failing tier are never raised.
    let scaler = helper
        .create_scaler(ScalerQuality::Fast, src_size, src_size.to_rect(), dst_size, false, false)
        .unwrap();
    assert_eq!(scaler.quality(), ScalerQuality::Fast);
    drop(scaler);
    helper.delete_texture(source);
}

#[test]
fn exhausted_memory_falls_through_to_fast() {
    let source_bytes = 1024 * 768 * 4;
    let (_ctx, helper) = software_helper(SoftwareConfig {
        max_texture_memory: Some(source_bytes + 1024),
        ..Default::default()
    });
    upload(&helper, &FrameBuffer::solid(1024, 768, [0, 0, 0, 255]));
    let src_size = Size::new(1024, 768);

    for quality in [ScalerQuality::Best, ScalerQuality::Good] {
        let scaler = helper
            .create_scaler(quality, src_size, src_size.to_rect(), Size::new(256, 192), false, false)
            .unwrap();
        assert_eq!(scaler.quality(), ScalerQuality::Fast);
        assert!(scaler.quality() <= quality);
    }
}

#[test]
fn invalid_geometry_is_not_retried() {
    let (_ctx, helper) = software_helper(SoftwareConfig::default());
    let result = helper.create_scaler(
        ScalerQuality::Best,
        Size::new(64, 64),
        Rect::new(100, 100, 10, 10),
        Size::new(8, 8),
        false,
        false,
    );
    assert!(result.is_err());
}
