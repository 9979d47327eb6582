//! YUV 4:2:0 readback scenarios.

use crate::common::{result_log, result_slot, software_helper, upload};
use parking_lot::Mutex;
use readback_core::{
    FrameBuffer, PixelFormat, Rect, ScalerQuality, SharedFrame, Size, SoftwareConfig,
};
use readback_gpu::{GpuContext, PlaneLayout, ReadbackHelper, ReadbackYuv, SoftwareContext, TextureId};
use std::sync::Arc;

fn yuv_frame(size: Size) -> SharedFrame {
    Arc::new(Mutex::new(FrameBuffer::new(size.width, size.height, PixelFormat::Yuv420P)))
}

#[allow(clippy::too_many_arguments)]
fn read_yuv(
    ctx: &SoftwareContext,
    helper: &ReadbackHelper,
    source: TextureId,
    src_size: Size,
    dst_size: Size,
    dst_subrect: Rect,
    use_mrt: bool,
    target: &SharedFrame,
) {
    let pipeline = helper
        .create_readback_pipeline_yuv(
            ScalerQuality::Good,
            src_size,
            src_size.to_rect(),
            dst_size,
            dst_subrect,
            false,
            use_mrt,
        )
        .unwrap();
    let (mailbox, sync_point) = helper.produce_mailbox_from_texture(source);
    let (result, callback) = result_slot();
    pipeline.readback_yuv(&mailbox, sync_point, target, callback);
    ctx.poll(true);
    assert_eq!(*result.lock(), Some(true));
}

#[test]
fn chroma_planes_are_half_of_luma() {
    for size in [
        Size::new(2, 2),
        Size::new(64, 48),
        Size::new(320, 240),
        Size::new(1918, 1080),
    ] {
        let layout = PlaneLayout::new(size);
        assert_eq!(layout.y_size, size);
        assert_eq!(layout.chroma_size.width * 2, layout.y_size.width);
        assert_eq!(layout.chroma_size.height * 2, layout.y_size.height);
    }

    let frame = FrameBuffer::new(64, 48, PixelFormat::Yuv420P);
    assert_eq!((frame.planes[0].width, frame.planes[0].height), (64, 48));
    assert_eq!((frame.planes[1].width, frame.planes[1].height), (32, 24));
    assert_eq!((frame.planes[2].width, frame.planes[2].height), (32, 24));
}

#[test]
fn odd_geometry_is_rejected() {
    let (_ctx, helper) = software_helper(SoftwareConfig::default());
    let src = Size::new(128, 128);
    for (dst_size, dst_subrect) in [
        (Size::new(65, 64), Rect::new(0, 0, 64, 64)),
        (Size::new(64, 63), Rect::new(0, 0, 64, 62)),
        (Size::new(64, 64), Rect::new(0, 1, 64, 62)),
        (Size::new(64, 64), Rect::new(0, 0, 63, 64)),
    ] {
        for use_mrt in [false, true] {
            let result = helper.create_readback_pipeline_yuv(
                ScalerQuality::Fast,
                src,
                src.to_rect(),
                dst_size,
                dst_subrect,
                false,
                use_mrt,
            );
            assert!(result.is_err(), "{} / {}", dst_size, dst_subrect);
        }
    }
}

#[test]
fn multi_target_matches_sequential_planes() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let frame = FrameBuffer::test_pattern(128, 64);
    let source = upload(&helper, &frame);
    let dst = Size::new(64, 32);

    let sequential = yuv_frame(dst);
    read_yuv(&ctx, &helper, source, frame.size(), dst, dst.to_rect(), false, &sequential);
    let mrt = yuv_frame(dst);
    read_yuv(&ctx, &helper, source, frame.size(), dst, dst.to_rect(), true, &mrt);

    let sequential = sequential.lock();
    let mrt = mrt.lock();
    for (index, (a, b)) in sequential.planes.iter().zip(mrt.planes.iter()).enumerate() {
        for y in 0..a.height {
            for (x, (p, q)) in a.row(y).iter().zip(b.row(y).iter()).enumerate() {
                assert!(
                    p.abs_diff(*q) <= 2,
                    "plane {} at ({}, {}): {} vs {}",
                    index,
                    x,
                    y,
                    p,
                    q
                );
            }
        }
    }
}

#[test]
fn subrect_placement_leaves_letterbox_untouched() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let frame = FrameBuffer::solid(64, 64, [255, 0, 0, 255]);
    let source = upload(&helper, &frame);

    let dst = Size::new(32, 32);
    let subrect = Rect::new(8, 8, 16, 16);
    let target = yuv_frame(dst);
    for plane in target.lock().planes.iter_mut() {
        plane.fill(7);
    }
    read_yuv(&ctx, &helper, source, frame.size(), dst, subrect, false, &target);

    let target = target.lock();
    let luma = &target.planes[0];
    for y in 0..32 {
        for x in 0..32u32 {
            let value = luma.row(y)[x as usize];
            let inside = (8..24).contains(&x) && (8..24).contains(&y);
            if inside {
                assert!(value.abs_diff(81) <= 1, "Y at ({}, {}) = {}", x, y, value);
            } else {
                assert_eq!(value, 7, "letterbox Y at ({}, {})", x, y);
            }
        }
    }
    let chroma = &target.planes[2];
    for y in 0..16 {
        for x in 0..16u32 {
            let value = chroma.row(y)[x as usize];
            let inside = (4..12).contains(&x) && (4..12).contains(&y);
            if inside {
                // V of pure red is well above neutral.
                assert!(value > 200, "V at ({}, {}) = {}", x, y, value);
            } else {
                assert_eq!(value, 7, "letterbox V at ({}, {})", x, y);
            }
        }
    }
}

#[test]
fn mismatched_target_fails_callback() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let source = upload(&helper, &FrameBuffer::solid(16, 16, [0, 0, 0, 255]));
    let pipeline = helper
        .create_readback_pipeline_yuv(
            ScalerQuality::Fast,
            Size::new(16, 16),
            Rect::new(0, 0, 16, 16),
            Size::new(16, 16),
            Rect::new(0, 0, 16, 16),
            false,
            false,
        )
        .unwrap();

    let (mailbox, sync_point) = helper.produce_mailbox_from_texture(source);
    let (result, callback) = result_slot();
    pipeline.readback_yuv(&mailbox, sync_point, &yuv_frame(Size::new(8, 8)), callback);
    ctx.poll(true);
    assert_eq!(*result.lock(), Some(false));
}

fn pipeline_16x16(helper: &ReadbackHelper, use_mrt: bool) -> Box<dyn ReadbackYuv> {
    helper
        .create_readback_pipeline_yuv(
            ScalerQuality::Good,
            Size::new(32, 32),
            Rect::new(0, 0, 32, 32),
            Size::new(16, 16),
            Rect::new(0, 0, 16, 16),
            false,
            use_mrt,
        )
        .unwrap()
}

const YUV_REQUESTS: usize = 4;

#[test]
fn dropping_the_pipeline_fails_pending_readbacks() {
    for use_mrt in [false, true] {
        let (ctx, helper) = software_helper(SoftwareConfig::default());
        let source = upload(&helper, &FrameBuffer::solid(32, 32, [0, 128, 255, 255]));
        let pipeline = pipeline_16x16(&helper, use_mrt);
        let (log, make) = result_log();

        for _ in 0..YUV_REQUESTS {
            let (mailbox, sync_point) = helper.produce_mailbox_from_texture(source);
            pipeline.readback_yuv(&mailbox, sync_point, &yuv_frame(Size::new(16, 16)), make());
        }
        assert!(log.lock().is_empty());

        drop(pipeline);
        assert_eq!(*log.lock(), vec![false; YUV_REQUESTS]);

        ctx.poll(true);
        assert_eq!(log.lock().len(), YUV_REQUESTS);
        // Plane and pooled textures went with the pipeline.
        assert_eq!(ctx.live_textures(), 1);
    }
}

#[test]
fn context_loss_fails_pending_yuv_readbacks() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let source = upload(&helper, &FrameBuffer::solid(32, 32, [0, 128, 255, 255]));
    let pipeline = pipeline_16x16(&helper, false);
    let (log, make) = result_log();

    for _ in 0..YUV_REQUESTS {
        let (mailbox, sync_point) = helper.produce_mailbox_from_texture(source);
        pipeline.readback_yuv(&mailbox, sync_point, &yuv_frame(Size::new(16, 16)), make());
    }
    ctx.lose_context();
    assert_eq!(*log.lock(), vec![false; YUV_REQUESTS]);

    ctx.poll(true);
    drop(pipeline);
    assert_eq!(log.lock().len(), YUV_REQUESTS);
}

#[test]
fn target_replaced_in_flight_fails_without_panicking() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let source = upload(&helper, &FrameBuffer::solid(32, 32, [0, 128, 255, 255]));
    let pipeline = pipeline_16x16(&helper, false);

    let smaller = yuv_frame(Size::new(16, 16));
    let reformatted = yuv_frame(Size::new(16, 16));
    let (first, first_done) = result_slot();
    let (second, second_done) = result_slot();
    for (target, callback) in [(&smaller, first_done), (&reformatted, second_done)] {
        let (mailbox, sync_point) = helper.produce_mailbox_from_texture(source);
        pipeline.readback_yuv(&mailbox, sync_point, target, callback);
    }
    *smaller.lock() = FrameBuffer::new(4, 4, PixelFormat::Yuv420P);
    *reformatted.lock() = FrameBuffer::new(16, 16, PixelFormat::Rgba8);

    ctx.poll(true);
    assert_eq!(*first.lock(), Some(false));
    assert_eq!(*second.lock(), Some(false));
    assert_eq!(smaller.lock().size(), Size::new(4, 4));
}

#[test]
fn pipeline_exposes_its_scaler() {
    let (_ctx, helper) = software_helper(SoftwareConfig::default());
    let pipeline = helper
        .create_readback_pipeline_yuv(
            ScalerQuality::Best,
            Size::new(256, 256),
            Rect::new(0, 0, 256, 256),
            Size::new(64, 64),
            Rect::new(16, 16, 32, 32),
            true,
            true,
        )
        .unwrap();
    let scaler = pipeline.scaler();
    assert_eq!(scaler.src_size(), Size::new(256, 256));
    assert_eq!(scaler.dst_size(), Size::new(32, 32));
    assert_eq!(scaler.quality(), ScalerQuality::Best);
}
