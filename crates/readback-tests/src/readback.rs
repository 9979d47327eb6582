//! Asynchronous readback: exactly-once callbacks, ordering and teardown.

use crate::common::{result_log, result_slot, software_helper, upload};
use parking_lot::Mutex;
use readback_core::{FrameBuffer, PixelFormat, Rect, SharedPixels, Size, SoftwareConfig};
use readback_gpu::{GpuContext, ReadbackHelper, TextureId};
use std::sync::Arc;

const REQUESTS: usize = 8;

fn issue(helper: &ReadbackHelper, source: TextureId, callback: impl FnOnce(bool) + Send + 'static) -> SharedPixels {
    let out: SharedPixels = Arc::new(Mutex::new(vec![0; 8 * 8 * 4]));
    helper.crop_scale_readback_and_clean_texture(
        source,
        Size::new(32, 32),
        Rect::new(0, 0, 32, 32),
        Size::new(8, 8),
        out.clone(),
        PixelFormat::Bgra8,
        callback,
    );
    out
}

#[test]
fn every_request_completes_exactly_once() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let source = upload(&helper, &FrameBuffer::solid(32, 32, [0, 255, 0, 255]));
    let (log, make) = result_log();

    let outputs: Vec<SharedPixels> = (0..REQUESTS)
        .map(|_| {
            let callback = make();
            issue(&helper, source, move |ok| callback.run(ok))
        })
        .collect();
    assert_eq!(helper.pending_readbacks(), REQUESTS);
    assert!(log.lock().is_empty());

    ctx.poll(true);
    assert_eq!(*log.lock(), vec![true; REQUESTS]);
    for out in outputs {
        assert_eq!(*out.lock(), [0, 255, 0, 255].repeat(64));
    }

    // Nothing fires twice.
    ctx.poll(true);
    assert_eq!(log.lock().len(), REQUESTS);
}

#[test]
fn destroying_the_helper_fails_outstanding_requests() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let source = upload(&helper, &FrameBuffer::solid(32, 32, [0, 0, 0, 255]));
    let (log, make) = result_log();

    for _ in 0..REQUESTS {
        let callback = make();
        issue(&helper, source, move |ok| callback.run(ok));
    }
    drop(helper);
    assert_eq!(*log.lock(), vec![false; REQUESTS]);

    ctx.poll(true);
    assert_eq!(log.lock().len(), REQUESTS);
    // Request-owned scaled textures went with the helper; the source stays.
    assert_eq!(ctx.live_textures(), 1);
}

#[test]
fn context_loss_fails_outstanding_requests() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    let source = upload(&helper, &FrameBuffer::solid(32, 32, [0, 0, 0, 255]));
    let (log, make) = result_log();

    for _ in 0..REQUESTS {
        let callback = make();
        issue(&helper, source, move |ok| callback.run(ok));
    }
    ctx.lose_context();
    assert_eq!(*log.lock(), vec![false; REQUESTS]);
    assert!(ctx.is_context_lost());

    // Requests after loss fail on the next poll.
    let (result, callback) = result_slot();
    issue(&helper, source, move |ok| callback.run(ok));
    assert_eq!(*result.lock(), None);
    ctx.poll(true);
    assert_eq!(*result.lock(), Some(false));
}

#[test]
fn rejected_and_accepted_requests_each_report_once() {
    let (ctx, helper) = software_helper(SoftwareConfig {
        rgb565_readback: false,
        ..Default::default()
    });
    let source = upload(&helper, &FrameBuffer::solid(32, 32, [0, 0, 0, 255]));
    let (log, make) = result_log();

    for i in 0..REQUESTS {
        let callback = make();
        let format = if i % 2 == 0 {
            PixelFormat::Bgra8
        } else {
            PixelFormat::Rgb565
        };
        helper.crop_scale_readback_and_clean_texture(
            source,
            Size::new(32, 32),
            Rect::new(0, 0, 32, 32),
            Size::new(8, 8),
            Arc::new(Mutex::new(vec![0; 8 * 8 * 4])),
            format,
            move |ok: bool| callback.run(ok),
        );
    }
    // Rejections are reported from poll too, in issue order.
    assert!(log.lock().is_empty());

    ctx.poll(true);
    let expected: Vec<bool> = (0..REQUESTS).map(|i| i % 2 == 0).collect();
    assert_eq!(*log.lock(), expected);

    ctx.poll(true);
    assert_eq!(log.lock().len(), REQUESTS);
}

#[test]
fn bgra_swizzle_matches_native_bgra() {
    let frame = FrameBuffer::test_pattern(64, 16);
    let mut results = Vec::new();
    for bgra_readback in [true, false] {
        let (ctx, helper) = software_helper(SoftwareConfig {
            bgra_readback,
            ..Default::default()
        });
        let source = upload(&helper, &frame);
        let out: SharedPixels = Arc::new(Mutex::new(vec![0; 32 * 8 * 4]));
        let (result, callback) = result_slot();
        helper.crop_scale_readback_and_clean_texture(
            source,
            frame.size(),
            frame.size().to_rect(),
            Size::new(32, 8),
            out.clone(),
            PixelFormat::Bgra8,
            callback,
        );
        ctx.poll(true);
        assert_eq!(*result.lock(), Some(true));
        let pixels = out.lock().clone();
        results.push(pixels);
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn rgb565_readback_packs_pixels() {
    let (ctx, helper) = software_helper(SoftwareConfig::default());
    assert!(helper.can_use_rgb565_readback());
    let source = upload(&helper, &FrameBuffer::solid(16, 16, [255, 0, 0, 255]));
    let out: SharedPixels = Arc::new(Mutex::new(vec![0; 16 * 16 * 2]));
    let (result, callback) = result_slot();
    helper.readback_texture_async(source, Size::new(16, 16), out.clone(), PixelFormat::Rgb565, callback);
    ctx.poll(true);
    assert_eq!(*result.lock(), Some(true));
    // Little-endian 0xF800.
    assert_eq!(*out.lock(), [0x00, 0xF8].repeat(256));
}
