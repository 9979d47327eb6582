//! Cross-context texture sharing through mailboxes and sync points.

use crate::common::{flip_rows, result_slot, rgba_to_bgra, upload};
use parking_lot::Mutex;
use readback_core::{FrameBuffer, Mailbox, PixelFormat, Size, SharedPixels, SyncPoint};
use readback_gpu::{GpuContext, ReadbackHelper, SharedContext, SoftwareContext, TextureId};
use std::sync::Arc;

struct SharedPair {
    producer_ctx: Arc<SoftwareContext>,
    producer: ReadbackHelper,
    consumer_ctx: Arc<SoftwareContext>,
    consumer: ReadbackHelper,
}

fn shared_pair() -> SharedPair {
    let producer_ctx = Arc::new(SoftwareContext::new());
    let consumer_ctx = Arc::new(producer_ctx.new_shared());
    let producer_gl: SharedContext = producer_ctx.clone();
    let consumer_gl: SharedContext = consumer_ctx.clone();
    SharedPair {
        producer_ctx,
        producer: ReadbackHelper::new(producer_gl),
        consumer_ctx,
        consumer: ReadbackHelper::new(consumer_gl),
    }
}

fn round_trip(frame: &FrameBuffer) {
    let pair = shared_pair();
    let source = upload(&pair.producer, frame);
    let (mailbox, sync_point) = pair.producer.produce_mailbox_from_texture(source);
    assert!(!mailbox.is_zero());
    assert!(!sync_point.is_none());

    let consumed = pair.consumer.consume_mailbox_to_texture(&mailbox, sync_point);
    assert!(consumed.is_valid());
    assert_eq!(pair.consumer_ctx.texture_size(consumed), Some(frame.size()));
    assert_eq!(pair.consumer_ctx.texture_pixels(consumed).unwrap(), frame.to_packed());
    assert_eq!(
        pair.producer_ctx.texture_pixels(source).unwrap(),
        frame.to_packed()
    );
}

#[test]
fn solid_texture_round_trips_between_contexts() {
    round_trip(&FrameBuffer::solid(16, 16, [10, 20, 30, 255]));
}

#[test]
fn checkerboard_texture_round_trips_between_contexts() {
    round_trip(&FrameBuffer::checkerboard(
        24,
        16,
        4,
        [255, 255, 255, 255],
        [0, 0, 0, 255],
    ));
}

#[test]
fn mailbox_is_consumed_once() {
    let pair = shared_pair();
    let source = upload(&pair.producer, &FrameBuffer::solid(4, 4, [1, 2, 3, 4]));
    let (mailbox, sync_point) = pair.producer.produce_mailbox_from_texture(source);

    assert!(pair.consumer.consume_mailbox_to_texture(&mailbox, sync_point).is_valid());
    assert_eq!(
        pair.consumer.consume_mailbox_to_texture(&mailbox, sync_point),
        TextureId::NONE
    );
}

#[test]
fn failure_sentinels() {
    let pair = shared_pair();
    assert_eq!(
        pair.producer.produce_mailbox_from_texture(TextureId::NONE),
        (Mailbox::zero(), SyncPoint::NONE)
    );
    assert_eq!(
        pair.consumer.consume_mailbox_to_texture(&Mailbox::zero(), SyncPoint::NONE),
        TextureId::NONE
    );
    // Never produced.
    assert_eq!(
        pair.consumer
            .consume_mailbox_to_texture(&Mailbox::generate(), SyncPoint::NONE),
        TextureId::NONE
    );
}

#[test]
fn sync_points_are_ordered_across_the_share_group() {
    let pair = shared_pair();
    let first = pair.producer.insert_sync_point();
    let second = pair.consumer.insert_sync_point();
    let third = pair.producer.insert_sync_point();
    assert!(first < second);
    assert!(second < third);
}

#[test]
fn mailbox_crop_scale_readback_in_consumer() {
    let pair = shared_pair();
    let frame = FrameBuffer::checkerboard(16, 16, 4, [255, 0, 0, 255], [0, 0, 255, 255]);
    let source = upload(&pair.producer, &frame);
    let (mailbox, sync_point) = pair.producer.produce_mailbox_from_texture(source);

    let out: SharedPixels = Arc::new(Mutex::new(vec![0; 16 * 16 * 4]));
    let (result, callback) = result_slot();
    pair.consumer.crop_scale_readback_and_clean_mailbox(
        &mailbox,
        sync_point,
        Size::new(16, 16),
        Size::new(16, 16).to_rect(),
        Size::new(16, 16),
        out.clone(),
        PixelFormat::Bgra8,
        callback,
    );
    pair.consumer_ctx.poll(true);
    assert_eq!(*result.lock(), Some(true));

    // Read back bottom-up, as BGRA.
    let expected = flip_rows(&rgba_to_bgra(&frame.to_packed()), 16 * 4);
    assert_eq!(*out.lock(), expected);
    // The consumed texture is cleaned up.
    assert_eq!(pair.consumer_ctx.live_textures(), 0);
}
