//! Fixtures shared by the integration tests.

use parking_lot::Mutex;
use readback_core::{FrameBuffer, ReadbackCallback, SoftwareConfig};
use readback_gpu::{ReadbackHelper, SharedContext, SoftwareContext, TextureId};
use std::sync::Arc;

pub fn software_helper(config: SoftwareConfig) -> (Arc<SoftwareContext>, ReadbackHelper) {
    let ctx = Arc::new(SoftwareContext::with_config(config));
    let gl: SharedContext = ctx.clone();
    (ctx, ReadbackHelper::new(gl))
}

pub fn upload(helper: &ReadbackHelper, frame: &FrameBuffer) -> TextureId {
    let texture = helper.create_texture();
    helper
        .context()
        .tex_image_2d(texture, frame.size(), Some(&frame.to_packed()))
        .unwrap();
    texture
}

/// Callback that records its result.
pub fn result_slot() -> (Arc<Mutex<Option<bool>>>, ReadbackCallback) {
    let slot = Arc::new(Mutex::new(None));
    let s = slot.clone();
    (slot, ReadbackCallback::new(move |ok| *s.lock() = Some(ok)))
}

/// Callback factory appending every result to one log.
pub fn result_log() -> (Arc<Mutex<Vec<bool>>>, impl Fn() -> ReadbackCallback) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    let make = move || {
        let l = l.clone();
        ReadbackCallback::new(move |ok| l.lock().push(ok))
    };
    (log, make)
}

pub fn rgba_to_bgra(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(4)
        .flat_map(|p| [p[2], p[1], p[0], p[3]])
        .collect()
}

pub fn flip_rows(pixels: &[u8], row_bytes: usize) -> Vec<u8> {
    pixels.chunks_exact(row_bytes).rev().flatten().copied().collect()
}
