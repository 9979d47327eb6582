//! Ordered queue of in-flight asynchronous readbacks.
//!
//! Each request is registered with the context's completion signal. When the
//! signal fires the request is marked ready, and ready requests at the front
//! of the queue are finished (pixels copied out) and their callbacks run, in
//! submission order, without holding the queue lock.

use crate::context::{BufferId, GpuContext, SharedContext, TextureId};
use crate::scoped::{ScopedBuffer, ScopedBufferBinder, ScopedFramebuffer, ScopedFramebufferBinder};
use parking_lot::Mutex;
use readback_core::{PixelFormat, ReadbackCallback, Rect, Result, SharedPixels};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Start an asynchronous read of `rect` from `texture` into a fresh pack
/// buffer. The buffer is owned by the returned guard.
pub fn issue_pack_read(
    gl: &SharedContext,
    texture: TextureId,
    rect: Rect,
    format: PixelFormat,
) -> Result<ScopedBuffer> {
    let framebuffer = ScopedFramebuffer::new(gl)?;
    gl.framebuffer_texture(framebuffer.id(), 0, texture)?;
    let _fb = ScopedFramebufferBinder::new(gl.as_ref(), framebuffer.id());

    let buffer = ScopedBuffer::new(gl)?;
    let _buffer = ScopedBufferBinder::new(gl.as_ref(), buffer.id());
    gl.read_pixels_to_pack_buffer(rect, format)?;
    Ok(buffer)
}

/// Copy the first `len` bytes of a completed pack buffer into `out`.
pub fn copy_pack_buffer(gl: &dyn GpuContext, buffer: BufferId, out: &SharedPixels, len: usize) -> bool {
    let pixels = match gl.map_pack_buffer(buffer) {
        Ok(pixels) => pixels,
        Err(e) => {
            warn!(buffer = buffer.0, error = %e, "Failed to map pack buffer");
            return false;
        }
    };
    let mut out = out.lock();
    match (pixels.get(..len), out.get_mut(..len)) {
        (Some(src), Some(dst)) => {
            dst.copy_from_slice(src);
            true
        }
        _ => {
            warn!(len, available = pixels.len(), "Readback size mismatch");
            false
        }
    }
}

/// Copies the completed readback out of GPU-owned memory. Returns success.
///
/// Dropping it unrun releases the request's GPU objects.
pub type FinishFn = Box<dyn FnOnce(&dyn GpuContext) -> bool + Send>;

struct Request {
    id: u64,
    finish: FinishFn,
    callback: ReadbackCallback,
    /// Set once the completion signal has fired.
    result: Option<bool>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    requests: VecDeque<Request>,
}

/// Requests owned by one helper or pipeline.
///
/// Dropping the queue runs every outstanding callback with `false`.
pub struct ReadbackQueue {
    gl: SharedContext,
    state: Arc<Mutex<QueueState>>,
}

impl ReadbackQueue {
    pub fn new(gl: SharedContext) -> Self {
        Self {
            gl,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Queue a request behind every command issued so far.
    pub fn submit(&self, finish: FinishFn, callback: ReadbackCallback) {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.requests.push_back(Request {
                id,
                finish,
                callback,
                result: None,
            });
            id
        };
        trace!(request = id, "Readback queued");

        // Weak on both sides: the signal lives inside the context, and the
        // queue may go away before it fires.
        let queue = Arc::downgrade(&self.state);
        let gl = Arc::downgrade(&self.gl);
        self.gl.signal_completion(ReadbackCallback::new(move |ok| {
            Self::complete(&queue, &gl, id, ok);
        }));
    }

    /// Queue a request that has already failed. Its callback still runs
    /// from `poll`, behind every request submitted before it.
    pub fn reject(&self, callback: ReadbackCallback) {
        self.submit(Box::new(|_: &dyn GpuContext| false), callback);
    }

    fn complete(
        queue: &Weak<Mutex<QueueState>>,
        gl: &Weak<dyn GpuContext>,
        id: u64,
        ok: bool,
    ) {
        // A dropped queue has already failed its requests.
        let Some(queue) = queue.upgrade() else {
            return;
        };

        let ready = {
            let mut state = queue.lock();
            if let Some(request) = state.requests.iter_mut().find(|r| r.id == id) {
                request.result = Some(ok);
            }
            let mut ready = Vec::new();
            while state.requests.front().is_some_and(|r| r.result.is_some()) {
                if let Some(request) = state.requests.pop_front() {
                    ready.push(request);
                }
            }
            ready
        };

        let gl = gl.upgrade();
        for request in ready {
            let success = match (&gl, request.result) {
                (Some(gl), Some(true)) => (request.finish)(gl.as_ref()),
                _ => false,
            };
            trace!(request = request.id, success, "Readback finished");
            request.callback.run(success);
        }
    }

    /// Requests whose callbacks have not run yet.
    pub fn pending(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl Drop for ReadbackQueue {
    fn drop(&mut self) {
        let outstanding = std::mem::take(&mut self.state.lock().requests);
        if !outstanding.is_empty() {
            debug!(count = outstanding.len(), "Cancelling outstanding readbacks");
        }
        for request in outstanding {
            drop(request.finish);
            request.callback.run(false);
        }
    }
}
