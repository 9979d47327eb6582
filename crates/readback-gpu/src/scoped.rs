//! Scoped ownership of GPU objects and bind points.
//!
//! Every wrapper releases what it acquired when dropped, including on early
//! returns through `?`.

use crate::context::{BufferId, FramebufferId, GpuContext, SharedContext, TextureId};
use readback_core::Result;
use std::fmt;
use std::marker::PhantomData;

/// A kind of GPU object: how to create, delete and bind it.
pub trait GpuObject {
    type Id: Copy + Default + PartialEq + fmt::Debug + Send + Sync;

    fn generate(gl: &dyn GpuContext) -> Result<Self::Id>;
    fn delete(gl: &dyn GpuContext, id: Self::Id);
    fn bind(gl: &dyn GpuContext, id: Self::Id);
}

pub enum TextureObject {}
pub enum FramebufferObject {}
pub enum BufferObject {}

impl GpuObject for TextureObject {
    type Id = TextureId;

    fn generate(gl: &dyn GpuContext) -> Result<TextureId> {
        gl.gen_texture()
    }
    fn delete(gl: &dyn GpuContext, id: TextureId) {
        gl.delete_texture(id)
    }
    fn bind(gl: &dyn GpuContext, id: TextureId) {
        gl.bind_texture(id)
    }
}

impl GpuObject for FramebufferObject {
    type Id = FramebufferId;

    fn generate(gl: &dyn GpuContext) -> Result<FramebufferId> {
        gl.gen_framebuffer()
    }
    fn delete(gl: &dyn GpuContext, id: FramebufferId) {
        gl.delete_framebuffer(id)
    }
    fn bind(gl: &dyn GpuContext, id: FramebufferId) {
        gl.bind_framebuffer(id)
    }
}

impl GpuObject for BufferObject {
    type Id = BufferId;

    fn generate(gl: &dyn GpuContext) -> Result<BufferId> {
        gl.gen_buffer()
    }
    fn delete(gl: &dyn GpuContext, id: BufferId) {
        gl.delete_buffer(id)
    }
    fn bind(gl: &dyn GpuContext, id: BufferId) {
        gl.bind_pack_buffer(id)
    }
}

/// Sole owner of one generated GPU object.
pub struct Scoped<K: GpuObject> {
    gl: SharedContext,
    id: K::Id,
}

impl<K: GpuObject> Scoped<K> {
    /// Generate a new object.
    pub fn new(gl: &SharedContext) -> Result<Self> {
        let id = K::generate(gl.as_ref())?;
        Ok(Self {
            gl: gl.clone(),
            id,
        })
    }

    /// Take ownership of an object created elsewhere.
    pub fn adopt(gl: &SharedContext, id: K::Id) -> Self {
        Self {
            gl: gl.clone(),
            id,
        }
    }

    #[inline]
    pub fn id(&self) -> K::Id {
        self.id
    }

    /// Give up ownership without deleting the object.
    pub fn into_raw(mut self) -> K::Id {
        std::mem::take(&mut self.id)
    }
}

impl<K: GpuObject> Drop for Scoped<K> {
    fn drop(&mut self) {
        if self.id != K::Id::default() {
            K::delete(self.gl.as_ref(), self.id);
        }
    }
}

impl<K: GpuObject> fmt::Debug for Scoped<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scoped").field(&self.id).finish()
    }
}

pub type ScopedTexture = Scoped<TextureObject>;
pub type ScopedFramebuffer = Scoped<FramebufferObject>;
pub type ScopedBuffer = Scoped<BufferObject>;

/// Binds an object for the lifetime of the guard, then unbinds it.
pub struct ScopedBinder<'a, K: GpuObject> {
    gl: &'a dyn GpuContext,
    _kind: PhantomData<K>,
}

impl<'a, K: GpuObject> ScopedBinder<'a, K> {
    pub fn new(gl: &'a dyn GpuContext, id: K::Id) -> Self {
        K::bind(gl, id);
        Self {
            gl,
            _kind: PhantomData,
        }
    }
}

impl<K: GpuObject> Drop for ScopedBinder<'_, K> {
    fn drop(&mut self) {
        K::bind(self.gl, K::Id::default());
    }
}

pub type ScopedTextureBinder<'a> = ScopedBinder<'a, TextureObject>;
pub type ScopedFramebufferBinder<'a> = ScopedBinder<'a, FramebufferObject>;
pub type ScopedBufferBinder<'a> = ScopedBinder<'a, BufferObject>;

/// Flushes the context when dropped.
pub struct ScopedFlush<'a> {
    gl: &'a dyn GpuContext,
}

impl<'a> ScopedFlush<'a> {
    pub fn new(gl: &'a dyn GpuContext) -> Self {
        Self { gl }
    }
}

impl Drop for ScopedFlush<'_> {
    fn drop(&mut self) {
        self.gl.flush();
    }
}
