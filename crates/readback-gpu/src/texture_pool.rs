//! Texture pool for plane and intermediate textures.
//!
//! Avoids allocating/deallocating render targets per readback by keeping
//! released textures keyed by size. Commands on one context execute in
//! order, so a texture may be released as soon as the last command using
//! it has been issued.

use crate::context::{SharedContext, TextureId};
use crate::scoped::ScopedTexture;
use readback_core::{Result, Size};
use std::collections::HashMap;
use tracing::trace;

/// A texture owned by (or on loan from) a pool.
#[derive(Debug)]
pub struct PooledTexture {
    texture: ScopedTexture,
    size: Size,
}

impl PooledTexture {
    #[inline]
    pub fn id(&self) -> TextureId {
        self.texture.id()
    }

    #[inline]
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn memory_size(&self) -> usize {
        self.size.area() * 4
    }
}

/// Pool of reusable RGBA8 textures.
pub struct TexturePool {
    /// Available (free) textures, keyed by dimensions.
    free: HashMap<Size, Vec<PooledTexture>>,
    /// Total memory held by free textures.
    total_memory: usize,
    /// Maximum memory budget for the pool.
    max_memory: usize,
}

impl TexturePool {
    /// Create a new texture pool with the given memory budget.
    pub fn new(max_memory: usize) -> Self {
        Self {
            free: HashMap::new(),
            total_memory: 0,
            max_memory,
        }
    }

    /// Acquire a texture from the pool or allocate a new one.
    pub fn acquire(&mut self, gl: &SharedContext, size: Size) -> Result<PooledTexture> {
        if let Some(textures) = self.free.get_mut(&size) {
            if let Some(tex) = textures.pop() {
                self.total_memory -= tex.memory_size();
                trace!(%size, texture = tex.id().0, "Reusing pooled texture");
                return Ok(tex);
            }
        }

        let texture = ScopedTexture::new(gl)?;
        gl.tex_image_2d(texture.id(), size, None)?;
        Ok(PooledTexture { texture, size })
    }

    /// Return a texture to the pool for reuse.
    pub fn release(&mut self, texture: PooledTexture) {
        let mem = texture.memory_size();

        // Over budget: the texture is dropped, which deletes it.
        if self.total_memory + mem > self.max_memory {
            return;
        }

        self.total_memory += mem;
        self.free.entry(texture.size).or_default().push(texture);
    }

    /// Total memory held by pooled (free) textures.
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    /// Number of textures in the pool.
    pub fn texture_count(&self) -> usize {
        self.free.values().map(|v| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareContext;
    use std::sync::Arc;

    #[test]
    fn test_release_then_acquire_reuses() {
        let ctx = Arc::new(SoftwareContext::new());
        let gl: SharedContext = ctx.clone();
        let mut pool = TexturePool::new(1 << 20);

        let tex = pool.acquire(&gl, Size::new(8, 4)).unwrap();
        let id = tex.id();
        pool.release(tex);
        assert_eq!(pool.texture_count(), 1);
        assert_eq!(pool.memory_usage(), 8 * 4 * 4);

        let again = pool.acquire(&gl, Size::new(8, 4)).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.memory_usage(), 0);
        assert_eq!(gl.texture_size(again.id()), Some(Size::new(8, 4)));
    }

    #[test]
    fn test_over_budget_release_deletes() {
        let ctx = Arc::new(SoftwareContext::new());
        let gl: SharedContext = ctx.clone();
        let mut pool = TexturePool::new(64);

        let tex = pool.acquire(&gl, Size::new(8, 8)).unwrap();
        pool.release(tex);
        assert_eq!(pool.texture_count(), 0);
        assert_eq!(ctx.live_textures(), 0);
    }
}
