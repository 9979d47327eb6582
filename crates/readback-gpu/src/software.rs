//! CPU backend.
//!
//! Executes every command eagerly on the calling thread (draws fan out over
//! rayon), so each sync point is already retired when it is inserted and
//! completions only wait for the next `poll`. Contexts created with
//! [`SoftwareContext::new_shared`] share textures through mailboxes.

use crate::context::{
    BufferId, Capabilities, DrawPass, FramebufferId, GpuContext, TextureId,
};
use crate::shading::{self, TexelView};
use parking_lot::{Mutex, RwLock};
use readback_core::{
    Mailbox, PixelFormat, ReadbackCallback, ReadbackError, Rect, Result, Size, SoftwareConfig,
    SyncPoint,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Texels {
    size: Size,
    data: Vec<u8>,
}

type Storage = Arc<RwLock<Texels>>;

#[derive(Default)]
struct TextureSlot {
    storage: Option<Storage>,
    /// Bytes counted against this context's budget.
    charged: usize,
}

struct Produced {
    storage: Storage,
    /// Last sync point issued in the group when the texture was produced.
    issued_before: u32,
}

/// State shared by every context in a share group.
#[derive(Default)]
pub struct ShareGroup {
    mailboxes: Mutex<HashMap<Mailbox, Produced>>,
    last_sync_point: AtomicU32,
}

impl ShareGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Produced textures not yet consumed.
    pub fn pending_mailboxes(&self) -> usize {
        self.mailboxes.lock().len()
    }
}

#[derive(Default)]
struct State {
    next_id: u32,
    textures: HashMap<TextureId, TextureSlot>,
    /// Attachments by index; `TextureId::NONE` marks an empty slot.
    framebuffers: HashMap<FramebufferId, Vec<TextureId>>,
    buffers: HashMap<BufferId, Option<Vec<u8>>>,
    bound_texture: TextureId,
    bound_framebuffer: FramebufferId,
    bound_pack_buffer: BufferId,
    texture_memory: usize,
    pending: VecDeque<ReadbackCallback>,
    last_waited: u32,
    lost: bool,
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check_alive(&self) -> Result<()> {
        if self.lost {
            Err(ReadbackError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn storage(&self, texture: TextureId) -> Result<Storage> {
        self.textures
            .get(&texture)
            .and_then(|slot| slot.storage.clone())
            .ok_or_else(|| ReadbackError::NotFound(format!("texture {} has no storage", texture.0)))
    }

    fn attachment(&self, index: usize) -> Result<Storage> {
        let attachments = self
            .framebuffers
            .get(&self.bound_framebuffer)
            .ok_or_else(|| ReadbackError::NotFound("no framebuffer bound".into()))?;
        let texture = attachments.get(index).copied().unwrap_or(TextureId::NONE);
        if !texture.is_valid() {
            return Err(ReadbackError::NotFound(format!(
                "framebuffer {} has no attachment {}",
                self.bound_framebuffer.0, index
            )));
        }
        self.storage(texture)
    }
}

fn read_rect(texels: &Texels, rect: Rect, format: PixelFormat) -> Result<Vec<u8>> {
    if !texels.size.contains_rect(rect) {
        return Err(ReadbackError::InvalidParameter(format!(
            "read rect {} outside {} surface",
            rect, texels.size
        )));
    }
    let bpp = format.bytes_per_pixel();
    let mut out = vec![0u8; rect.area() * bpp];
    if rect.is_empty() {
        return Ok(out);
    }
    let stride = texels.size.width as usize * 4;
    let row_bytes = rect.width as usize * 4;
    for (row, dst) in out.chunks_exact_mut(rect.width as usize * bpp).enumerate() {
        let start = (rect.y as usize + row) * stride + rect.x as usize * 4;
        format.convert_row_from_rgba(&texels.data[start..start + row_bytes], dst);
    }
    Ok(out)
}

fn write_rect(texels: &mut Texels, rect: Rect, pixels: &[u8]) -> Result<()> {
    if !texels.size.contains_rect(rect) {
        return Err(ReadbackError::InvalidParameter(format!(
            "write rect {} outside {} texture",
            rect, texels.size
        )));
    }
    if pixels.len() < rect.area() * 4 {
        return Err(ReadbackError::InvalidParameter(format!(
            "{} bytes supplied for a {} rect",
            pixels.len(),
            rect
        )));
    }
    if rect.is_empty() {
        return Ok(());
    }
    let stride = texels.size.width as usize * 4;
    let row_bytes = rect.width as usize * 4;
    for (row, src) in pixels.chunks_exact(row_bytes).take(rect.height as usize).enumerate() {
        let start = (rect.y as usize + row) * stride + rect.x as usize * 4;
        texels.data[start..start + row_bytes].copy_from_slice(src);
    }
    Ok(())
}

/// `GpuContext` that renders on the CPU.
pub struct SoftwareContext {
    config: SoftwareConfig,
    share: Arc<ShareGroup>,
    state: Mutex<State>,
}

impl SoftwareContext {
    pub fn new() -> Self {
        Self::with_config(SoftwareConfig::default())
    }

    pub fn with_config(config: SoftwareConfig) -> Self {
        Self::in_share_group(config, ShareGroup::new())
    }

    pub fn in_share_group(config: SoftwareConfig, share: Arc<ShareGroup>) -> Self {
        debug!(
            budget = ?config.max_texture_memory,
            draw_buffers = config.max_draw_buffers,
            "Created software context"
        );
        Self {
            config,
            share,
            state: Mutex::new(State::default()),
        }
    }

    /// A second context in the same share group with the same settings.
    pub fn new_shared(&self) -> Self {
        Self::in_share_group(self.config.clone(), self.share.clone())
    }

    pub fn share_group(&self) -> &Arc<ShareGroup> {
        &self.share
    }

    /// Simulate a lost context: pending completions run with `false` and
    /// every later command fails.
    pub fn lose_context(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.lost = true;
            std::mem::take(&mut state.pending)
        };
        info!(pending = pending.len(), "Software context lost");
        for done in pending {
            done.run(false);
        }
    }

    /// Number of live texture names.
    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    /// Bytes of texture storage charged against the budget.
    pub fn texture_memory(&self) -> usize {
        self.state.lock().texture_memory
    }

    pub fn bound_framebuffer(&self) -> FramebufferId {
        self.state.lock().bound_framebuffer
    }

    /// Copy of a texture's RGBA8 contents.
    pub fn texture_pixels(&self, texture: TextureId) -> Option<Vec<u8>> {
        let storage = self.state.lock().storage(texture).ok()?;
        let texels = storage.read();
        Some(texels.data.clone())
    }
}

impl Default for SoftwareContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuContext for SoftwareContext {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_texture_size: self.config.max_texture_size,
            max_draw_buffers: self.config.max_draw_buffers.max(1),
            rgb565_readback: self.config.rgb565_readback,
            bgra_readback: self.config.bgra_readback,
        }
    }

    fn gen_texture(&self) -> Result<TextureId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let id = TextureId(state.alloc_id());
        state.textures.insert(id, TextureSlot::default());
        Ok(id)
    }

    fn delete_texture(&self, texture: TextureId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.textures.remove(&texture) {
            state.texture_memory -= slot.charged;
        }
        if state.bound_texture == texture {
            state.bound_texture = TextureId::NONE;
        }
    }

    fn tex_image_2d(&self, texture: TextureId, size: Size, pixels: Option<&[u8]>) -> Result<()> {
        let max = self.config.max_texture_size;
        if size.width > max || size.height > max {
            return Err(ReadbackError::InvalidParameter(format!(
                "texture size {} exceeds the {} limit",
                size, max
            )));
        }
        let bytes = size.area() * 4;
        if pixels.is_some_and(|p| p.len() < bytes) {
            return Err(ReadbackError::InvalidParameter(format!(
                "too few bytes for a {} texture",
                size
            )));
        }

        let mut state = self.state.lock();
        state.check_alive()?;
        let old = state
            .textures
            .get(&texture)
            .map(|slot| slot.charged)
            .ok_or_else(|| ReadbackError::NotFound(format!("texture {}", texture.0)))?;

        let projected = state.texture_memory - old + bytes;
        if let Some(budget) = self.config.max_texture_memory {
            if projected > budget {
                debug!(texture = texture.0, %size, projected, budget, "Texture allocation over budget");
                return Err(ReadbackError::OutOfMemory(format!(
                    "{} texture needs {} bytes, budget is {}",
                    size, bytes, budget
                )));
            }
        }

        let data = match pixels {
            Some(p) => p[..bytes].to_vec(),
            None => vec![0; bytes],
        };
        state.texture_memory = projected;
        if let Some(slot) = state.textures.get_mut(&texture) {
            slot.storage = Some(Arc::new(RwLock::new(Texels { size, data })));
            slot.charged = bytes;
        }
        Ok(())
    }

    fn tex_sub_image_2d(&self, texture: TextureId, rect: Rect, pixels: &[u8]) -> Result<()> {
        let storage = {
            let state = self.state.lock();
            state.check_alive()?;
            state.storage(texture)?
        };
        let mut texels = storage.write();
        write_rect(&mut texels, rect, pixels)
    }

    fn texture_size(&self, texture: TextureId) -> Option<Size> {
        let storage = self.state.lock().storage(texture).ok()?;
        let size = storage.read().size;
        Some(size)
    }

    fn gen_framebuffer(&self) -> Result<FramebufferId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let id = FramebufferId(state.alloc_id());
        state.framebuffers.insert(id, Vec::new());
        Ok(id)
    }

    fn delete_framebuffer(&self, framebuffer: FramebufferId) {
        let mut state = self.state.lock();
        state.framebuffers.remove(&framebuffer);
        if state.bound_framebuffer == framebuffer {
            state.bound_framebuffer = FramebufferId::NONE;
        }
    }

    fn framebuffer_texture(
        &self,
        framebuffer: FramebufferId,
        attachment: usize,
        texture: TextureId,
    ) -> Result<()> {
        if attachment >= self.config.max_draw_buffers.max(1) as usize {
            return Err(ReadbackError::InvalidParameter(format!(
                "attachment {} beyond {} draw buffers",
                attachment, self.config.max_draw_buffers
            )));
        }
        let mut state = self.state.lock();
        state.check_alive()?;
        let attachments = state
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or_else(|| ReadbackError::NotFound(format!("framebuffer {}", framebuffer.0)))?;
        if attachments.len() <= attachment {
            attachments.resize(attachment + 1, TextureId::NONE);
        }
        attachments[attachment] = texture;
        Ok(())
    }

    fn gen_buffer(&self) -> Result<BufferId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let id = BufferId(state.alloc_id());
        state.buffers.insert(id, None);
        Ok(id)
    }

    fn delete_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        if state.bound_pack_buffer == buffer {
            state.bound_pack_buffer = BufferId::NONE;
        }
    }

    fn bind_texture(&self, texture: TextureId) {
        self.state.lock().bound_texture = texture;
    }

    fn bind_framebuffer(&self, framebuffer: FramebufferId) {
        self.state.lock().bound_framebuffer = framebuffer;
    }

    fn bind_pack_buffer(&self, buffer: BufferId) {
        self.state.lock().bound_pack_buffer = buffer;
    }

    fn draw(&self, pass: &DrawPass) -> Result<()> {
        let outputs = pass.kind.output_count();
        if outputs > self.config.max_draw_buffers.max(1) as usize {
            return Err(ReadbackError::InvalidParameter(format!(
                "{:?} needs {} draw buffers",
                pass.kind, outputs
            )));
        }

        let (source, targets) = {
            let state = self.state.lock();
            state.check_alive()?;
            let source = state.storage(state.bound_texture)?;
            let targets = (0..outputs)
                .map(|i| state.attachment(i))
                .collect::<Result<Vec<_>>>()?;
            (source, targets)
        };

        if targets.iter().any(|t| Arc::ptr_eq(t, &source)) {
            return Err(ReadbackError::InvalidParameter(
                "draw samples the texture it renders to".into(),
            ));
        }
        let dst_size = targets[0].read().size;
        if targets.iter().any(|t| t.read().size != dst_size) {
            return Err(ReadbackError::InvalidParameter(
                "draw attachments differ in size".into(),
            ));
        }

        let images = {
            let src = source.read();
            shading::render(pass, &TexelView::new(&src.data, src.size), dst_size)
        };
        for (target, image) in targets.iter().zip(images) {
            target.write().data = image;
        }
        Ok(())
    }

    fn read_pixels(&self, rect: Rect, format: PixelFormat, out: &mut [u8]) -> Result<()> {
        self.check_read_format(format)?;
        let storage = {
            let state = self.state.lock();
            state.check_alive()?;
            state.attachment(0)?
        };
        let pixels = read_rect(&storage.read(), rect, format)?;
        let dst = out.get_mut(..pixels.len()).ok_or_else(|| {
            ReadbackError::InvalidParameter(format!(
                "output holds {} bytes, read needs {}",
                pixels.len(),
                rect.area() * format.bytes_per_pixel()
            ))
        })?;
        dst.copy_from_slice(&pixels);
        Ok(())
    }

    fn read_pixels_to_pack_buffer(&self, rect: Rect, format: PixelFormat) -> Result<()> {
        self.check_read_format(format)?;
        let (storage, buffer) = {
            let state = self.state.lock();
            state.check_alive()?;
            (state.attachment(0)?, state.bound_pack_buffer)
        };
        let pixels = read_rect(&storage.read(), rect, format)?;

        let mut state = self.state.lock();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| ReadbackError::NotFound("no pack buffer bound".into()))?;
        *slot = Some(pixels);
        Ok(())
    }

    fn map_pack_buffer(&self, buffer: BufferId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state.check_alive()?;
        match state.buffers.get(&buffer) {
            Some(Some(pixels)) => Ok(pixels.clone()),
            Some(None) => Err(ReadbackError::NotFound(format!(
                "pack buffer {} was never written",
                buffer.0
            ))),
            None => Err(ReadbackError::NotFound(format!("pack buffer {}", buffer.0))),
        }
    }

    fn copy_tex_sub_image_2d(&self, dst_x: u32, dst_y: u32, src_rect: Rect) -> Result<()> {
        let (source, dest) = {
            let state = self.state.lock();
            state.check_alive()?;
            (state.attachment(0)?, state.storage(state.bound_texture)?)
        };
        // Staged through a copy so source and destination may alias.
        let pixels = read_rect(&source.read(), src_rect, PixelFormat::Rgba8)?;
        let dst_rect = Rect::new(dst_x, dst_y, src_rect.width, src_rect.height);
        let mut texels = dest.write();
        write_rect(&mut texels, dst_rect, &pixels)
    }

    fn flush(&self) {}

    fn signal_completion(&self, done: ReadbackCallback) {
        self.state.lock().pending.push_back(done);
    }

    fn poll(&self, _wait: bool) -> usize {
        let (ready, alive) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.pending), !state.lost)
        };
        let count = ready.len();
        for done in ready {
            done.run(alive);
        }
        count
    }

    fn insert_sync_point(&self) -> SyncPoint {
        SyncPoint(self.share.last_sync_point.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn wait_sync_point(&self, point: SyncPoint) {
        if point.is_none() {
            return;
        }
        if point.0 > self.share.last_sync_point.load(Ordering::SeqCst) {
            warn!(sync_point = point.0, "Waiting on a sync point that was never inserted");
            return;
        }
        let mut state = self.state.lock();
        state.last_waited = state.last_waited.max(point.0);
    }

    fn gen_mailbox(&self) -> Mailbox {
        Mailbox::generate()
    }

    fn produce_texture(&self, texture: TextureId, mailbox: &Mailbox) -> Result<()> {
        if mailbox.is_zero() {
            return Err(ReadbackError::InvalidParameter("cannot produce into the zero mailbox".into()));
        }
        let state = self.state.lock();
        state.check_alive()?;
        let storage = state.storage(texture)?;
        let issued_before = self.share.last_sync_point.load(Ordering::SeqCst);
        self.share.mailboxes.lock().insert(
            *mailbox,
            Produced {
                storage,
                issued_before,
            },
        );
        debug!(texture = texture.0, ?mailbox, "Produced texture");
        Ok(())
    }

    fn consume_texture(&self, texture: TextureId, mailbox: &Mailbox) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if !state.textures.contains_key(&texture) {
            return Err(ReadbackError::NotFound(format!("texture {}", texture.0)));
        }
        let produced = self
            .share
            .mailboxes
            .lock()
            .remove(mailbox)
            .ok_or_else(|| ReadbackError::NotFound(format!("{:?} was not produced", mailbox)))?;

        if state.last_waited <= produced.issued_before {
            warn!(?mailbox, "Consuming a mailbox without waiting on its producer's sync point");
        }

        let charged = state
            .textures
            .get_mut(&texture)
            .map(|slot| {
                slot.storage = Some(produced.storage);
                std::mem::take(&mut slot.charged)
            })
            .unwrap_or(0);
        state.texture_memory -= charged;
        Ok(())
    }

    fn is_context_lost(&self) -> bool {
        self.state.lock().lost
    }
}

impl SoftwareContext {
    fn check_read_format(&self, format: PixelFormat) -> Result<()> {
        let supported = match format {
            PixelFormat::Rgba8 => true,
            PixelFormat::Bgra8 => self.config.bgra_readback,
            PixelFormat::Rgb565 => self.config.rgb565_readback,
            PixelFormat::Gray8 | PixelFormat::Yuv420P => false,
        };
        if supported {
            Ok(())
        } else {
            Err(ReadbackError::UnsupportedFormat(format!("{:?} readback", format)))
        }
    }
}
