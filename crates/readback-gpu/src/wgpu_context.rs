//! Hardware backend on wgpu.
//!
//! Every command is encoded and submitted as it is issued, so the queue's
//! submission order is the command order. Textures are Rgba8Unorm; BGRA
//! and RGB565 readbacks are converted on the CPU after mapping.

use crate::context::{
    BufferId, Capabilities, DrawPass, FramebufferId, GpuContext, PassKind, TextureId,
};
use crate::shaders::{self, PassParams};
use parking_lot::Mutex;
use readback_core::{
    limits, Mailbox, PixelFormat, ReadbackCallback, ReadbackError, Rect, Result, Size, SyncPoint,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Rows in buffer copies must be aligned to this many bytes.
const ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

fn padded_row(width: u32) -> u32 {
    (width * 4).div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT
}

/// A copy into a staging buffer waiting to be mapped.
struct PackRead {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Device-level state shared by every context created from it.
struct DeviceShared {
    adapter_info: wgpu::AdapterInfo,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    shader: wgpu::ShaderModule,
    pipelines: Mutex<HashMap<&'static str, Arc<wgpu::RenderPipeline>>>,
    mailboxes: Mutex<HashMap<Mailbox, Arc<wgpu::Texture>>>,
    last_sync_point: AtomicU32,
    lost: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    next_id: u32,
    textures: HashMap<TextureId, Option<Arc<wgpu::Texture>>>,
    framebuffers: HashMap<FramebufferId, Vec<TextureId>>,
    buffers: HashMap<BufferId, Option<PackRead>>,
    bound_texture: TextureId,
    bound_framebuffer: FramebufferId,
    bound_pack_buffer: BufferId,
    /// Completion signals in issue order; the flag is set by the queue.
    pending: VecDeque<(Arc<AtomicBool>, ReadbackCallback)>,
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn texture(&self, id: TextureId) -> Result<Arc<wgpu::Texture>> {
        self.textures
            .get(&id)
            .and_then(|t| t.clone())
            .ok_or_else(|| ReadbackError::NotFound(format!("texture {} has no storage", id.0)))
    }

    fn attachment(&self, index: usize) -> Result<Arc<wgpu::Texture>> {
        let texture = self
            .framebuffers
            .get(&self.bound_framebuffer)
            .ok_or_else(|| ReadbackError::NotFound("no framebuffer bound".into()))?
            .get(index)
            .copied()
            .unwrap_or(TextureId::NONE);
        self.texture(texture)
    }
}

/// `GpuContext` backed by a wgpu device and queue.
pub struct WgpuContext {
    shared: Arc<DeviceShared>,
    state: Mutex<State>,
}

impl WgpuContext {
    /// Create a new context on the best available adapter.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| ReadbackError::Gpu("No suitable GPU adapter found".to_string()))?;

        let adapter_info = adapter.get_info();
        info!("Using GPU adapter: {:?}", adapter_info);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Readback Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits {
                        max_texture_dimension_2d: limits::MAX_TEXTURE_SIZE,
                        ..wgpu::Limits::downlevel_defaults()
                    }
                    .using_resolution(adapter.limits()),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| ReadbackError::Gpu(format!("Failed to create device: {}", e)))?;

        Ok(Self::from_device(adapter_info, device, queue))
    }

    /// Create a new context (blocking version).
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    fn from_device(adapter_info: wgpu::AdapterInfo, device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            warn!(?reason, %message, "GPU device lost");
            flag.store(true, Ordering::SeqCst);
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("readback_shader"),
            source: wgpu::ShaderSource::Wgsl(shaders::READBACK_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("readback_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("readback_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let shared = DeviceShared {
            adapter_info,
            device: Arc::new(device),
            queue: Arc::new(queue),
            bind_group_layout,
            pipeline_layout,
            shader,
            pipelines: Mutex::new(HashMap::new()),
            mailboxes: Mutex::new(HashMap::new()),
            last_sync_point: AtomicU32::new(0),
            lost,
        };
        Self {
            shared: Arc::new(shared),
            state: Mutex::new(State::default()),
        }
    }

    /// A second context on the same device, sharing mailboxes.
    pub fn new_shared(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            state: Mutex::new(State::default()),
        }
    }

    /// Get adapter info.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.shared.adapter_info
    }

    fn check_alive(&self) -> Result<()> {
        if self.shared.lost.load(Ordering::SeqCst) {
            Err(ReadbackError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn get_or_create_pipeline(&self, kind: &PassKind) -> Arc<wgpu::RenderPipeline> {
        let entry = shaders::entry_point(kind);
        let mut pipelines = self.shared.pipelines.lock();
        if let Some(pipeline) = pipelines.get(entry) {
            return pipeline.clone();
        }

        let target = Some(wgpu::ColorTargetState {
            format: TEXTURE_FORMAT,
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        });
        let targets = vec![target; kind.output_count()];
        let pipeline = self
            .shared
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(entry),
                layout: Some(&self.shared.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.shared.shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &self.shared.shader,
                    entry_point: Some(entry),
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        debug!(entry, "Created render pipeline");

        let pipeline = Arc::new(pipeline);
        pipelines.insert(entry, pipeline.clone());
        pipeline
    }

    fn create_texture(&self, size: Size) -> Result<wgpu::Texture> {
        let device = &self.shared.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("readback_texture"),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        match pollster::block_on(device.pop_error_scope()) {
            Some(e) => Err(ReadbackError::OutOfMemory(format!("{} texture: {}", size, e))),
            None => Ok(texture),
        }
    }

    fn write_texture(&self, texture: &wgpu::Texture, rect: Rect, pixels: &[u8]) {
        self.shared.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(rect.width * 4),
                rows_per_image: Some(rect.height),
            },
            extent(rect.size()),
        );
    }

    /// Encode a copy of `rect` of `texture` into a new staging buffer.
    fn copy_to_staging(&self, texture: &wgpu::Texture, rect: Rect, format: PixelFormat) -> Result<PackRead> {
        let bounds = Size::new(texture.width(), texture.height());
        if !bounds.contains_rect(rect) || rect.is_empty() {
            return Err(ReadbackError::InvalidParameter(format!(
                "read rect {} outside {} surface",
                rect, bounds
            )));
        }
        let row = padded_row(rect.width);
        let buffer = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: row as u64 * rect.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(row),
                    rows_per_image: Some(rect.height),
                },
            },
            extent(rect.size()),
        );
        self.shared.queue.submit(std::iter::once(encoder.finish()));

        Ok(PackRead {
            buffer,
            width: rect.width,
            height: rect.height,
            format,
        })
    }

    /// Map a staging buffer and unpad and convert its rows.
    fn map_read(&self, read: &PackRead) -> Result<Vec<u8>> {
        let slice = read.buffer.slice(..);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.shared.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| ReadbackError::Gpu("Failed to receive buffer mapping result".into()))?
            .map_err(|e| ReadbackError::Gpu(format!("Failed to map buffer: {:?}", e)))?;

        let row = padded_row(read.width) as usize;
        let src_bytes = read.width as usize * 4;
        let dst_bytes = read.width as usize * read.format.bytes_per_pixel();
        let mut out = vec![0u8; dst_bytes * read.height as usize];
        {
            let data = slice.get_mapped_range();
            for (y, dst) in out.chunks_exact_mut(dst_bytes).enumerate() {
                let start = y * row;
                read.format.convert_row_from_rgba(&data[start..start + src_bytes], dst);
            }
        }
        read.buffer.unmap();
        Ok(out)
    }
}

fn extent(size: Size) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn check_read_format(format: PixelFormat) -> Result<()> {
    if format.is_readback_format() {
        Ok(())
    } else {
        Err(ReadbackError::UnsupportedFormat(format!("{:?} readback", format)))
    }
}

impl GpuContext for WgpuContext {
    fn capabilities(&self) -> Capabilities {
        let device_limits = self.shared.device.limits();
        Capabilities {
            max_texture_size: device_limits
                .max_texture_dimension_2d
                .min(limits::MAX_TEXTURE_SIZE),
            max_draw_buffers: device_limits.max_color_attachments,
            rgb565_readback: true,
            bgra_readback: true,
        }
    }

    fn gen_texture(&self) -> Result<TextureId> {
        self.check_alive()?;
        let mut state = self.state.lock();
        let id = TextureId(state.alloc_id());
        state.textures.insert(id, None);
        Ok(id)
    }

    fn delete_texture(&self, texture: TextureId) {
        let mut state = self.state.lock();
        state.textures.remove(&texture);
        if state.bound_texture == texture {
            state.bound_texture = TextureId::NONE;
        }
    }

    fn tex_image_2d(&self, texture: TextureId, size: Size, pixels: Option<&[u8]>) -> Result<()> {
        self.check_alive()?;
        let max = self.capabilities().max_texture_size;
        if size.is_empty() || size.width > max || size.height > max {
            return Err(ReadbackError::InvalidParameter(format!(
                "texture size {} outside 1..={}",
                size, max
            )));
        }
        if pixels.is_some_and(|p| p.len() < size.area() * 4) {
            return Err(ReadbackError::InvalidParameter(format!(
                "too few bytes for a {} texture",
                size
            )));
        }
        if !self.state.lock().textures.contains_key(&texture) {
            return Err(ReadbackError::NotFound(format!("texture {}", texture.0)));
        }

        let storage = self.create_texture(size)?;
        if let Some(pixels) = pixels {
            self.write_texture(&storage, size.to_rect(), &pixels[..size.area() * 4]);
        }
        if let Some(slot) = self.state.lock().textures.get_mut(&texture) {
            *slot = Some(Arc::new(storage));
        }
        Ok(())
    }

    fn tex_sub_image_2d(&self, texture: TextureId, rect: Rect, pixels: &[u8]) -> Result<()> {
        self.check_alive()?;
        let storage = self.state.lock().texture(texture)?;
        let bounds = Size::new(storage.width(), storage.height());
        if !bounds.contains_rect(rect) || pixels.len() < rect.area() * 4 {
            return Err(ReadbackError::InvalidParameter(format!(
                "cannot write {} into a {} texture",
                rect, bounds
            )));
        }
        if !rect.is_empty() {
            self.write_texture(&storage, rect, &pixels[..rect.area() * 4]);
        }
        Ok(())
    }

    fn texture_size(&self, texture: TextureId) -> Option<Size> {
        let storage = self.state.lock().texture(texture).ok()?;
        Some(Size::new(storage.width(), storage.height()))
    }

    fn gen_framebuffer(&self) -> Result<FramebufferId> {
        self.check_alive()?;
        let mut state = self.state.lock();
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
        if attachment >= self.capabilities().max_draw_buffers as usize {
            return Err(ReadbackError::InvalidParameter(format!(
                "attachment {} beyond the draw buffer limit",
                attachment
            )));
        }
        let mut state = self.state.lock();
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
        self.check_alive()?;
        let mut state = self.state.lock();
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
        self.check_alive()?;
        let (source, targets) = {
            let state = self.state.lock();
            let source = state.texture(state.bound_texture)?;
            let targets = (0..pass.kind.output_count())
                .map(|i| state.attachment(i))
                .collect::<Result<Vec<_>>>()?;
            (source, targets)
        };
        if targets.iter().any(|t| Arc::ptr_eq(t, &source)) {
            return Err(ReadbackError::InvalidParameter(
                "draw samples the texture it renders to".into(),
            ));
        }
        let dst = [targets[0].width(), targets[0].height()];
        if targets.iter().any(|t| [t.width(), t.height()] != dst) {
            return Err(ReadbackError::InvalidParameter(
                "draw attachments differ in size".into(),
            ));
        }

        let device = &self.shared.device;
        let params = PassParams::new(pass, [source.width(), source.height()], dst);
        let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("pass_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let source_view = source.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pass_bind_group"),
            layout: &self.shared.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: uniform.as_entire_binding(),
                },
            ],
        });

        let views: Vec<wgpu::TextureView> = targets
            .iter()
            .map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();
        let attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        let pipeline = self.get_or_create_pipeline(&pass.kind);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(shaders::entry_point(&pass.kind)),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("readback_pass"),
                color_attachments: &attachments,
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(&pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.shared.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&self, rect: Rect, format: PixelFormat, out: &mut [u8]) -> Result<()> {
        self.check_alive()?;
        check_read_format(format)?;
        let needed = rect.area() * format.bytes_per_pixel();
        if out.len() < needed {
            return Err(ReadbackError::InvalidParameter(format!(
                "output holds {} bytes, read needs {}",
                out.len(),
                needed
            )));
        }
        let source = self.state.lock().attachment(0)?;
        let read = self.copy_to_staging(&source, rect, format)?;
        let pixels = self.map_read(&read)?;
        out[..needed].copy_from_slice(&pixels);
        Ok(())
    }

    fn read_pixels_to_pack_buffer(&self, rect: Rect, format: PixelFormat) -> Result<()> {
        self.check_alive()?;
        check_read_format(format)?;
        let (source, buffer) = {
            let state = self.state.lock();
            (state.attachment(0)?, state.bound_pack_buffer)
        };
        let read = self.copy_to_staging(&source, rect, format)?;
        let mut state = self.state.lock();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| ReadbackError::NotFound("no pack buffer bound".into()))?;
        *slot = Some(read);
        Ok(())
    }

    fn map_pack_buffer(&self, buffer: BufferId) -> Result<Vec<u8>> {
        self.check_alive()?;
        let read = self
            .state
            .lock()
            .buffers
            .get_mut(&buffer)
            .and_then(Option::take)
            .ok_or_else(|| ReadbackError::NotFound(format!("pack buffer {} holds no read", buffer.0)))?;
        self.map_read(&read)
    }

    fn copy_tex_sub_image_2d(&self, dst_x: u32, dst_y: u32, src_rect: Rect) -> Result<()> {
        self.check_alive()?;
        let (source, dest) = {
            let state = self.state.lock();
            (state.attachment(0)?, state.texture(state.bound_texture)?)
        };
        let src_bounds = Size::new(source.width(), source.height());
        let dst_rect = Rect::new(dst_x, dst_y, src_rect.width, src_rect.height);
        let dst_bounds = Size::new(dest.width(), dest.height());
        if !src_bounds.contains_rect(src_rect) || !dst_bounds.contains_rect(dst_rect) {
            return Err(ReadbackError::InvalidParameter(format!(
                "cannot copy {} to {}",
                src_rect, dst_rect
            )));
        }
        if src_rect.is_empty() {
            return Ok(());
        }

        let copy = |encoder: &mut wgpu::CommandEncoder,
                    from: &wgpu::Texture,
                    from_origin: (u32, u32),
                    to: &wgpu::Texture,
                    to_origin: (u32, u32)| {
            encoder.copy_texture_to_texture(
                wgpu::ImageCopyTexture {
                    texture: from,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: from_origin.0,
                        y: from_origin.1,
                        z: 0,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyTexture {
                    texture: to,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: to_origin.0,
                        y: to_origin.1,
                        z: 0,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                extent(src_rect.size()),
            );
        };

        let mut encoder = self
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("copy_tex_sub_image"),
            });
        if Arc::ptr_eq(&source, &dest) {
            // Same texture: stage through a temporary.
            let staging = self.create_texture(src_rect.size())?;
            copy(&mut encoder, &source, (src_rect.x, src_rect.y), &staging, (0, 0));
            copy(&mut encoder, &staging, (0, 0), &dest, (dst_x, dst_y));
        } else {
            copy(&mut encoder, &source, (src_rect.x, src_rect.y), &dest, (dst_x, dst_y));
        }
        self.shared.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    // Every command is submitted as it is issued.
    fn flush(&self) {}

    fn signal_completion(&self, done: ReadbackCallback) {
        let flag = Arc::new(AtomicBool::new(false));
        let signal = flag.clone();
        self.shared
            .queue
            .on_submitted_work_done(move || signal.store(true, Ordering::SeqCst));
        self.state.lock().pending.push_back((flag, done));
    }

    fn poll(&self, wait: bool) -> usize {
        let maintain = if wait {
            wgpu::Maintain::Wait
        } else {
            wgpu::Maintain::Poll
        };
        let _ = self.shared.device.poll(maintain);

        let lost = self.shared.lost.load(Ordering::SeqCst);
        let ready: Vec<ReadbackCallback> = {
            let mut state = self.state.lock();
            let mut ready = Vec::new();
            while state
                .pending
                .front()
                .is_some_and(|(flag, _)| lost || flag.load(Ordering::SeqCst))
            {
                if let Some((_, done)) = state.pending.pop_front() {
                    ready.push(done);
                }
            }
            ready
        };
        let count = ready.len();
        for done in ready {
            done.run(!lost);
        }
        count
    }

    fn insert_sync_point(&self) -> SyncPoint {
        SyncPoint(self.shared.last_sync_point.fetch_add(1, Ordering::SeqCst) + 1)
    }

    // One queue serves every context on the device, so stream order already
    // covers cross-context waits.
    fn wait_sync_point(&self, point: SyncPoint) {
        if point.0 > self.shared.last_sync_point.load(Ordering::SeqCst) {
            warn!(sync_point = point.0, "Waiting on a sync point that was never inserted");
        }
    }

    fn gen_mailbox(&self) -> Mailbox {
        Mailbox::generate()
    }

    fn produce_texture(&self, texture: TextureId, mailbox: &Mailbox) -> Result<()> {
        if mailbox.is_zero() {
            return Err(ReadbackError::InvalidParameter("cannot produce into the zero mailbox".into()));
        }
        let storage = self.state.lock().texture(texture)?;
        self.shared.mailboxes.lock().insert(*mailbox, storage);
        Ok(())
    }

    fn consume_texture(&self, texture: TextureId, mailbox: &Mailbox) -> Result<()> {
        let mut state = self.state.lock();
        if !state.textures.contains_key(&texture) {
            return Err(ReadbackError::NotFound(format!("texture {}", texture.0)));
        }
        let storage = self
            .shared
            .mailboxes
            .lock()
            .remove(mailbox)
            .ok_or_else(|| ReadbackError::NotFound(format!("{:?} was not produced", mailbox)))?;
        state.textures.insert(texture, Some(storage));
        Ok(())
    }

    fn is_context_lost(&self) -> bool {
        self.shared.lost.load(Ordering::SeqCst)
    }
}
