//! Readback GPU - scaling, cross-context sharing and asynchronous readback
//!
//! All work goes through the `GpuContext` command-stream trait, implemented
//! by a wgpu backend and by a deterministic software backend.

pub mod context;
pub mod helper;
pub mod readback;
pub mod scaler;
pub mod scoped;
pub mod shaders;
pub mod shading;
pub mod software;
pub mod texture_pool;
pub mod wgpu_context;
pub mod yuv;

pub use context::{
    Axis, BufferId, Capabilities, DrawPass, FramebufferId, GpuContext, PassKind, SharedContext,
    TextureId,
};
pub use helper::ReadbackHelper;
pub use readback::ReadbackQueue;
pub use scaler::{create_scaler, MultiPassScaler, Scaler, ScalerStage};
pub use scoped::{ScopedBuffer, ScopedFlush, ScopedFramebuffer, ScopedTexture};
pub use software::{ShareGroup, SoftwareContext};
pub use texture_pool::TexturePool;
pub use wgpu_context::WgpuContext;
pub use yuv::{PlaneLayout, ReadbackYuv, YuvReadbackPipeline};
