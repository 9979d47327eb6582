//! Readback Core - Foundation types for the GPU readback pipeline
//!
//! This crate provides the value types shared by every backend:
//! - Integer geometry (Size, Rect, Region)
//! - Frame buffers and pixel formats (BGRA, RGB565, planar YUV)
//! - Scaler quality tiers
//! - Cross-context mailboxes and sync points
//! - Exactly-once completion callbacks
//! - Configuration

pub mod callback;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod mailbox;
pub mod quality;

pub use callback::ReadbackCallback;
pub use config::{ReadbackConfig, SoftwareConfig};
pub use error::{ReadbackError, Result};
pub use frame::{FrameBuffer, FramePlane, PixelFormat, SharedFrame, SharedPixels};
pub use geometry::{Rect, Region, Size};
pub use mailbox::{Mailbox, SyncPoint};
pub use quality::ScalerQuality;

/// Limits shared by every backend.
pub mod limits {
    /// Default texture memory budget for the YUV plane pool.
    pub const YUV_POOL_BUDGET: usize = 64 * 1024 * 1024; // 64 MB

    /// Largest texture edge any backend is asked to allocate.
    pub const MAX_TEXTURE_SIZE: u32 = 8192;

    /// Bytes in a mailbox name.
    pub const MAILBOX_SIZE: usize = 64;

    /// Number of samples packed into one RGBA texel by planar passes.
    pub const PLANAR_PACKING: u32 = 4;
}
