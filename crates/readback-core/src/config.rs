//! Pipeline configuration, persisted as JSON.

use crate::error::{ReadbackError, Result};
use crate::limits;
use crate::quality::ScalerQuality;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for the CPU backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareConfig {
    /// Texture memory budget in bytes. `None` means unlimited.
    pub max_texture_memory: Option<usize>,
    /// Whether RGB565 readback is available.
    pub rgb565_readback: bool,
    /// Whether BGRA can be read back directly. When false, the scaler
    /// swizzles channels instead.
    pub bgra_readback: bool,
    /// Number of colour attachments a single draw may write.
    pub max_draw_buffers: u32,
    /// Largest texture edge in pixels.
    pub max_texture_size: u32,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            max_texture_memory: None,
            rgb565_readback: true,
            bgra_readback: true,
            max_draw_buffers: 4,
            max_texture_size: limits::MAX_TEXTURE_SIZE,
        }
    }
}

/// Top-level configuration for the readback pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadbackConfig {
    /// Quality used when the caller does not ask for one.
    pub default_quality: ScalerQuality,
    /// Whether YUV pipelines try the multi-render-target path.
    pub use_mrt: bool,
    /// Memory budget for recycled YUV plane textures.
    pub yuv_pool_budget: usize,
    /// CPU backend settings.
    pub software: SoftwareConfig,
}

impl Default for ReadbackConfig {
    fn default() -> Self {
        Self {
            default_quality: ScalerQuality::Good,
            use_mrt: true,
            yuv_pool_budget: limits::YUV_POOL_BUDGET,
            software: SoftwareConfig::default(),
        }
    }
}

impl ReadbackConfig {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ReadbackError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Deserialize from JSON bytes. Missing fields take their defaults.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ReadbackError::Serialization(format!("Invalid config: {}", e)))
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::from_json(&data)
    }
}
