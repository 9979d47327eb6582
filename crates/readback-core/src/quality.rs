//! Scaler quality tiers.

use serde::{Deserialize, Serialize};

/// Trade-off between scaling cost and filtering fidelity.
///
/// Numeric values are ordered so that comparison reflects quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScalerQuality {
    /// Bilinear single pass, fastest possible.
    Fast = 1,
    /// Bilinear 50% reductions followed by one final bilinear pass.
    /// Nearly as good as `Best` at a fraction of the cost.
    #[default]
    Good = 2,
    /// Separable bicubic 50% reductions. 2-8x slower than `Good`.
    Best = 3,
}

impl ScalerQuality {
    /// All tiers from lowest to highest.
    pub const ALL: [ScalerQuality; 3] = [Self::Fast, Self::Good, Self::Best];

    /// The next lower tier, or `None` at `Fast`.
    pub fn lower(self) -> Option<Self> {
        match self {
            Self::Best => Some(Self::Good),
            Self::Good => Some(Self::Fast),
            Self::Fast => None,
        }
    }

    /// Tiers to attempt, starting at `self` and only ever going down.
    pub fn fallback_chain(self) -> impl Iterator<Item = Self> {
        std::iter::successors(Some(self), |q| q.lower())
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Fast),
            2 => Some(Self::Good),
            3 => Some(Self::Best),
            _ => None,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Good => "good",
            Self::Best => "best",
        }
    }
}
