//! Mask Tokenizer Configuration
//!
//! This module defines the configuration for the vision tower geometry and the
//! mask tokenization strategies, with presets for common encoder variants.

use serde::{Deserialize, Serialize};

use crate::error::{MaskTokenError, Result};
use crate::policy::{CompositionPolicy, MaskBudget};

/// Default count threshold used when rasterizing masks to the token grid
pub const DEFAULT_RASTER_THRESHOLD: f64 = 0.5;

/// Tokenization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Order-preserving selection padded to the batch-wide maximum count,
    /// followed by boundary token insertion
    #[default]
    Batched,
    /// Ragged per-mask selection with a composition policy
    PerMask,
    /// One projected vector per mask from region pooling
    Roi,
}

/// Where the token-level masks come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MaskSource {
    /// Rasterize the masks handed to the tokenizer
    #[default]
    Segmentation,
    /// Ablation: contiguous windows over the token sequence
    SlidingWindow { num_masks: usize },
    /// Ablation: one seeded random token pattern repeated `num_masks` times
    Dummy { num_masks: usize, seed: u64 },
}

/// Configuration for mask tokenization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskTokenizerConfig {
    // Vision tower geometry
    /// Input image resolution (square)
    pub image_size: usize,
    /// Patch size of the vision tower
    pub patch_size: usize,
    /// Feature dimension of the vision tower output
    pub hidden_size: usize,
    /// Number of input image channels
    pub num_channels: usize,

    // Tokenization
    /// Which pipeline produces the tokens
    pub strategy: Strategy,
    /// Minimum estimated true-pixel count for a token to be selected
    pub raster_threshold: f64,
    /// Source of token-level masks
    pub mask_source: MaskSource,
    /// Composition policy of the per-mask strategy
    pub policy: CompositionPolicy,

    // ROI tokenization
    /// Output side of region pooling
    pub token_roi_resolution: usize,
    /// Output width of the ROI projector
    pub projector_dim: usize,
}

impl Default for MaskTokenizerConfig {
    fn default() -> Self {
        Self::clip_vit_l_336()
    }
}

impl MaskTokenizerConfig {
    /// CLIP ViT-L/14 at 336px, 24x24 token grid
    pub fn clip_vit_l_336() -> Self {
        Self {
            image_size: 336,
            patch_size: 14,
            hidden_size: 1024,
            num_channels: 3,
            strategy: Strategy::Batched,
            raster_threshold: DEFAULT_RASTER_THRESHOLD,
            mask_source: MaskSource::Segmentation,
            policy: CompositionPolicy::default(),
            token_roi_resolution: 16,
            projector_dim: 4096,
        }
    }

    /// CLIP ViT-L/14 at 224px, 16x16 token grid
    pub fn clip_vit_l_224() -> Self {
        Self {
            image_size: 224,
            ..Self::clip_vit_l_336()
        }
    }

    /// SigLIP so400m/14 at 384px, 27x27 token grid
    pub fn siglip_so400m_384() -> Self {
        Self {
            image_size: 384,
            patch_size: 14,
            hidden_size: 1152,
            ..Self::clip_vit_l_336()
        }
    }

    /// Side of the square token grid
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Number of tokens produced by the vision tower per image
    pub fn num_tokens(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Input width of the ROI projector: box (4) + pooled mask (R*R) + pooled feature
    pub fn roi_input_dim(&self) -> usize {
        4 + self.token_roi_resolution * self.token_roi_resolution + self.hidden_size
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_policy(mut self, policy: CompositionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_mask_source(mut self, mask_source: MaskSource) -> Self {
        self.mask_source = mask_source;
        self
    }

    /// Check the configuration for values no pipeline can work with
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.image_size < self.patch_size {
            return Err(MaskTokenError::InvalidConfig(format!(
                "image_size {} must be at least one patch of size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.hidden_size == 0 || self.num_channels == 0 {
            return Err(MaskTokenError::InvalidConfig(
                "hidden_size and num_channels must be non-zero".to_string(),
            ));
        }
        if self.raster_threshold.is_nan() || self.raster_threshold <= 0.0 {
            return Err(MaskTokenError::InvalidConfig(format!(
                "raster_threshold must be positive, got {}",
                self.raster_threshold
            )));
        }
        if self.token_roi_resolution == 0 || self.projector_dim == 0 {
            return Err(MaskTokenError::InvalidConfig(
                "token_roi_resolution and projector_dim must be non-zero".to_string(),
            ));
        }
        if let MaskBudget::Remove(0) | MaskBudget::Limit(0) = self.policy.budget {
            return Err(MaskTokenError::InvalidConfig(
                "mask budget limit must be at least 1".to_string(),
            ));
        }
        match self.mask_source {
            MaskSource::SlidingWindow { num_masks } | MaskSource::Dummy { num_masks, .. }
                if num_masks == 0 || num_masks > self.num_tokens() =>
            {
                return Err(MaskTokenError::InvalidConfig(format!(
                    "ablation mask count {} must be in 1..={}",
                    num_masks,
                    self.num_tokens()
                )));
            }
            _ => {}
        }
        Ok(())
    }
}
