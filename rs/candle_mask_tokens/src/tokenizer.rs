//! Mask tokenizer
//!
//! Ties a vision tower to one of the three tokenization strategies:
//!
//! - batched: pad masks, rasterize, select in order up to the batch-wide
//!   maximum count, then prepend the boundary token to every segment
//! - per-mask: ragged selection composed by a [`CompositionPolicy`]
//! - ROI: one projected token per mask from region pooling
//!
//! [`CompositionPolicy`]: crate::policy::CompositionPolicy

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::ablation::ablation_masks;
use crate::boundary::BoundaryToken;
use crate::compose::MaskComposer;
use crate::config::MaskTokenizerConfig;
pub use crate::config::Strategy;
use crate::encoder::VisionTower;
use crate::error::{MaskTokenError, Result};
use crate::padding::pad_mask_batch;
use crate::rasterize::MaskRasterizer;
use crate::roi::{RoiTokenizer, RoiTokens};
use crate::select::select_masked_features;

/// Tokens for a batch of images
#[derive(Debug, Clone)]
pub struct TokenBatch {
    /// `[B, S, F]` token sequences, right-padded with zero rows
    pub tokens: Tensor,
    /// Valid length of every sequence
    pub lengths: Vec<usize>,
    /// Largest selected count of the batched strategy
    pub max_count: Option<usize>,
    /// Region outputs of the ROI strategy
    pub roi: Option<RoiTokens>,
}

/// A vision tower followed by mask-conditioned tokenization
pub struct MaskTokenizer<E> {
    config: MaskTokenizerConfig,
    encoder: E,
    rasterizer: MaskRasterizer,
    boundary: BoundaryToken,
    composer: MaskComposer,
    roi: Option<RoiTokenizer>,
}

impl<E: VisionTower> MaskTokenizer<E> {
    /// Load the boundary token and, for the ROI strategy, the projector.
    pub fn load(vb: VarBuilder, config: MaskTokenizerConfig, encoder: E) -> Result<Self> {
        let boundary = BoundaryToken::load(vb.clone(), config.hidden_size)?;
        let roi = match config.strategy {
            Strategy::Roi => Some(RoiTokenizer::load(vb, &config)?),
            Strategy::Batched | Strategy::PerMask => None,
        };
        Self::new(config, encoder, boundary, roi)
    }

    pub fn new(
        config: MaskTokenizerConfig,
        encoder: E,
        boundary: BoundaryToken,
        roi: Option<RoiTokenizer>,
    ) -> Result<Self> {
        config.validate()?;
        if encoder.hidden_size() != config.hidden_size || boundary.dim() != config.hidden_size {
            return Err(MaskTokenError::InvalidConfig(format!(
                "hidden_size {} does not match encoder width {} and boundary width {}",
                config.hidden_size,
                encoder.hidden_size(),
                boundary.dim()
            )));
        }
        if config.strategy == Strategy::Roi && roi.is_none() {
            return Err(MaskTokenError::InvalidConfig(
                "the roi strategy needs a projector".to_string(),
            ));
        }
        let rasterizer = MaskRasterizer::new(config.num_tokens(), config.raster_threshold);
        let composer = MaskComposer::new(rasterizer, config.policy, boundary.clone())
            .with_mask_source(config.mask_source);
        Ok(Self {
            config,
            encoder,
            rasterizer,
            boundary,
            composer,
            roi,
        })
    }

    pub fn config(&self) -> &MaskTokenizerConfig {
        &self.config
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Encode `images` `[B, C, H, W]` and tokenize them with one mask stack per image.
    pub fn tokenize(&self, images: &Tensor, masks: &[Tensor]) -> Result<TokenBatch> {
        let (b, _, h, w) = images
            .dims4()
            .map_err(|_| MaskTokenError::shape("MaskTokenizer::tokenize", "[B, C, H, W]", images.dims()))?;
        if b != masks.len() {
            return Err(MaskTokenError::BatchSizeMismatch {
                images: b,
                masks: masks.len(),
            });
        }
        let features = self.encoder.encode(images)?;
        self.tokenize_features(&features, masks, (h, w))
    }

    /// Tokenize precomputed features `[B, N, F]` of images sized `image_hw`.
    pub fn tokenize_features(
        &self,
        features: &Tensor,
        masks: &[Tensor],
        image_hw: (usize, usize),
    ) -> Result<TokenBatch> {
        let (b, n, _) = features
            .dims3()
            .map_err(|_| MaskTokenError::shape("MaskTokenizer::tokenize_features", "[B, N, F]", features.dims()))?;
        if b != masks.len() {
            return Err(MaskTokenError::BatchSizeMismatch {
                images: b,
                masks: masks.len(),
            });
        }
        if n != self.config.num_tokens() {
            return Err(MaskTokenError::shape(
                "MaskTokenizer::tokenize_features",
                format!("[B, {}, F]", self.config.num_tokens()),
                features.dims(),
            ));
        }

        let _span = tracing::debug_span!("tokenize", strategy = ?self.config.strategy, batch = b).entered();
        match self.config.strategy {
            Strategy::Batched => self.tokenize_batched(features, masks, image_hw),
            Strategy::PerMask => {
                let composed = self.composer.compose(features, masks)?;
                Ok(TokenBatch {
                    tokens: composed.tokens,
                    lengths: composed.lengths,
                    max_count: None,
                    roi: None,
                })
            }
            Strategy::Roi => {
                let roi = self.roi.as_ref().ok_or_else(|| {
                    MaskTokenError::InvalidConfig("the roi strategy needs a projector".to_string())
                })?;
                let out = roi.forward(features, masks, image_hw)?;
                let (_, m, _) = out.embeds.dims3()?;
                Ok(TokenBatch {
                    tokens: out.embeds.clone(),
                    lengths: vec![m; b],
                    max_count: None,
                    roi: Some(out),
                })
            }
        }
    }

    fn tokenize_batched(
        &self,
        features: &Tensor,
        masks: &[Tensor],
        image_hw: (usize, usize),
    ) -> Result<TokenBatch> {
        let device = features.device();
        let b = masks.len();
        let token_masks = match ablation_masks(self.config.mask_source, self.config.num_tokens(), device)? {
            Some(pattern) => Tensor::stack(&vec![pattern; b], 0)?,
            None => {
                let padded = pad_mask_batch(masks, image_hw, device)?;
                self.rasterizer.rasterize_batch(&padded.masks)?
            }
        };
        let selected = select_masked_features(features, &token_masks)?;
        let tokens = self.boundary.insert(&selected.features)?;
        let (_, s, _) = tokens.dims3()?;

        tracing::debug!(max_count = selected.max_count, sequence = s, "batched tokens");

        Ok(TokenBatch {
            tokens,
            lengths: vec![s; b],
            max_count: Some(selected.max_count),
            roi: None,
        })
    }
}
