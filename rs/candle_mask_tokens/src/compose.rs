//! Per-mask feature composition
//!
//! Every mask of an image selects exactly its own feature rows; there is no
//! batch-wide truncation. The per-image sequence is then assembled according
//! to a [`CompositionPolicy`]:
//!
//! ```text
//! [global view] [marker] mask_0 [marker] mask_1 ...
//! ```
//!
//! Sequences of different length are right-padded with zero rows to the
//! longest one in the batch and their valid lengths are returned alongside.

use candle_core::{Device, Tensor};

use crate::ablation::ablation_masks;
use crate::boundary::BoundaryToken;
use crate::config::MaskSource;
use crate::error::{MaskTokenError, Result};
use crate::policy::{CompositionPolicy, GlobalView, Markers, Reduction};
use crate::rasterize::MaskRasterizer;

/// Right-padded composed sequences
#[derive(Debug, Clone)]
pub struct ComposedBatch {
    /// `[B, S, F]`, S being the longest composed sequence
    pub tokens: Tensor,
    /// Valid length of every sequence
    pub lengths: Vec<usize>,
}

impl ComposedBatch {
    /// `[B, S]` indicator of valid rows (`U8`)
    pub fn attention_mask(&self) -> Result<Tensor> {
        let (b, s, _) = self.tokens.dims3()?;
        let data: Vec<u8> = self
            .lengths
            .iter()
            .flat_map(|&len| (0..s).map(move |i| (i < len) as u8))
            .collect();
        Ok(Tensor::from_vec(data, (b, s), self.tokens.device())?)
    }
}

/// Ragged per-mask applier driven by a [`CompositionPolicy`]
#[derive(Debug, Clone)]
pub struct MaskComposer {
    rasterizer: MaskRasterizer,
    policy: CompositionPolicy,
    mask_source: MaskSource,
    boundary: BoundaryToken,
}

impl MaskComposer {
    pub fn new(rasterizer: MaskRasterizer, policy: CompositionPolicy, boundary: BoundaryToken) -> Self {
        Self {
            rasterizer,
            policy,
            mask_source: MaskSource::Segmentation,
            boundary,
        }
    }

    pub fn with_mask_source(mut self, mask_source: MaskSource) -> Self {
        self.mask_source = mask_source;
        self
    }

    pub fn policy(&self) -> &CompositionPolicy {
        &self.policy
    }

    /// Token-level masks `[C, N]` (`U8`) of one image, from ablation or rasterization.
    pub fn token_masks(&self, masks: &Tensor, device: &Device) -> Result<Tensor> {
        let num_tokens = self.rasterizer.num_tokens();
        match ablation_masks(self.mask_source, num_tokens, device)? {
            Some(masks) => Ok(masks),
            None => self.rasterizer.rasterize_stack(&masks.to_device(device)?),
        }
    }

    /// Compose the sequence of a single image.
    ///
    /// * `features` - `[N, F]` feature grid of the image
    /// * `masks` - `[C, H, W]` raw masks of the image, in order
    ///
    /// Returns `[S, F]`; `S` may be zero when every mask is dropped and no
    /// global view is requested.
    pub fn compose_image(&self, features: &Tensor, masks: &Tensor) -> Result<Tensor> {
        let (n, f) = features
            .dims2()
            .map_err(|_| MaskTokenError::shape("MaskComposer::compose_image", "features [N, F]", features.dims()))?;
        if n != self.rasterizer.num_tokens() {
            return Err(MaskTokenError::shape(
                "MaskComposer::compose_image",
                format!("features [{}, F]", self.rasterizer.num_tokens()),
                features.dims(),
            ));
        }
        let interleave = self.policy.markers == Markers::Interleave;
        if interleave && f != self.boundary.dim() {
            return Err(MaskTokenError::shape(
                "MaskComposer::compose_image",
                format!("feature width {}", self.boundary.dim()),
                features.dims(),
            ));
        }
        let device = features.device();
        let dtype = features.dtype();

        let token_masks = self.token_masks(masks, device)?;
        let (num_masks, _) = token_masks.dims2()?;
        let keep = self.policy.budget.keep(num_masks);
        let flags: Vec<Vec<u8>> = if keep == 0 {
            Vec::new()
        } else {
            token_masks.narrow(0, 0, keep)?.to_vec2()?
        };

        let mut parts = Vec::with_capacity(1 + 2 * keep);
        match self.policy.global_view {
            GlobalView::Omit => {}
            GlobalView::Full => parts.push(features.clone()),
            GlobalView::Mean => parts.push(features.mean_keepdim(0)?),
        }
        let marker = self.boundary.row(dtype, device)?;
        for row in &flags {
            let positions: Vec<u32> = row
                .iter()
                .enumerate()
                .filter(|&(_, &v)| v != 0)
                .map(|(i, _)| i as u32)
                .collect();
            let selected = if positions.is_empty() {
                Tensor::zeros((0, f), dtype, device)?
            } else {
                let count = positions.len();
                features.index_select(&Tensor::from_vec(positions, count, device)?, 0)?
            };
            let segment = match self.policy.reduction {
                Reduction::Tokens => selected,
                // empty masks average to zero
                Reduction::Mean if selected.dims()[0] == 0 => Tensor::zeros((1, f), dtype, device)?,
                Reduction::Mean => selected.mean_keepdim(0)?,
            };
            if interleave {
                parts.push(marker.clone());
            }
            if segment.dims()[0] > 0 {
                parts.push(segment);
            }
        }

        tracing::trace!(masks = num_masks, kept = keep, parts = parts.len(), "composed image");

        if parts.is_empty() {
            return Ok(Tensor::zeros((0, f), dtype, device)?);
        }
        Ok(Tensor::cat(&parts, 0)?)
    }

    /// Compose every image of a batch and right-pad to the longest sequence.
    ///
    /// * `features` - `[B, N, F]`
    /// * `masks` - one `[C_i, H_i, W_i]` mask stack per image
    pub fn compose(&self, features: &Tensor, masks: &[Tensor]) -> Result<ComposedBatch> {
        let (b, _, f) = features
            .dims3()
            .map_err(|_| MaskTokenError::shape("MaskComposer::compose", "features [B, N, F]", features.dims()))?;
        if b != masks.len() {
            return Err(MaskTokenError::BatchSizeMismatch {
                images: b,
                masks: masks.len(),
            });
        }

        let sequences = masks
            .iter()
            .enumerate()
            .map(|(i, image_masks)| self.compose_image(&features.get(i)?, image_masks))
            .collect::<Result<Vec<_>>>()?;
        let lengths: Vec<usize> = sequences.iter().map(|s| s.dims()[0]).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0);

        tracing::debug!(batch = b, max_len, ?lengths, "per-mask composition");

        let device = features.device();
        let dtype = features.dtype();
        if max_len == 0 {
            return Ok(ComposedBatch {
                tokens: Tensor::zeros((b, 0, f), dtype, device)?,
                lengths,
            });
        }
        let padded = sequences
            .iter()
            .zip(&lengths)
            .map(|(seq, &len)| {
                if len == 0 {
                    Ok(Tensor::zeros((max_len, f), dtype, device)?)
                } else {
                    Ok(seq.pad_with_zeros(0, 0, max_len - len)?)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ComposedBatch {
            tokens: Tensor::stack(&padded, 0)?,
            lengths,
        })
    }
}
