//! Ragged batch padding
//!
//! Each image carries its own number of masks at its own resolution. The
//! padder brings all of them to the image resolution and appends all-zero
//! masks so every image holds the same count `M`, the batch maximum.

use candle_core::{DType, Device, Tensor};

use crate::error::{MaskTokenError, Result};
use crate::resize::adjust_spatial;

/// Dense mask batch with the real mask count of every image
#[derive(Debug, Clone)]
pub struct PaddedMaskBatch {
    /// Masks `[B, M, H, W]` in `F32`, trailing padding slots all zero
    pub masks: Tensor,
    /// Number of real (non-padding) masks per image
    pub mask_counts: Vec<usize>,
}

impl PaddedMaskBatch {
    /// Mask slots per image
    pub fn max_masks(&self) -> usize {
        self.mask_counts.iter().copied().max().unwrap_or(0)
    }

    /// `[B, M]` indicator, 1 for real masks and 0 for padding slots (`U8`)
    pub fn slot_mask(&self) -> Result<Tensor> {
        let m = self.max_masks();
        let data: Vec<u8> = self
            .mask_counts
            .iter()
            .flat_map(|&count| (0..m).map(move |slot| (slot < count) as u8))
            .collect();
        Ok(Tensor::from_vec(
            data,
            (self.mask_counts.len(), m),
            self.masks.device(),
        )?)
    }
}

/// Pad per-image mask stacks `[M_i, H_i, W_i]` to `[B, M, target_h, target_w]`.
///
/// Masks keep their order; images with fewer than `M` masks get all-zero masks
/// appended.
pub fn pad_mask_batch(
    masks: &[Tensor],
    target_hw: (usize, usize),
    device: &Device,
) -> Result<PaddedMaskBatch> {
    let (target_h, target_w) = target_hw;
    let mut mask_counts = Vec::with_capacity(masks.len());
    for image_masks in masks {
        let (m, _, _) = image_masks
            .dims3()
            .map_err(|_| MaskTokenError::shape("pad_mask_batch", "[M, H, W]", image_masks.dims()))?;
        mask_counts.push(m);
    }
    let max_masks = mask_counts.iter().copied().max().unwrap_or(0);

    if max_masks == 0 {
        return Ok(PaddedMaskBatch {
            masks: Tensor::zeros((masks.len(), 0, target_h, target_w), DType::F32, device)?,
            mask_counts,
        });
    }

    let padded = masks
        .iter()
        .zip(&mask_counts)
        .map(|(image_masks, &count)| {
            if count == 0 {
                return Ok(Tensor::zeros(
                    (max_masks, target_h, target_w),
                    DType::F32,
                    device,
                )?);
            }
            let resized = adjust_spatial(&image_masks.to_device(device)?, target_h, target_w)?;
            Ok(resized.pad_with_zeros(0, 0, max_masks - count)?)
        })
        .collect::<Result<Vec<_>>>()?;
    let masks = Tensor::stack(&padded, 0)?;

    tracing::debug!(
        batch = mask_counts.len(),
        max_masks,
        target_h,
        target_w,
        "padded mask batch"
    );

    Ok(PaddedMaskBatch {
        masks,
        mask_counts,
    })
}
