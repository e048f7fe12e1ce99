//! Mask resolution adapter
//!
//! Brings a stack of masks `[C, H, W]` to a fixed `[C*, H*, W*]` layout:
//! channels are zero-padded symmetrically or truncated to the leading ones,
//! larger spatial sizes are resampled with nearest-neighbor, smaller ones are
//! zero-padded symmetrically with the odd pixel on the trailing side.
//!
//! The output is always `F32` with values in {0, 1}.

use candle_core::{DType, Tensor};

use crate::error::{MaskTokenError, Result};

/// Split `total` padding into (leading, trailing), trailing takes the odd one.
fn split_padding(total: usize) -> (usize, usize) {
    let lead = total / 2;
    (lead, total - lead)
}

/// Adjust a mask stack `[C, H, W]` to `target = (C*, H*, W*)`.
///
/// A mask stack with a zero-sized dimension yields an all-zero tensor of the
/// target shape.
pub fn adjust_mask_size(mask: &Tensor, target: (usize, usize, usize)) -> Result<Tensor> {
    let (c, h, w) = mask
        .dims3()
        .map_err(|_| MaskTokenError::shape("adjust_mask_size", "[C, H, W]", mask.dims()))?;
    let (target_c, target_h, target_w) = target;

    if c == 0 || h == 0 || w == 0 {
        return Ok(Tensor::zeros(target, DType::F32, mask.device())?);
    }

    let mask = mask.to_dtype(DType::F32)?;

    // Channel dimension
    let mask = if c < target_c {
        let (front, back) = split_padding(target_c - c);
        mask.pad_with_zeros(0, front, back)?
    } else if c > target_c {
        mask.narrow(0, 0, target_c)?
    } else {
        mask
    };

    adjust_spatial(&mask, target_h, target_w)
}

/// Adjust only the spatial dimensions of `[C, H, W]` to `(target_h, target_w)`.
///
/// If either side is larger than its target the whole mask is resampled to
/// exactly the target; otherwise smaller sides are zero-padded.
pub fn adjust_spatial(mask: &Tensor, target_h: usize, target_w: usize) -> Result<Tensor> {
    let (c, h, w) = mask
        .dims3()
        .map_err(|_| MaskTokenError::shape("adjust_spatial", "[C, H, W]", mask.dims()))?;

    if c == 0 || h == 0 || w == 0 {
        return Ok(Tensor::zeros((c, target_h, target_w), DType::F32, mask.device())?);
    }

    let mask = mask.to_dtype(DType::F32)?;

    if h > target_h || w > target_w {
        // upsample_nearest2d expects [N, C, H, W] and also handles shrinking
        let resized = mask
            .unsqueeze(0)?
            .upsample_nearest2d(target_h, target_w)?
            .squeeze(0)?;
        Ok(resized)
    } else if h < target_h || w < target_w {
        let (top, bottom) = split_padding(target_h - h);
        let (left, right) = split_padding(target_w - w);
        let padded = mask
            .pad_with_zeros(1, top, bottom)?
            .pad_with_zeros(2, left, right)?;
        Ok(padded)
    } else {
        Ok(mask)
    }
}
