//! ROI tokenization
//!
//! One token per mask. The feature grid is upsampled to the image resolution,
//! every mask gets a tight box, and both the features and the mask are pooled
//! inside that box at a fixed resolution. The mask-weighted average of the
//! pooled features, the pooled mask and the box are concatenated and projected
//! to the language model width.

mod align;
mod boxes;

pub use align::{binarize, roi_align, roi_align_batch, roi_align_maps, RoiAlignConfig};
pub use boxes::{boxes_to_tensor, roi_boxes_from_masks, tight_box, RoiBox};

use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::config::MaskTokenizerConfig;
use crate::error::{MaskTokenError, Result};
use crate::padding::pad_mask_batch;

/// Lower bound of the pooled mask area in the weighted average
const MIN_MASK_AREA: f64 = 1e-6;

/// Output of [`RoiTokenizer::forward`]
#[derive(Debug, Clone)]
pub struct RoiTokens {
    /// Projected tokens `[B, M, D]`, zero for padding masks
    pub embeds: Tensor,
    /// Mask-weighted pooled features `[B, M, F]`
    pub features: Tensor,
    /// Boxes normalized to [0, 1] by the image size, one list per image;
    /// padding masks carry the zero box
    pub boxes: Vec<Vec<RoiBox>>,
    /// Binarized pooled masks `[B, M, R, R]`
    pub masks: Tensor,
    /// `[B, M]` indicator of real (non-padding) masks (`U8`)
    pub not_padding: Tensor,
    /// Number of real masks per image
    pub visual_token_counts: Vec<usize>,
}

/// Reshape `[B, N, F]` features to `[B, F, s, s]` and resample bilinearly to the image size.
pub fn upsample_feature_grid(features: &Tensor, image_hw: (usize, usize)) -> Result<Tensor> {
    let (b, n, f) = features
        .dims3()
        .map_err(|_| MaskTokenError::shape("upsample_feature_grid", "[B, N, F]", features.dims()))?;
    let side = (n as f64).sqrt().round() as usize;
    if side * side != n {
        return Err(MaskTokenError::NonSquareGrid { tokens: n });
    }
    let (h, w) = image_hw;
    let grid = features
        .reshape((b, side, side, f))?
        .permute((0, 3, 1, 2))?
        .contiguous()?;
    Ok(grid.upsample_bilinear2d(h, w, false)?)
}

/// Mask-weighted region pooling followed by the token projector
#[derive(Debug, Clone)]
pub struct RoiTokenizer {
    projector: Linear,
    resolution: usize,
}

impl RoiTokenizer {
    /// Load the projector
    ///
    /// Weight path: mm_projector.{weight,bias}
    pub fn load(vb: VarBuilder, config: &MaskTokenizerConfig) -> Result<Self> {
        let projector = linear(config.roi_input_dim(), config.projector_dim, vb.pp("mm_projector"))?;
        Ok(Self::new(projector, config.token_roi_resolution))
    }

    pub fn new(projector: Linear, resolution: usize) -> Self {
        Self {
            projector,
            resolution,
        }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    /// Pool feature maps `[B, F, H, W]` inside the tight boxes of `masks` `[B, M, H, W]`.
    ///
    /// Returns the boxes in pixel space, the binarized pooled masks
    /// `[B, M, R, R]` and the mask-weighted features `[B, M, F]`.
    pub fn pool(&self, feature_maps: &Tensor, masks: &Tensor) -> Result<(Vec<Vec<RoiBox>>, Tensor, Tensor)> {
        let (b, f, h, w) = feature_maps
            .dims4()
            .map_err(|_| MaskTokenError::shape("RoiTokenizer::pool", "features [B, F, H, W]", feature_maps.dims()))?;
        let (mb, m, mh, mw) = masks
            .dims4()
            .map_err(|_| MaskTokenError::shape("RoiTokenizer::pool", "masks [B, M, H, W]", masks.dims()))?;
        if (mb, mh, mw) != (b, h, w) {
            return Err(MaskTokenError::shape(
                "RoiTokenizer::pool",
                format!("masks [{}, M, {}, {}]", b, h, w),
                masks.dims(),
            ));
        }
        let r = self.resolution;
        let boxes = roi_boxes_from_masks(masks)?;
        if m == 0 {
            let device = feature_maps.device();
            return Ok((
                boxes,
                Tensor::zeros((b, 0, r, r), DType::F32, device)?,
                Tensor::zeros((b, 0, f), DType::F32, device)?,
            ));
        }

        let feature_config = RoiAlignConfig::new(r).with_sampling_ratio(1);
        let roi_features = roi_align_batch(&feature_maps.to_dtype(DType::F32)?, &boxes, &feature_config)?;

        // Each mask is its own single-channel map, so box k reads map k.
        let mask_rois: Vec<RoiBox> = boxes.iter().flatten().copied().collect();
        let mask_config = RoiAlignConfig::new(r).with_aligned(true);
        let mask_maps = masks.reshape((b * m, h, w))?;
        let roi_masks = binarize(&roi_align_maps(&mask_maps, &mask_rois, &mask_config)?)?;

        let weighted = roi_features.broadcast_mul(&roi_masks)?.sum((2, 3))?;
        let area = roi_masks.sum((2, 3))?.clamp(MIN_MASK_AREA, f64::INFINITY)?;
        let pooled = weighted.broadcast_div(&area)?.reshape((b, m, f))?;
        let roi_masks = roi_masks.reshape((b, m, r, r))?;

        tracing::debug!(batch = b, masks = m, resolution = r, "roi pooling");

        Ok((boxes, roi_masks, pooled))
    }

    /// Tokenize a batch.
    ///
    /// * `features` - `[B, N, F]` vision tower output, `N` a square number
    /// * `masks` - one `[M_i, H_i, W_i]` mask stack per image
    /// * `image_hw` - resolution of the preprocessed images
    pub fn forward(&self, features: &Tensor, masks: &[Tensor], image_hw: (usize, usize)) -> Result<RoiTokens> {
        let (b, _, f) = features
            .dims3()
            .map_err(|_| MaskTokenError::shape("RoiTokenizer::forward", "[B, N, F]", features.dims()))?;
        if b != masks.len() {
            return Err(MaskTokenError::BatchSizeMismatch {
                images: b,
                masks: masks.len(),
            });
        }
        let (h, w) = image_hw;
        let device = features.device();
        let dtype = features.dtype();
        let r = self.resolution;

        let feature_maps = upsample_feature_grid(features, image_hw)?;
        let padded = pad_mask_batch(masks, image_hw, device)?;
        let m = padded.max_masks();
        let (pixel_boxes, roi_masks, pooled) = self.pool(&feature_maps, &padded.masks)?;
        let boxes: Vec<Vec<RoiBox>> = pixel_boxes
            .iter()
            .map(|image| image.iter().map(|roi| roi.normalized(w, h)).collect())
            .collect();

        let not_padding: Vec<u8> = boxes
            .iter()
            .flatten()
            .map(|roi| (!roi.is_padding()) as u8)
            .collect();
        let visual_token_counts: Vec<usize> = boxes
            .iter()
            .map(|image| image.iter().filter(|roi| !roi.is_padding()).count())
            .collect();
        let not_padding = Tensor::from_vec(not_padding, (b, m), device)?;
        if m == 0 {
            let out_dim = self.projector.weight().dims()[0];
            return Ok(RoiTokens {
                embeds: Tensor::zeros((b, 0, out_dim), dtype, device)?,
                features: pooled.to_dtype(dtype)?,
                boxes,
                masks: roi_masks,
                not_padding,
                visual_token_counts,
            });
        }

        let box_embeds: Vec<f32> = boxes
            .iter()
            .flatten()
            .flat_map(|roi| roi.to_cxcywh())
            .collect();
        let box_embeds = Tensor::from_vec(box_embeds, (b, m, 4), device)?;
        let mask_embeds = roi_masks.reshape((b, m, r * r))?;
        let visual = Tensor::cat(&[&box_embeds, &mask_embeds, &pooled], 2)?.to_dtype(dtype)?;

        let embeds = self
            .projector
            .forward(&visual)?
            .broadcast_mul(&not_padding.to_dtype(dtype)?.unsqueeze(2)?)?;

        tracing::debug!(?visual_token_counts, feature_dim = f, "roi tokens");

        Ok(RoiTokens {
            embeds,
            features: pooled.to_dtype(dtype)?,
            boxes,
            masks: roi_masks,
            not_padding,
            visual_token_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tokenizer(feature_dim: usize, resolution: usize, out_dim: usize) -> (VarMap, RoiTokenizer) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let projector = linear(4 + resolution * resolution + feature_dim, out_dim, vb.pp("mm_projector")).unwrap();
        (varmap, RoiTokenizer::new(projector, resolution))
    }

    /// 2x2 token grid whose channels are constant: `[2.0, -1.0]` everywhere
    fn channel_constant_features() -> Tensor {
        Tensor::from_vec(vec![2f32, -1.0, 2.0, -1.0, 2.0, -1.0, 2.0, -1.0], (1, 4, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_full_mask_pools_grid_mean() {
        let (_varmap, tok) = tokenizer(2, 4, 3);
        let masks = Tensor::ones((1, 8, 8), DType::U8, &Device::Cpu).unwrap();
        let out = tok.forward(&channel_constant_features(), &[masks], (8, 8)).unwrap();

        assert_eq!(out.boxes[0][0].bbox, [0.0, 0.0, 0.875, 0.875]);
        let pooled: Vec<f32> = out.features.flatten_all().unwrap().to_vec1().unwrap();
        assert!((pooled[0] - 2.0).abs() < 1e-5);
        assert!((pooled[1] + 1.0).abs() < 1e-5);
        assert_eq!(out.visual_token_counts, vec![1]);
        assert_eq!(out.embeds.dims(), &[1, 1, 3]);
    }

    #[test]
    fn test_all_false_mask_is_padding() {
        let (_varmap, tok) = tokenizer(2, 4, 3);
        let mut data = vec![1u8; 8 * 8];
        data.extend(vec![0u8; 8 * 8]);
        let masks = Tensor::from_vec(data, (2, 8, 8), &Device::Cpu).unwrap();
        let out = tok.forward(&channel_constant_features(), &[masks], (8, 8)).unwrap();

        assert!(out.boxes[0][1].is_padding());
        let mask_sum: f32 = out.masks.get(0).unwrap().get(1).unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(mask_sum, 0.0);
        let pooled: Vec<Vec<f32>> = out.features.get(0).unwrap().to_vec2().unwrap();
        assert_eq!(pooled[1], vec![0.0, 0.0]);
        let not_padding: Vec<Vec<u8>> = out.not_padding.to_vec2().unwrap();
        assert_eq!(not_padding, vec![vec![1, 0]]);
        let embeds: Vec<Vec<f32>> = out.embeds.get(0).unwrap().to_vec2().unwrap();
        assert_eq!(embeds[1], vec![0.0; 3]);
    }

    #[test]
    fn test_ragged_batch_counts() {
        let (_varmap, tok) = tokenizer(2, 2, 3);
        let features = Tensor::cat(&[channel_constant_features(), channel_constant_features()], 0).unwrap();
        let a = Tensor::ones((1, 4, 4), DType::U8, &Device::Cpu).unwrap();
        let b = Tensor::ones((3, 4, 4), DType::U8, &Device::Cpu).unwrap();
        let out = tok.forward(&features, &[a, b], (4, 4)).unwrap();
        assert_eq!(out.embeds.dims(), &[2, 3, 3]);
        assert_eq!(out.visual_token_counts, vec![1, 3]);
    }

    #[test]
    fn test_boxes_are_normalized_by_image_size() {
        let (_varmap, tok) = tokenizer(2, 2, 3);
        // true pixels span rows 2..=3 and columns 1..=5 of a 4x8 image
        let mut data = vec![0u8; 4 * 8];
        for y in 2..4 {
            for x in 1..6 {
                data[y * 8 + x] = 1;
            }
        }
        let masks = Tensor::from_vec(data, (1, 4, 8), &Device::Cpu).unwrap();
        let features = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let out = tok.forward(&features, &[masks], (4, 8)).unwrap();
        let roi = out.boxes[0][0];
        let expected = [1.0 / 8.0, 2.0 / 4.0, 6.0 / 8.0, 3.0 / 4.0];
        for (got, want) in roi.bbox.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{:?}", roi);
        }
        assert!(roi.bbox.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_non_square_grid() {
        let (_varmap, tok) = tokenizer(2, 2, 3);
        let features = Tensor::zeros((1, 6, 2), DType::F32, &Device::Cpu).unwrap();
        let masks = Tensor::ones((1, 4, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            tok.forward(&features, &[masks], (4, 4)),
            Err(MaskTokenError::NonSquareGrid { tokens: 6 })
        ));
    }
}
