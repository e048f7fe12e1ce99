//! Vision tower interface
//!
//! The tokenizer only needs a per-token feature grid. Any encoder producing
//! `[B, N, F]` from `[B, C, H, W]` images can stand behind [`VisionTower`].

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::config::MaskTokenizerConfig;
use crate::error::{MaskTokenError, Result};

/// An image encoder producing one feature vector per patch token.
pub trait VisionTower {
    /// `[B, C, H, W]` images to `[B, N, F]` token features
    fn encode(&self, images: &Tensor) -> Result<Tensor>;

    /// Feature width `F`
    fn hidden_size(&self) -> usize;
}

/// Patch embedding stem: a strided convolution with kernel = stride = patch size
pub struct PatchEmbedEncoder {
    projection: Conv2d,
    hidden_size: usize,
    patch_size: usize,
}

impl PatchEmbedEncoder {
    /// Weight path: patch_embeddings.projection.{weight,bias}
    pub fn load(vb: VarBuilder, config: &MaskTokenizerConfig) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let projection = candle_nn::conv2d(
            config.num_channels,
            config.hidden_size,
            config.patch_size,
            conv_config,
            vb.pp("patch_embeddings").pp("projection"),
        )?;
        Ok(Self {
            projection,
            hidden_size: config.hidden_size,
            patch_size: config.patch_size,
        })
    }
}

impl VisionTower for PatchEmbedEncoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = images
            .dims4()
            .map_err(|_| MaskTokenError::shape("PatchEmbedEncoder::encode", "[B, C, H, W]", images.dims()))?;
        if h < self.patch_size || w < self.patch_size {
            return Err(MaskTokenError::shape(
                "PatchEmbedEncoder::encode",
                format!("images of at least {0}x{0}", self.patch_size),
                images.dims(),
            ));
        }
        // [B, F, h_patches, w_patches] -> [B, F, N] -> [B, N, F]
        let embeddings = self.projection.forward(images)?;
        let embeddings = embeddings.flatten_from(2)?;
        Ok(embeddings.transpose(1, 2)?.contiguous()?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_patch_grid_shape() {
        let config = MaskTokenizerConfig {
            image_size: 28,
            patch_size: 14,
            hidden_size: 8,
            ..MaskTokenizerConfig::clip_vit_l_224()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = PatchEmbedEncoder::load(vb, &config).unwrap();

        let images = Tensor::zeros((2, 3, 28, 28), DType::F32, &Device::Cpu).unwrap();
        let features = encoder.encode(&images).unwrap();
        assert_eq!(features.dims(), &[2, config.num_tokens(), 8]);
        assert_eq!(encoder.hidden_size(), 8);
    }

    #[test]
    fn test_rejects_images_smaller_than_a_patch() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = PatchEmbedEncoder::load(vb, &MaskTokenizerConfig::default()).unwrap();
        let images = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(encoder.encode(&images).is_err());
    }
}
