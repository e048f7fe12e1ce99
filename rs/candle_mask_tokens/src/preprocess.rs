//! Image and mask preprocessing
//!
//! Images go through the CLIP pipeline:
//! 1. Load image and convert to tensor (RGB, CHW format, values in [0, 1])
//! 2. Resize to the vision tower resolution
//! 3. Normalize using CLIP mean and std
//!
//! Masks are read from grayscale images; any non-zero pixel is true.

use std::path::Path;

use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::error::{MaskTokenError, Result};

/// CLIP normalization mean values (RGB order)
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP normalization std values (RGB order)
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1]
///
/// # Returns
/// Tensor of shape [3, H, W]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let (h, w) = (height as usize, width as usize);
    let data: Vec<f32> = img.into_raw().iter().map(|&x| x as f32 / 255.0).collect();
    // HWC -> CHW
    Ok(Tensor::from_vec(data, (h, w, 3), device)?.permute((2, 0, 1))?.contiguous()?)
}

/// Normalize a `[3, H, W]` tensor with CLIP mean and std
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let _ = tensor
        .dims3()
        .map_err(|_| MaskTokenError::shape("normalize", "[3, H, W]", tensor.dims()))?;
    let mean = Tensor::from_slice(&CLIP_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&CLIP_STD, (3, 1, 1), device)?;
    Ok(tensor.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

/// Resize a `[3, H, W]` tensor with bilinear interpolation
pub fn resize(tensor: &Tensor, target_size: (usize, usize)) -> Result<Tensor> {
    let (target_h, target_w) = target_size;
    let _ = tensor.dims3()?;
    // upsample_bilinear2d expects [N, C, H, W]
    let resized = tensor.unsqueeze(0)?.upsample_bilinear2d(target_h, target_w, false)?;
    Ok(resized.squeeze(0)?)
}

/// Load, resize and normalize an image.
///
/// Returns the `[3, resolution, resolution]` tensor and the original (height, width).
pub fn preprocess_image<P: AsRef<Path>>(
    path: P,
    resolution: usize,
    device: &Device,
) -> anyhow::Result<(Tensor, usize, usize)> {
    let img = image::open(path)?;
    let tensor = image_to_tensor(&img, device)?;
    let (_, h_orig, w_orig) = tensor.dims3()?;
    let resized = resize(&tensor, (resolution, resolution))?;
    let normalized = normalize(&resized)?;
    Ok((normalized, h_orig, w_orig))
}

/// Binary `[H, W]` (`U8`) mask from the luma channel of an image
pub fn mask_from_image(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    let data: Vec<u8> = luma.into_raw().into_iter().map(|v| (v > 0) as u8).collect();
    Ok(Tensor::from_vec(data, (height as usize, width as usize), device)?)
}

/// Load mask images into one `[M, H, W]` stack; all masks must share a size.
pub fn load_mask_stack<P: AsRef<Path>>(paths: &[P], device: &Device) -> anyhow::Result<Tensor> {
    let mut masks = Vec::with_capacity(paths.len());
    for path in paths {
        let img = image::open(path.as_ref())?;
        masks.push(mask_from_image(&img, device)?);
    }
    if let Some(first) = masks.first() {
        let dims = first.dims().to_vec();
        if let Some(other) = masks.iter().find(|m| m.dims() != dims.as_slice()) {
            anyhow::bail!("mask sizes differ: {:?} vs {:?}", dims, other.dims());
        }
    }
    if masks.is_empty() {
        anyhow::bail!("no mask images given");
    }
    Ok(Tensor::stack(&masks, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn test_normalization_values() {
        // For input 0.0: (0.0 - 0.4815) / 0.2686 ≈ -1.7923 (R channel)
        let device = Device::Cpu;
        let input = Tensor::zeros((3, 2, 2), DType::F32, &device).unwrap();
        let data: Vec<f32> = normalize(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!((data[0] - (-1.7923)).abs() < 0.01);
        assert!((data[4] - (-1.7521)).abs() < 0.01);
        assert!((data[8] - (-1.4802)).abs() < 0.01);
    }

    #[test]
    fn test_image_to_tensor_is_chw() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([255, 0, 51]));
        let t = image_to_tensor(&DynamicImage::ImageRgb8(img), &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 2, 3]);
        let v: Vec<Vec<Vec<f32>>> = t.to_vec3().unwrap();
        assert_eq!(v[0][1][2], 1.0);
        assert_eq!(v[1][1][2], 0.0);
        assert!((v[2][1][2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_resize_preserves_channels() {
        let input = Tensor::randn(0.0f32, 1.0, (3, 100, 100), &Device::Cpu).unwrap();
        assert_eq!(resize(&input, (50, 50)).unwrap().dims(), &[3, 50, 50]);
    }

    #[test]
    fn test_mask_from_image() {
        let mut img = GrayImage::new(4, 2);
        img.put_pixel(1, 0, Luma([255]));
        img.put_pixel(3, 1, Luma([7]));
        let mask = mask_from_image(&DynamicImage::ImageLuma8(img), &Device::Cpu).unwrap();
        let v: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(v, vec![vec![0, 1, 0, 0], vec![0, 0, 0, 1]]);
    }
}
