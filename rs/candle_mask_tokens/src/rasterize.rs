//! Mask rasterization onto the vision tower token grid
//!
//! A mask of any shape is flattened to `P` pixels and pooled into `L` bins
//! with adaptive average pooling. The mean of each bin is scaled back to an
//! estimated count of true pixels (`mean * P / L`) and the bin is marked when
//! that count reaches the threshold. With the default threshold of 0.5 a bin
//! receiving roughly one true pixel is kept, so sparse masks survive
//! downsampling far better than with a quantile cut.
//!
//! Very sparse masks under very large ratios `P / L` can still lose regions:
//! this is an approximation, not a lossless transform.

use candle_core::{DType, Device, Tensor};

use crate::config::DEFAULT_RASTER_THRESHOLD;
use crate::error::{MaskTokenError, Result};

/// Bin boundaries of adaptive average pooling: `[floor(i*P/L), ceil((i+1)*P/L))`
fn adaptive_bin(i: usize, input_len: usize, output_len: usize) -> (usize, usize) {
    let start = (i * input_len) / output_len;
    let end = ((i + 1) * input_len).div_ceil(output_len);
    (start, end)
}

/// Rasterize flat pixel values into `output_len` boolean bins.
pub fn rasterize_values(values: &[f32], output_len: usize, threshold: f64) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Err(MaskTokenError::EmptyMask);
    }
    if output_len == 0 {
        return Err(MaskTokenError::InvalidConfig(
            "rasterization output length must be non-zero".to_string(),
        ));
    }

    let input_len = values.len();
    let bin_size = input_len as f64 / output_len as f64;

    // Prefix sums make each bin O(1)
    let mut prefix = Vec::with_capacity(input_len + 1);
    prefix.push(0f64);
    let mut acc = 0f64;
    for &v in values {
        acc += v as f64;
        prefix.push(acc);
    }

    let bins = (0..output_len)
        .map(|i| {
            let (start, end) = adaptive_bin(i, input_len, output_len);
            let mean = (prefix[end] - prefix[start]) / (end - start) as f64;
            (mean * bin_size >= threshold) as u8
        })
        .collect();
    Ok(bins)
}

/// Rasterize one mask of any shape to a `U8` vector of length `output_len`.
pub fn rasterize_mask(mask: &Tensor, output_len: usize, threshold: f64) -> Result<Tensor> {
    let values: Vec<f32> = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let bins = rasterize_values(&values, output_len, threshold)?;
    Ok(Tensor::from_vec(bins, output_len, mask.device())?)
}

/// Rasterizer bound to a token grid length and threshold
#[derive(Debug, Clone, Copy)]
pub struct MaskRasterizer {
    num_tokens: usize,
    threshold: f64,
}

impl MaskRasterizer {
    pub fn new(num_tokens: usize, threshold: f64) -> Self {
        Self {
            num_tokens,
            threshold,
        }
    }

    pub fn with_default_threshold(num_tokens: usize) -> Self {
        Self::new(num_tokens, DEFAULT_RASTER_THRESHOLD)
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Rasterize a single mask to `[num_tokens]` (`U8`).
    pub fn rasterize(&self, mask: &Tensor) -> Result<Tensor> {
        rasterize_mask(mask, self.num_tokens, self.threshold)
    }

    /// Rasterize every mask of a stack `[M, H, W]` to `[M, num_tokens]` (`U8`).
    pub fn rasterize_stack(&self, masks: &Tensor) -> Result<Tensor> {
        let (m, h, w) = masks
            .dims3()
            .map_err(|_| MaskTokenError::shape("rasterize_stack", "[M, H, W]", masks.dims()))?;
        self.rasterize_rows(masks.reshape((m, h * w))?, masks.device())
    }

    /// Rasterize a padded batch `[B, M, H, W]` to `[B, M, num_tokens]` (`U8`).
    pub fn rasterize_batch(&self, masks: &Tensor) -> Result<Tensor> {
        let (b, m, h, w) = masks
            .dims4()
            .map_err(|_| MaskTokenError::shape("rasterize_batch", "[B, M, H, W]", masks.dims()))?;
        let rows = self.rasterize_rows(masks.reshape((b * m, h * w))?, masks.device())?;
        Ok(rows.reshape((b, m, self.num_tokens))?)
    }

    fn rasterize_rows(&self, rows: Tensor, device: &Device) -> Result<Tensor> {
        let (n, pixels) = rows.dims2()?;
        if n == 0 {
            return Ok(Tensor::zeros((0, self.num_tokens), DType::U8, device)?);
        }
        if pixels == 0 {
            return Err(MaskTokenError::EmptyMask);
        }
        let values: Vec<f32> = rows.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let mut out = Vec::with_capacity(n * self.num_tokens);
        for row in values.chunks(pixels) {
            out.extend(rasterize_values(row, self.num_tokens, self.threshold)?);
        }
        Ok(Tensor::from_vec(out, (n, self.num_tokens), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_bins_cover_input() {
        // 7 pixels into 3 bins: [0,3), [2,5), [4,7)
        assert_eq!(adaptive_bin(0, 7, 3), (0, 3));
        assert_eq!(adaptive_bin(1, 7, 3), (2, 5));
        assert_eq!(adaptive_bin(2, 7, 3), (4, 7));
    }

    #[test]
    fn test_identity_when_lengths_match() {
        let pattern = vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0];
        let mask = Tensor::from_vec(pattern.clone(), (3, 3), &Device::Cpu).unwrap();
        let out: Vec<u8> = rasterize_mask(&mask, 9, 0.5).unwrap().to_vec1().unwrap();
        let expected: Vec<u8> = pattern.iter().map(|&v| v as u8).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_single_pixel_per_bin_is_kept() {
        // 16 pixels into 4 bins, exactly one true pixel per bin
        let mut values = vec![0.0f32; 16];
        for i in 0..4 {
            values[i * 4 + (i % 4)] = 1.0;
        }
        let bins = rasterize_values(&values, 4, 0.5).unwrap();
        assert_eq!(bins, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_sparse_mask_does_not_vanish() {
        // one true pixel in 576*4 pixels still marks its token
        let mut values = vec![0.0f32; 576 * 4];
        values[1000] = 1.0;
        let bins = rasterize_values(&values, 576, 0.5).unwrap();
        assert_eq!(bins.iter().map(|&b| b as usize).sum::<usize>(), 1);
        assert_eq!(bins[250], 1);
    }

    #[test]
    fn test_all_false_mask() {
        let values = vec![0.0f32; 64];
        let bins = rasterize_values(&values, 16, 0.5).unwrap();
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_mask_is_rejected() {
        let mask = Tensor::zeros((0, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            rasterize_mask(&mask, 16, 0.5),
            Err(MaskTokenError::EmptyMask)
        ));
    }

    #[test]
    fn test_rasterize_batch_shape() {
        let rasterizer = MaskRasterizer::with_default_threshold(4);
        let masks = Tensor::ones((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let out = rasterizer.rasterize_batch(&masks).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
        let total: u8 = out.flatten_all().unwrap().to_vec1::<u8>().unwrap().iter().sum();
        assert_eq!(total, 24);
    }

    #[test]
    fn test_rasterize_stack_accepts_u8() {
        let rasterizer = MaskRasterizer::with_default_threshold(2);
        let masks = Tensor::from_vec(vec![1u8, 1, 0, 0], (1, 2, 2), &Device::Cpu).unwrap();
        let out: Vec<Vec<u8>> = rasterizer.rasterize_stack(&masks).unwrap().to_vec2().unwrap();
        assert_eq!(out, vec![vec![1, 0]]);
    }
}
