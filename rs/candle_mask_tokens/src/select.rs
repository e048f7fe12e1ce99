//! Batched, order-preserving feature selection
//!
//! For every (image, mask) pair the feature rows at the mask's true token
//! positions are gathered in their original order. All pairs are padded (or
//! truncated) to the same length: the largest true count in the whole batch.
//! Rows past a pair's own count are zero and flagged invalid.

use candle_core::{DType, Tensor};

use crate::error::{MaskTokenError, Result};

/// Output of [`select_masked_features`]
#[derive(Debug, Clone)]
pub struct MaskedFeatures {
    /// Selected rows `[B, M, K, F]`, zero past each pair's true count
    pub features: Tensor,
    /// Validity of every row `[B, M, K]` (`U8`)
    pub valid: Tensor,
    /// True count of every (image, mask) pair
    pub counts: Vec<Vec<usize>>,
    /// `K`, the largest true count in the batch
    pub max_count: usize,
}

impl MaskedFeatures {
    /// Mean of the valid rows of every mask, `[B, M, F]`; zero for empty masks.
    pub fn mean_valid(&self) -> Result<Tensor> {
        let (b, m, _, f) = self.features.dims4()?;
        let sums = self.features.sum(2)?;
        let denom: Vec<f32> = self
            .counts
            .iter()
            .flatten()
            .map(|&c| c.max(1) as f32)
            .collect();
        let denom = Tensor::from_vec(denom, (b, m, 1), self.features.device())?
            .to_dtype(self.features.dtype())?;
        Ok(sums.broadcast_div(&denom)?.reshape((b, m, f))?)
    }
}

/// True token positions of one mask row, in ascending order.
fn true_positions(row: &[f32]) -> Vec<u32> {
    row.iter()
        .enumerate()
        .filter(|&(_, &v)| v != 0.0)
        .map(|(i, _)| i as u32)
        .collect()
}

/// Select masked feature rows.
///
/// * `features` - `[B, N, F]` token features
/// * `masks` - `[B, M, N]` token masks (any dtype, non-zero is true)
pub fn select_masked_features(features: &Tensor, masks: &Tensor) -> Result<MaskedFeatures> {
    let (b, n, f) = features
        .dims3()
        .map_err(|_| MaskTokenError::shape("select_masked_features", "features [B, N, F]", features.dims()))?;
    let (mb, m, mn) = masks
        .dims3()
        .map_err(|_| MaskTokenError::shape("select_masked_features", "masks [B, M, N]", masks.dims()))?;
    if mb != b || mn != n {
        return Err(MaskTokenError::shape(
            "select_masked_features",
            format!("masks [{}, M, {}]", b, n),
            masks.dims(),
        ));
    }
    let device = features.device();

    let flags: Vec<f32> = masks.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let positions: Vec<Vec<u32>> = if n == 0 {
        vec![Vec::new(); b * m]
    } else {
        flags.chunks(n).map(true_positions).collect()
    };
    let counts: Vec<Vec<usize>> = positions
        .chunks(m.max(1))
        .take(b)
        .map(|image| image.iter().map(Vec::len).collect())
        .collect();
    let max_count = positions.iter().map(Vec::len).max().unwrap_or(0);

    tracing::debug!(batch = b, masks = m, max_count, "selecting masked features");

    if max_count == 0 {
        return Ok(MaskedFeatures {
            features: Tensor::zeros((b, m, 0, f), features.dtype(), device)?,
            valid: Tensor::zeros((b, m, 0), DType::U8, device)?,
            counts: if m == 0 { vec![Vec::new(); b] } else { counts },
            max_count,
        });
    }

    // Gather from the flattened [B * N, F] grid; padding rows point at the
    // image's first token and are zeroed by the validity mask.
    let mut index = Vec::with_capacity(b * m * max_count);
    let mut valid = Vec::with_capacity(b * m * max_count);
    for (pair, selected) in positions.iter().enumerate() {
        let offset = ((pair / m) * n) as u32;
        for k in 0..max_count {
            match selected.get(k) {
                Some(&pos) => {
                    index.push(offset + pos);
                    valid.push(1u8);
                }
                None => {
                    index.push(offset);
                    valid.push(0u8);
                }
            }
        }
    }

    let index = Tensor::from_vec(index, b * m * max_count, device)?;
    let gathered = features
        .reshape((b * n, f))?
        .index_select(&index, 0)?
        .reshape((b, m, max_count, f))?;
    let valid = Tensor::from_vec(valid, (b, m, max_count), device)?;
    let features = gathered.broadcast_mul(&valid.to_dtype(features.dtype())?.unsqueeze(3)?)?;

    Ok(MaskedFeatures {
        features,
        valid,
        counts,
        max_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Features where row `t` of image `b` is `[100*b + t; f]`
    fn ramp_features(b: usize, n: usize, f: usize) -> Tensor {
        let data: Vec<f32> = (0..b)
            .flat_map(|bi| (0..n).flat_map(move |t| std::iter::repeat((100 * bi + t) as f32).take(f)))
            .collect();
        Tensor::from_vec(data, (b, n, f), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_order_preserving_selection() {
        let features = ramp_features(1, 6, 2);
        let masks = Tensor::from_vec(
            vec![0u8, 1, 0, 1, 1, 0, /* mask 1 */ 1, 0, 0, 0, 0, 0],
            (1, 2, 6),
            &Device::Cpu,
        )
        .unwrap();

        let out = select_masked_features(&features, &masks).unwrap();
        assert_eq!(out.max_count, 3);
        assert_eq!(out.counts, vec![vec![3, 1]]);
        assert_eq!(out.features.dims(), &[1, 2, 3, 2]);

        let rows: Vec<Vec<Vec<f32>>> = out.features.squeeze(0).unwrap().to_vec3().unwrap();
        assert_eq!(rows[0], vec![vec![1.0, 1.0], vec![3.0, 3.0], vec![4.0, 4.0]]);
        assert_eq!(rows[1], vec![vec![0.0, 0.0], vec![0.0, 0.0], vec![0.0, 0.0]]);

        let valid: Vec<Vec<u8>> = out.valid.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(valid, vec![vec![1, 1, 1], vec![1, 0, 0]]);
    }

    #[test]
    fn test_batch_offsets() {
        let features = ramp_features(2, 4, 1);
        let masks = Tensor::from_vec(
            vec![1u8, 0, 0, 0, /* image 1 */ 0, 0, 1, 1],
            (2, 1, 4),
            &Device::Cpu,
        )
        .unwrap();
        let out = select_masked_features(&features, &masks).unwrap();
        let rows: Vec<f32> = out.features.flatten_all().unwrap().to_vec1().unwrap();
        // image 0 keeps token 0 then a padding row; image 1 keeps tokens 2 and 3
        assert_eq!(rows, vec![0.0, 0.0, 102.0, 103.0]);
    }

    #[test]
    fn test_padding_slots_yield_zero_rows() {
        let features = ramp_features(1, 4, 3);
        let masks = Tensor::from_vec(vec![1u8, 1, 1, 1, 0, 0, 0, 0], (1, 2, 4), &Device::Cpu).unwrap();
        let out = select_masked_features(&features, &masks).unwrap();
        let padding_slot: f32 = out
            .features
            .get(0)
            .unwrap()
            .get(1)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(padding_slot, 0.0);
        assert_eq!(out.counts[0][1], 0);
    }

    #[test]
    fn test_all_false_batch() {
        let features = ramp_features(2, 4, 3);
        let masks = Tensor::zeros((2, 3, 4), DType::U8, &Device::Cpu).unwrap();
        let out = select_masked_features(&features, &masks).unwrap();
        assert_eq!(out.max_count, 0);
        assert_eq!(out.features.dims(), &[2, 3, 0, 3]);
    }

    #[test]
    fn test_mean_valid_ignores_padding_rows() {
        let features = ramp_features(1, 4, 1);
        let masks = Tensor::from_vec(vec![1u8, 1, 1, 1, 0, 1, 0, 0], (1, 2, 4), &Device::Cpu).unwrap();
        let out = select_masked_features(&features, &masks).unwrap();
        let means: Vec<f32> = out.mean_valid().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(means, vec![1.5, 1.0]);
    }

    #[test]
    fn test_token_count_mismatch() {
        let features = ramp_features(1, 4, 1);
        let masks = Tensor::zeros((1, 1, 5), DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            select_masked_features(&features, &masks),
            Err(MaskTokenError::ShapeMismatch { .. })
        ));
    }
}
