//! Synthetic token masks for ablation runs.
//!
//! These replace the rasterized segmentation masks so the effect of the
//! segmentation itself can be measured.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::MaskSource;
use crate::error::{MaskTokenError, Result};

fn check_counts(num_tokens: usize, num_masks: usize) -> Result<()> {
    if num_masks == 0 || num_masks > num_tokens {
        return Err(MaskTokenError::InvalidConfig(format!(
            "cannot build {} ablation masks over {} tokens",
            num_masks, num_tokens
        )));
    }
    Ok(())
}

/// Contiguous windows over the token sequence, `[num_masks, num_tokens]` (`U8`).
///
/// Each window spans `num_tokens / num_masks` tokens; the last one also takes
/// the remainder.
pub fn sliding_window_masks(num_tokens: usize, num_masks: usize, device: &Device) -> Result<Tensor> {
    check_counts(num_tokens, num_masks)?;
    let window = num_tokens / num_masks;
    let mut data = vec![0u8; num_masks * num_tokens];
    for (i, row) in data.chunks_mut(num_tokens).enumerate() {
        let start = i * window;
        let end = if i + 1 < num_masks {
            (i + 1) * window
        } else {
            num_tokens
        };
        row[start..end].fill(1);
    }
    Ok(Tensor::from_vec(data, (num_masks, num_tokens), device)?)
}

/// One seeded random token pattern repeated for every mask, `[num_masks, num_tokens]` (`U8`).
pub fn dummy_masks(num_tokens: usize, num_masks: usize, seed: u64, device: &Device) -> Result<Tensor> {
    check_counts(num_tokens, num_masks)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let pattern: Vec<u8> = (0..num_tokens).map(|_| rng.gen_bool(0.5) as u8).collect();
    let data = pattern.repeat(num_masks);
    Ok(Tensor::from_vec(data, (num_masks, num_tokens), device)?)
}

/// Ablation masks for one image, or `None` when real segmentation is used.
pub fn ablation_masks(source: MaskSource, num_tokens: usize, device: &Device) -> Result<Option<Tensor>> {
    match source {
        MaskSource::Segmentation => Ok(None),
        MaskSource::SlidingWindow { num_masks } => {
            sliding_window_masks(num_tokens, num_masks, device).map(Some)
        }
        MaskSource::Dummy { num_masks, seed } => {
            dummy_masks(num_tokens, num_masks, seed, device).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_windows_partition_tokens() {
        let masks = sliding_window_masks(576, 10, &Device::Cpu).unwrap();
        let rows: Vec<Vec<u8>> = masks.to_vec2().unwrap();

        let counts: Vec<usize> = rows
            .iter()
            .map(|r| r.iter().map(|&v| v as usize).sum())
            .collect();
        assert_eq!(&counts[..9], &[57; 9]);
        assert_eq!(counts[9], 576 - 9 * 57);

        // every token is covered exactly once
        for t in 0..576 {
            assert_eq!(rows.iter().map(|r| r[t] as usize).sum::<usize>(), 1);
        }
    }

    #[test]
    fn test_dummy_masks_are_deterministic_and_identical() {
        let a: Vec<Vec<u8>> = dummy_masks(64, 3, 42, &Device::Cpu).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<u8>> = dummy_masks(64, 3, 42, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], a[1]);
        assert_eq!(a[1], a[2]);
    }

    #[test]
    fn test_invalid_counts() {
        assert!(sliding_window_masks(4, 0, &Device::Cpu).is_err());
        assert!(dummy_masks(4, 5, 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_segmentation_source_yields_none() {
        let out = ablation_masks(MaskSource::Segmentation, 16, &Device::Cpu).unwrap();
        assert!(out.is_none());
    }
}
