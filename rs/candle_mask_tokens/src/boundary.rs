//! Boundary token insertion
//!
//! A single learned embedding marks the start of every mask segment in the
//! flattened token sequence. The embedding is owned by the surrounding model
//! and injected here once; this module only reads it.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::error::{MaskTokenError, Result};

/// Shared begin-of-mask marker embedding, stored as `[1, F]`
#[derive(Debug, Clone)]
pub struct BoundaryToken {
    embedding: Tensor,
}

impl BoundaryToken {
    /// Weight path of the marker: `mm_bom_mask_token.mm_bom_mask_token`
    pub const PREFIX: &'static str = "mm_bom_mask_token";

    /// Load the marker from a VarBuilder rooted at the model.
    ///
    /// With a fresh `VarMap` the marker is initialized from N(0, 0.02).
    pub fn load(vb: VarBuilder, dim: usize) -> Result<Self> {
        let embedding = vb.pp(Self::PREFIX).get_with_hints(
            (1, dim),
            Self::PREFIX,
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self { embedding })
    }

    /// Wrap an existing embedding of shape `[F]` or `[1, F]`.
    pub fn new(embedding: Tensor) -> Result<Self> {
        let embedding = match embedding.dims() {
            [f] => embedding.reshape((1, *f))?,
            [1, _] => embedding,
            dims => return Err(MaskTokenError::shape("BoundaryToken::new", "[F] or [1, F]", dims)),
        };
        Ok(Self { embedding })
    }

    /// Feature width of the marker
    pub fn dim(&self) -> usize {
        self.embedding.dims()[1]
    }

    /// The marker as one sequence row `[1, F]`
    pub fn row(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        Ok(self.embedding.to_device(device)?.to_dtype(dtype)?)
    }

    /// Prepend the marker to every mask segment and flatten.
    ///
    /// `[B, M, K, F]` becomes `[B, M * (1 + K), F]`.
    pub fn insert(&self, masked: &Tensor) -> Result<Tensor> {
        let (b, m, k, f) = masked
            .dims4()
            .map_err(|_| MaskTokenError::shape("BoundaryToken::insert", "[B, M, K, F]", masked.dims()))?;
        if f != self.dim() {
            return Err(MaskTokenError::shape(
                "BoundaryToken::insert",
                format!("feature width {}", self.dim()),
                masked.dims(),
            ));
        }
        let markers = self
            .row(masked.dtype(), masked.device())?
            .reshape((1, 1, 1, f))?
            .broadcast_as((b, m, 1, f))?
            .contiguous()?;
        let with_markers = Tensor::cat(&[&markers, masked], 2)?;
        Ok(with_markers.reshape((b, m * (1 + k), f))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn marker(f: usize) -> BoundaryToken {
        let embedding = Tensor::full(-1f32, f, &Device::Cpu).unwrap();
        BoundaryToken::new(embedding).unwrap()
    }

    #[test]
    fn test_sequence_length() {
        let masked = Tensor::ones((2, 5, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let out = marker(4).insert(&masked).unwrap();
        assert_eq!(out.dims(), &[2, 5 * (1 + 3), 4]);
    }

    #[test]
    fn test_marker_leads_each_segment() {
        let masked = Tensor::ones((1, 2, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let out = marker(3).insert(&masked).unwrap();
        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        let firsts: Vec<f32> = rows.iter().map(|r| r[0]).collect();
        assert_eq!(firsts, vec![-1.0, 1.0, 1.0, -1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_empty_selection_keeps_markers() {
        let masked = Tensor::zeros((1, 3, 0, 2), DType::F32, &Device::Cpu).unwrap();
        let out = marker(2).insert(&masked).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2]);
    }

    #[test]
    fn test_width_mismatch() {
        let masked = Tensor::ones((1, 1, 1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(marker(4).insert(&masked).is_err());
    }

    #[test]
    fn test_load_from_varmap() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let token = BoundaryToken::load(vb, 8).unwrap();
        assert_eq!(token.dim(), 8);
        assert_eq!(token.row(DType::F32, &Device::Cpu).unwrap().dims(), &[1, 8]);
    }
}
