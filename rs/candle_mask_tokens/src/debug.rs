use candle_core::{DType, Tensor};

use crate::error::Result;

/// Tensor statistics for debugging and validation
#[derive(Debug, Clone, serde::Serialize)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub sum: f32,
}

impl TensorStats {
    /// Compute statistics for a tensor; an empty tensor reports zeros.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        if data.is_empty() {
            return Ok(Self {
                shape,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                sum: 0.0,
            });
        }

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = data.iter().sum();
        let mean = sum / data.len() as f32;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            sum,
        })
    }

    pub fn print(&self, name: &str) {
        println!(
            "  {}: shape={:?}, min={:.6}, max={:.6}, mean={:.6}, sum={:.6}",
            name, self.shape, self.min, self.max, self.mean, self.sum
        );
    }
}
