//! Mask-conditioned visual tokenization with Candle
//!
//! Turns a vision tower's token grid and a ragged set of segmentation masks per
//! image into dense token batches for a multimodal language model.

pub mod ablation;
pub mod boundary;
pub mod compose;
pub mod config;
pub mod debug;
pub mod encoder;
pub mod error;
pub mod padding;
pub mod policy;
pub mod preprocess;
pub mod rasterize;
pub mod resize;
pub mod roi;
pub mod select;
pub mod tokenizer;

use candle_core::Device;

pub use boundary::BoundaryToken;
pub use compose::{ComposedBatch, MaskComposer};
pub use config::{MaskSource, MaskTokenizerConfig, Strategy};
pub use encoder::{PatchEmbedEncoder, VisionTower};
pub use error::{MaskTokenError, Result};
pub use padding::{pad_mask_batch, PaddedMaskBatch};
pub use policy::{CompositionPolicy, GlobalView, MaskBudget, Markers, PolicyFlags, Reduction};
pub use rasterize::MaskRasterizer;
pub use roi::{RoiBox, RoiTokenizer, RoiTokens};
pub use select::{select_masked_features, MaskedFeatures};
pub use tokenizer::{MaskTokenizer, TokenBatch};

/// Pick the compute device: CUDA, then Metal, then CPU.
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Device::new_cuda(0);
    }
    if candle_core::utils::metal_is_available() {
        return Device::new_metal(0);
    }
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        tracing::info!("no GPU backend compiled in, build with `--features metal` to use the GPU");
    } else {
        tracing::info!("no GPU backend compiled in, build with `--features cuda` to use the GPU");
    }
    Ok(Device::Cpu)
}
