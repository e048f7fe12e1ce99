//! Mask-conditioned tokenization of a single image
//!
//! Encodes an image with a patch-embedding vision tower and turns it into
//! tokens with one of the three strategies, using masks from PNG files or
//! from a segmentation store.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_mask_tokens::debug::TensorStats;
use candle_mask_tokens::preprocess;
use candle_mask_tokens::{
    CompositionPolicy, MaskSource, MaskTokenizer, MaskTokenizerConfig, PatchEmbedEncoder, PolicyFlags,
    RoiBox, Strategy, TokenBatch,
};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args as ClapArgs, Parser, ValueEnum};
use image::DynamicImage;
use segtools::SegmentationStore;
use tracing_subscriber::EnvFilter;

/// Vision tower presets
#[derive(Clone, Copy, ValueEnum, Debug)]
enum Which {
    Clip336,
    Clip224,
    Siglip384,
}

impl Which {
    fn config(&self) -> MaskTokenizerConfig {
        match self {
            Which::Clip336 => MaskTokenizerConfig::clip_vit_l_336(),
            Which::Clip224 => MaskTokenizerConfig::clip_vit_l_224(),
            Which::Siglip384 => MaskTokenizerConfig::siglip_so400m_384(),
        }
    }
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
enum StrategyArg {
    Batched,
    PerMask,
    Roi,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Batched => Strategy::Batched,
            StrategyArg::PerMask => Strategy::PerMask,
            StrategyArg::Roi => Strategy::Roi,
        }
    }
}

/// Ablation mask patterns replacing the real masks
#[derive(Clone, Copy, ValueEnum, Debug)]
enum Ablation {
    SlidingWindow,
    Dummy,
}

/// Composition switches of the per-mask strategy
#[derive(ClapArgs, Debug)]
struct PolicyArgs {
    /// Prepend the whole token grid to every sequence.
    #[arg(long)]
    global_view: bool,

    /// Reduce the global view to its mean token.
    #[arg(long)]
    averaging_global_view: bool,

    /// Reduce every mask to the mean of its tokens.
    #[arg(long)]
    averaging: bool,

    /// Drop every mask of an image that has more than `mask_limit` masks.
    #[arg(long)]
    mask_removing: bool,

    /// Keep only the first `mask_limit` masks.
    #[arg(long)]
    mask_limiting: bool,

    /// Mask count used by `--mask-removing` and `--mask-limiting`.
    #[arg(long, default_value_t = 20)]
    mask_limit: usize,

    /// Do not insert boundary tokens.
    #[arg(long)]
    no_masktoken: bool,
}

impl PolicyArgs {
    fn policy(&self) -> candle_mask_tokens::Result<CompositionPolicy> {
        CompositionPolicy::from_flags(&PolicyFlags {
            global_view: self.global_view,
            averaging: self.averaging,
            mask_removing: self.mask_removing,
            mask_limiting: self.mask_limiting,
            mask_limit: self.mask_limit,
            averaging_global_view: self.averaging_global_view,
            no_masktoken: self.no_masktoken,
        })
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Path to model weights, in safetensors format. Random weights are used when omitted.
    #[arg(long)]
    weights: Option<String>,

    /// Which vision tower preset to use.
    #[arg(long, value_enum, default_value_t = Which::Clip336)]
    which: Which,

    /// Tokenization strategy.
    #[arg(long, value_enum, default_value_t = StrategyArg::Batched)]
    strategy: StrategyArg,

    #[command(flatten)]
    policy: PolicyArgs,

    /// Replace the masks with an ablation pattern.
    #[arg(long, value_enum)]
    ablation: Option<Ablation>,

    /// Number of ablation masks.
    #[arg(long, default_value_t = 10)]
    num_masks: usize,

    /// Seed of the dummy ablation pattern.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Input image to process.
    image: String,

    /// Mask images; any non-zero pixel belongs to the mask.
    #[arg(long, num_args = 1..)]
    masks: Vec<String>,

    /// Mask arrays directory of a segmentation store.
    #[arg(long, requires = "metadata_dir")]
    arrays_dir: Option<PathBuf>,

    /// Metadata directory of a segmentation store.
    #[arg(long, requires = "arrays_dir")]
    metadata_dir: Option<PathBuf>,

    /// Partition of the segmentation store.
    #[arg(long, default_value_t = 0)]
    partition: usize,

    /// Image key in the segmentation store, defaults to the image file stem.
    #[arg(long)]
    image_key: Option<String>,

    /// Draw the ROI boxes onto the image.
    #[arg(long)]
    draw: bool,

    /// Print a JSON summary.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn mask_source(&self) -> MaskSource {
        match self.ablation {
            None => MaskSource::Segmentation,
            Some(Ablation::SlidingWindow) => MaskSource::SlidingWindow {
                num_masks: self.num_masks,
            },
            Some(Ablation::Dummy) => MaskSource::Dummy {
                num_masks: self.num_masks,
                seed: self.seed,
            },
        }
    }

    fn image_key(&self) -> String {
        self.image_key.clone().unwrap_or_else(|| {
            std::path::Path::new(&self.image)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    /// Masks `[M, H, W]` of the input image
    fn load_masks(&self, device: &Device) -> anyhow::Result<Tensor> {
        if let (Some(arrays_dir), Some(metadata_dir)) = (&self.arrays_dir, &self.metadata_dir) {
            let store = SegmentationStore::open(arrays_dir, metadata_dir, self.partition);
            let key = self.image_key();
            println!("Loading masks of {:?} from {:?}", key, store.metadata_file());
            let masks = store.load_masks(&key, None)?;
            if masks.is_empty() {
                anyhow::bail!("no masks stored for image {:?}", key);
            }
            let masks = masks
                .iter()
                .map(|mask| Tensor::from_vec(mask.to_u8(), (mask.height, mask.width), device))
                .collect::<candle_core::Result<Vec<_>>>()?;
            return Ok(Tensor::stack(&masks, 0)?);
        }
        if self.masks.is_empty() {
            anyhow::bail!("pass mask images with --masks or a segmentation store with --arrays-dir/--metadata-dir");
        }
        println!("Loading {} mask images", self.masks.len());
        preprocess::load_mask_stack(&self.masks, device)
    }
}

/// Draw normalized ROI boxes onto the original image
fn draw_rois(img: DynamicImage, boxes: &[RoiBox]) -> DynamicImage {
    let mut img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let scale_x = width as f32;
    let scale_y = height as f32;

    for roi in boxes.iter().filter(|roi| !roi.is_padding()) {
        let [x1, y1, x2, y2] = roi.bbox;
        let dx = ((x2 - x1) * scale_x).max(0.0) as u32;
        let dy = ((y2 - y1) * scale_y).max(0.0) as u32;
        if dx > 0 && dy > 0 {
            imageproc::drawing::draw_hollow_rect_mut(
                &mut img,
                imageproc::rect::Rect::at((x1 * scale_x) as i32, (y1 * scale_y) as i32).of_size(dx, dy),
                image::Rgb([255, 0, 0]),
            );
        }
    }

    DynamicImage::ImageRgb8(img)
}

#[derive(serde::Serialize)]
struct Summary<'a> {
    config: &'a MaskTokenizerConfig,
    original_size: [usize; 2],
    num_masks: usize,
    lengths: &'a [usize],
    max_count: Option<usize>,
    visual_token_counts: Option<&'a [usize]>,
    tokens: TensorStats,
}

fn report(batch: &TokenBatch) -> anyhow::Result<()> {
    println!("  tokens shape: {:?}", batch.tokens.dims());
    println!("  sequence lengths: {:?}", batch.lengths);
    if let Some(max_count) = batch.max_count {
        println!("  tokens per mask: {}", max_count);
    }
    TensorStats::from_tensor(&batch.tokens)?.print("tokens");
    if let Some(roi) = &batch.roi {
        println!("  visual token counts: {:?}", roi.visual_token_counts);
        TensorStats::from_tensor(&roi.features)?.print("pooled features");
        for roi_box in roi.boxes.iter().flatten().filter(|roi| !roi.is_padding()) {
            println!("    {}", roi_box);
        }
    }
    Ok(())
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let device = candle_mask_tokens::device(args.cpu)?;
    println!("Using device: {:?}", device);

    let config = args
        .which
        .config()
        .with_strategy(args.strategy.into())
        .with_policy(args.policy.policy()?)
        .with_mask_source(args.mask_source());
    config.validate()?;
    println!("Vision tower: {:?}", args.which);
    println!("  Resolution: {}", config.image_size);
    println!("  Token grid: {0}x{0}", config.grid_size());
    println!("  Hidden size: {}", config.hidden_size);
    println!("Strategy: {:?}", config.strategy);

    let varmap = VarMap::new();
    let vb = match &args.weights {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!("weights file not found: {:?}", path);
            }
            println!("Loading weights from: {:?}", path);
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? }
        }
        None => {
            println!("No weights given, using randomly initialized parameters");
            VarBuilder::from_varmap(&varmap, DType::F32, &device)
        }
    };

    let encoder = PatchEmbedEncoder::load(vb.pp("vision_tower"), &config)?;
    let tokenizer = MaskTokenizer::load(vb, config.clone(), encoder)?;

    println!("Preprocessing image...");
    let (image, h_orig, w_orig) = preprocess::preprocess_image(&args.image, config.image_size, &device)?;
    let images = image.unsqueeze(0)?;
    println!("  Batch tensor shape: {:?}", images.dims());
    println!("  Original image size: {}x{}", w_orig, h_orig);

    let masks = args.load_masks(&device)?;
    let num_masks = masks.dim(0)?;
    println!("  Masks shape: {:?}", masks.dims());

    println!("Tokenizing...");
    let batch = tokenizer.tokenize(&images, &[masks])?;
    report(&batch)?;

    if args.draw {
        match &batch.roi {
            Some(roi) => {
                let original = image::open(&args.image)?;
                let boxes = roi.boxes.first().map(Vec::as_slice).unwrap_or_default();
                let out = draw_rois(original, boxes);
                let out_path = format!("{}.rois.jpg", args.image);
                out.save(&out_path)?;
                println!("Saved ROI boxes to: {}", out_path);
            }
            None => println!("--draw only applies to the roi strategy"),
        }
    }

    if args.json {
        let summary = Summary {
            config: &config,
            original_size: [h_orig, w_orig],
            num_masks,
            lengths: &batch.lengths,
            max_count: batch.max_count,
            visual_token_counts: batch.roi.as_ref().map(|roi| roi.visual_token_counts.as_slice()),
            tokens: TensorStats::from_tensor(&batch.tokens)?,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}
