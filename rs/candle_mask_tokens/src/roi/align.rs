//! Region-of-interest alignment
//!
//! Average of bilinearly sampled points inside each output bin, with the
//! sampling rules of the reference ROIAlign operator. For multi-channel
//! maps the sample positions and their bilinear weights are computed on the
//! host and the values are gathered on the map's own device, so
//! `[B, C, H, W]` never leaves the device. Single-channel maps (masks) are
//! pooled on the host, bin by bin.

use candle_core::{DType, Tensor};

use super::boxes::RoiBox;
use crate::error::{MaskTokenError, Result};

/// Parameters of [`roi_align`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiAlignConfig {
    /// Side of the square output grid
    pub output_size: usize,
    /// Factor from box coordinates to input pixels
    pub spatial_scale: f32,
    /// Samples per bin side; 0 picks `ceil(roi_size / output_size)` per box
    pub sampling_ratio: usize,
    /// Shift boxes by half a pixel so corners land on pixel centers
    pub aligned: bool,
}

impl RoiAlignConfig {
    pub fn new(output_size: usize) -> Self {
        Self {
            output_size,
            spatial_scale: 1.0,
            sampling_ratio: 0,
            aligned: false,
        }
    }

    pub fn with_sampling_ratio(mut self, sampling_ratio: usize) -> Self {
        self.sampling_ratio = sampling_ratio;
        self
    }

    pub fn with_spatial_scale(mut self, spatial_scale: f32) -> Self {
        self.spatial_scale = spatial_scale;
        self
    }

    pub fn with_aligned(mut self, aligned: bool) -> Self {
        self.aligned = aligned;
        self
    }
}

/// Neighbouring pixel indices along one axis and the clamped coordinate
fn axis_neighbors(v: f32, size: usize) -> (usize, usize, f32) {
    let low = v as usize;
    if low >= size - 1 {
        (size - 1, size - 1, (size - 1) as f32)
    } else {
        (low, low + 1, v)
    }
}

/// Flat pixel indices and weights of a bilinear sample at `(y, x)`.
///
/// Samples more than one pixel outside the map contribute nothing.
fn bilinear_taps(y: f32, x: f32, height: usize, width: usize) -> Option<[(usize, f32); 4]> {
    if y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
        return None;
    }
    let (y_low, y_high, y) = axis_neighbors(y.max(0.0), height);
    let (x_low, x_high, x) = axis_neighbors(x.max(0.0), width);
    let ly = y - y_low as f32;
    let lx = x - x_low as f32;
    let (hy, hx) = (1.0 - ly, 1.0 - lx);
    Some([
        (y_low * width + x_low, hy * hx),
        (y_low * width + x_high, hy * lx),
        (y_high * width + x_low, ly * hx),
        (y_high * width + x_high, ly * lx),
    ])
}

/// Visit every bilinear tap of one box as `(cell, pixel, weight)`, with the
/// weights already divided by the samples per bin.
fn visit_box_taps<V>(roi: &RoiBox, height: usize, width: usize, config: &RoiAlignConfig, mut visit: V)
where
    V: FnMut(usize, usize, f32),
{
    let r = config.output_size;
    let offset = if config.aligned { 0.5 } else { 0.0 };
    let [x1, y1, x2, y2] = roi.bbox;
    let start_w = x1 * config.spatial_scale - offset;
    let start_h = y1 * config.spatial_scale - offset;
    let mut roi_w = x2 * config.spatial_scale - offset - start_w;
    let mut roi_h = y2 * config.spatial_scale - offset - start_h;
    if !config.aligned {
        roi_w = roi_w.max(1.0);
        roi_h = roi_h.max(1.0);
    }
    let bin_w = roi_w / r as f32;
    let bin_h = roi_h / r as f32;
    let (grid_h, grid_w) = if config.sampling_ratio > 0 {
        (config.sampling_ratio, config.sampling_ratio)
    } else {
        (bin_h.max(0.0).ceil() as usize, bin_w.max(0.0).ceil() as usize)
    };
    let count = (grid_h * grid_w).max(1) as f32;

    for ph in 0..r {
        for pw in 0..r {
            let cell = ph * r + pw;
            for iy in 0..grid_h {
                let y = start_h + ph as f32 * bin_h + (iy as f32 + 0.5) * bin_h / grid_h as f32;
                for ix in 0..grid_w {
                    let x = start_w + pw as f32 * bin_w + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                    if let Some(corners) = bilinear_taps(y, x, height, width) {
                        for (pos, wt) in corners {
                            visit(cell, pos, wt / count);
                        }
                    }
                }
            }
        }
    }
}

/// Bilinear taps of every output bin of one box, each bin already averaged.
fn box_taps(roi: &RoiBox, height: usize, width: usize, config: &RoiAlignConfig) -> Vec<Vec<(usize, f32)>> {
    let r = config.output_size;
    let mut cells = vec![Vec::new(); r * r];
    visit_box_taps(roi, height, width, config, |cell, pos, wt| cells[cell].push((pos, wt)));
    cells
}

fn check_output_size(config: &RoiAlignConfig) -> Result<()> {
    if config.output_size == 0 {
        return Err(MaskTokenError::InvalidConfig(
            "roi_align output size must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// Pool every `(image index, box)` pair of `rois` from `input` `[B, C, H, W]`.
///
/// Returns `[K, C, R, R]` with `K = rois.len()`.
pub fn roi_align(input: &Tensor, rois: &[(usize, RoiBox)], config: &RoiAlignConfig) -> Result<Tensor> {
    let (b, c, h, w) = input
        .dims4()
        .map_err(|_| MaskTokenError::shape("roi_align", "[B, C, H, W]", input.dims()))?;
    let r = config.output_size;
    let k = rois.len();
    let device = input.device();
    check_output_size(config)?;
    if h == 0 || w == 0 {
        return Err(MaskTokenError::EmptyMask);
    }
    if let Some(&(image, _)) = rois.iter().find(|(image, _)| *image >= b) {
        return Err(MaskTokenError::shape(
            "roi_align",
            format!("image index < {}", b),
            &[image],
        ));
    }

    let cells: Vec<Vec<(usize, f32)>> = rois
        .iter()
        .flat_map(|(image, roi)| {
            let base = image * h * w;
            box_taps(roi, h, w, config)
                .into_iter()
                .map(move |taps| taps.into_iter().map(|(pos, wt)| (base + pos, wt)).collect::<Vec<_>>())
        })
        .collect();
    let max_taps = cells.iter().map(Vec::len).max().unwrap_or(0);

    tracing::trace!(rois = k, output_size = r, max_taps, "roi align");

    if k == 0 || max_taps == 0 {
        return Ok(Tensor::zeros((k, c, r, r), input.dtype(), device)?);
    }

    // Cells with fewer taps are padded with zero-weight reads of pixel 0.
    let mut index = Vec::with_capacity(cells.len() * max_taps);
    let mut weights = Vec::with_capacity(cells.len() * max_taps);
    for taps in &cells {
        for &(pos, wt) in taps {
            index.push(pos as u32);
            weights.push(wt);
        }
        for _ in taps.len()..max_taps {
            index.push(0u32);
            weights.push(0f32);
        }
    }
    let n = index.len();
    let index = Tensor::from_vec(index, n, device)?;
    let weights = Tensor::from_vec(weights, (n, 1), device)?.to_dtype(input.dtype())?;

    let pixels = input.permute((0, 2, 3, 1))?.reshape((b * h * w, c))?;
    let pooled = pixels
        .index_select(&index, 0)?
        .broadcast_mul(&weights)?
        .reshape((k, r * r, max_taps, c))?
        .sum(2)?
        .permute((0, 2, 1))?
        .reshape((k, c, r, r))?;
    Ok(pooled)
}

/// Pool single-channel maps `[K, H, W]`, box `k` reading map `k`.
///
/// Samples are accumulated per output bin on the host, so the cost does not
/// grow with the number of samples per bin. Returns `[K, 1, R, R]` in `F32`.
pub fn roi_align_maps(maps: &Tensor, rois: &[RoiBox], config: &RoiAlignConfig) -> Result<Tensor> {
    let (k, h, w) = maps
        .dims3()
        .map_err(|_| MaskTokenError::shape("roi_align_maps", "[K, H, W]", maps.dims()))?;
    if k != rois.len() {
        return Err(MaskTokenError::shape(
            "roi_align_maps",
            format!("[{}, H, W]", rois.len()),
            maps.dims(),
        ));
    }
    check_output_size(config)?;
    if h == 0 || w == 0 {
        return Err(MaskTokenError::EmptyMask);
    }
    let r = config.output_size;
    let data: Vec<f32> = maps.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let mut pooled = vec![0f32; k * r * r];
    for (i, (roi, cells)) in rois.iter().zip(pooled.chunks_mut(r * r)).enumerate() {
        let map = &data[i * h * w..(i + 1) * h * w];
        visit_box_taps(roi, h, w, config, |cell, pos, wt| cells[cell] += wt * map[pos]);
    }

    tracing::trace!(maps = k, output_size = r, "roi align maps");

    Ok(Tensor::from_vec(pooled, (k, 1, r, r), maps.device())?)
}

/// Pool boxes of a `[B, ...]` batch where image `i` owns `boxes[i]`.
pub fn roi_align_batch(input: &Tensor, boxes: &[Vec<RoiBox>], config: &RoiAlignConfig) -> Result<Tensor> {
    let rois: Vec<(usize, RoiBox)> = boxes
        .iter()
        .enumerate()
        .flat_map(|(i, image)| image.iter().map(move |&roi| (i, roi)))
        .collect();
    roi_align(input, &rois, config)
}

/// Binarize a pooled mask: any positive response marks the cell.
pub fn binarize(pooled: &Tensor) -> Result<Tensor> {
    Ok(pooled.gt(0.0)?.to_dtype(DType::F32)?)
}
