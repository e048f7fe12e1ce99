//! Region boxes
//!
//! This module defines the RoiBox struct and the tight-box extraction from masks.

use std::fmt;

use candle_core::{DType, Device, Tensor};

use crate::error::{MaskTokenError, Result};

/// An axis-aligned region box.
///
/// Coordinates are in pixel space of the mask batch unless normalized.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RoiBox {
    /// Bounding box in [x1, y1, x2, y2] format (top-left and bottom-right corners)
    pub bbox: [f32; 4],
}

impl RoiBox {
    pub fn new(bbox: [f32; 4]) -> Self {
        Self { bbox }
    }

    /// The box assigned to empty and padding masks
    pub fn zero() -> Self {
        Self::default()
    }

    /// Get the width of the box
    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    /// Get the height of the box
    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Get the center point of the box
    pub fn center(&self) -> (f32, f32) {
        let cx = (self.bbox[0] + self.bbox[2]) / 2.0;
        let cy = (self.bbox[1] + self.bbox[3]) / 2.0;
        (cx, cy)
    }

    /// Convert from [x1, y1, x2, y2] to [cx, cy, w, h]
    pub fn to_cxcywh(&self) -> [f32; 4] {
        let (cx, cy) = self.center();
        [cx, cy, self.width(), self.height()]
    }

    /// Scale pixel coordinates into [0, 1] by the frame size.
    pub fn normalized(&self, width: usize, height: usize) -> Self {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        let [x1, y1, x2, y2] = self.bbox;
        Self::new([x1 / w, y1 / h, x2 / w, y2 / h])
    }

    /// A box is padding when its coordinates sum to zero.
    pub fn is_padding(&self) -> bool {
        self.bbox.iter().sum::<f32>() == 0.0
    }
}

impl fmt::Display for RoiBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RoiBox [{:.1}, {:.1}, {:.1}, {:.1}]",
            self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3]
        )
    }
}

/// Tight box of the non-zero pixels of one `height x width` mask.
///
/// The box grows by one pixel on the max side and is clipped to
/// `[0, width - 1] x [0, height - 1]`. Empty masks get the zero box.
pub fn tight_box(mask: &[f32], height: usize, width: usize) -> RoiBox {
    let mut x_min = usize::MAX;
    let mut y_min = usize::MAX;
    let mut x_max = 0usize;
    let mut y_max = 0usize;
    let mut any = false;
    for (y, row) in mask.chunks(width.max(1)).take(height).enumerate() {
        for (x, &v) in row.iter().enumerate() {
            if v > 0.0 {
                any = true;
                x_min = x_min.min(x);
                y_min = y_min.min(y);
                x_max = x_max.max(x);
                y_max = y_max.max(y);
            }
        }
    }
    if !any {
        return RoiBox::zero();
    }
    let x_max = (x_max + 1).min(width - 1);
    let y_max = (y_max + 1).min(height - 1);
    RoiBox::new([x_min as f32, y_min as f32, x_max as f32, y_max as f32])
}

/// Tight boxes of a padded mask batch `[B, M, H, W]`, one list per image.
pub fn roi_boxes_from_masks(masks: &Tensor) -> Result<Vec<Vec<RoiBox>>> {
    let (b, m, h, w) = masks
        .dims4()
        .map_err(|_| MaskTokenError::shape("roi_boxes_from_masks", "[B, M, H, W]", masks.dims()))?;
    if b * m == 0 {
        return Ok(vec![Vec::new(); b]);
    }
    if h * w == 0 {
        return Err(MaskTokenError::EmptyMask);
    }
    let data: Vec<f32> = masks.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let boxes = data
        .chunks(m * h * w)
        .map(|image| image.chunks(h * w).map(|mask| tight_box(mask, h, w)).collect())
        .collect();
    Ok(boxes)
}

/// Stack box lists into a `[B, M, 4]` tensor.
pub fn boxes_to_tensor(boxes: &[Vec<RoiBox>], device: &Device) -> Result<Tensor> {
    let m = boxes.first().map(Vec::len).unwrap_or(0);
    let data: Vec<f32> = boxes.iter().flatten().flat_map(|b| b.bbox).collect();
    if data.len() != boxes.len() * m * 4 {
        return Err(MaskTokenError::InvalidConfig(
            "every image must carry the same number of boxes".to_string(),
        ));
    }
    Ok(Tensor::from_vec(data, (boxes.len(), m, 4), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_dimensions() {
        let b = RoiBox::new([10.0, 20.0, 110.0, 170.0]);
        assert_eq!(b.width(), 100.0);
        assert_eq!(b.height(), 150.0);
        assert_eq!(b.area(), 15000.0);
        assert_eq!(b.to_cxcywh(), [60.0, 95.0, 100.0, 150.0]);
    }

    #[test]
    fn test_normalized() {
        let b = RoiBox::new([0.0, 84.0, 168.0, 336.0]).normalized(336, 336);
        assert_eq!(b.bbox, [0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_tight_box_grows_on_max_side() {
        let mut mask = vec![0f32; 8 * 8];
        mask[2 * 8 + 3] = 1.0;
        mask[4 * 8 + 5] = 1.0;
        let b = tight_box(&mask, 8, 8);
        assert_eq!(b.bbox, [3.0, 2.0, 6.0, 5.0]);
        assert!(!b.is_padding());
    }

    #[test]
    fn test_full_mask_box_is_clipped() {
        let mask = vec![1f32; 6 * 4];
        let b = tight_box(&mask, 6, 4);
        assert_eq!(b.bbox, [0.0, 0.0, 3.0, 5.0]);
    }

    #[test]
    fn test_empty_mask_is_padding() {
        let mask = vec![0f32; 16];
        let b = tight_box(&mask, 4, 4);
        assert_eq!(b, RoiBox::zero());
        assert!(b.is_padding());
    }

    #[test]
    fn test_boxes_within_bounds() {
        let device = Device::Cpu;
        let masks = Tensor::ones((2, 3, 5, 7), DType::U8, &device).unwrap();
        let boxes = roi_boxes_from_masks(&masks).unwrap();
        for b in boxes.iter().flatten() {
            let [x1, y1, x2, y2] = b.bbox;
            assert!(0.0 <= x1 && x1 <= x2 && x2 <= 6.0);
            assert!(0.0 <= y1 && y1 <= y2 && y2 <= 4.0);
        }
        let t = boxes_to_tensor(&boxes, &device).unwrap();
        assert_eq!(t.dims(), &[2, 3, 4]);
    }
}
