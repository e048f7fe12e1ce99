//! Segmentation store.
//!
//! Reads (and writes) the on-disk output of a partitioned automatic mask
//! generator:
//! - `{metadata_dir}/metadata_partition_{p}.json` maps an image key to the
//!   list of its segmentation records
//! - `{arrays_dir}/partition_{p}/{image_key}/mask_{i}.npy` holds the boolean
//!   `[H, W]` mask of record `i`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Errors raised by the segmentation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot read mask array {path:?}: {source}")]
    ReadNpy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpyError,
    },

    #[error("cannot write mask array {path:?}: {source}")]
    WriteNpy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::WriteNpyError,
    },

    #[error("no segmentations stored for image {0:?}")]
    UnknownImage(String),

    #[error("mask index {index} out of range for image {key:?} with {len} masks")]
    IndexOutOfRange { key: String, index: usize, len: usize },

    #[error("partition {id} out of range for {total} partitions")]
    InvalidPartition { id: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Bounds `[start, end)` of partition `id` when `len` items are split into
/// `total` contiguous partitions; the first `len % total` partitions get one
/// extra item.
pub fn partition_range(len: usize, id: usize, total: usize) -> Result<(usize, usize)> {
    if total == 0 || id >= total {
        return Err(StoreError::InvalidPartition { id, total });
    }
    let per_partition = len / total;
    let remainder = len % total;
    let start = id * per_partition + id.min(remainder);
    let end = start + per_partition + usize::from(id < remainder);
    Ok((start, end))
}

/// Metadata of one generated mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationRecord {
    /// File name of the mask array inside the image directory
    pub segmentation: String,
    /// Number of true pixels
    #[serde(default)]
    pub area: u64,
    /// Box in [x, y, width, height] format
    #[serde(default)]
    pub bbox: [f64; 4],
    #[serde(default)]
    pub predicted_iou: f64,
    #[serde(default)]
    pub point_coords: Vec<[f64; 2]>,
    #[serde(default)]
    pub stability_score: f64,
    /// Crop the mask was generated in, [x, y, width, height]
    #[serde(default)]
    pub crop_box: [f64; 4],
}

/// Row-major boolean mask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    pub height: usize,
    pub width: usize,
    pub data: Vec<bool>,
}

impl BinaryMask {
    pub fn new(height: usize, width: usize, data: Vec<bool>) -> Self {
        Self {
            height,
            width,
            data,
        }
    }

    /// Number of true pixels
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    /// Tight box of the true pixels in [x, y, width, height] format,
    /// `None` for an empty mask.
    pub fn bbox(&self) -> Option<[usize; 4]> {
        let mut bounds: Option<[usize; 4]> = None;
        for (i, _) in self.data.iter().enumerate().filter(|&(_, &v)| v) {
            let (y, x) = (i / self.width, i % self.width);
            bounds = Some(match bounds {
                None => [x, y, x, y],
                Some([x0, y0, x1, y1]) => [x0.min(x), y0.min(y), x1.max(x), y1.max(y)],
            });
        }
        bounds.map(|[x0, y0, x1, y1]| [x0, y0, x1 - x0 + 1, y1 - y0 + 1])
    }

    /// Mask values as 0/1 bytes
    pub fn to_u8(&self) -> Vec<u8> {
        self.data.iter().map(|&v| v as u8).collect()
    }

    fn from_array(array: Array2<bool>) -> Self {
        let (height, width) = array.dim();
        let data = array.iter().copied().collect();
        Self::new(height, width, data)
    }

    fn to_array(&self) -> Array2<bool> {
        Array2::from_shape_fn((self.height, self.width), |(y, x)| {
            self.data[y * self.width + x]
        })
    }
}

/// Metadata index: image key to its records
pub type MetadataIndex = BTreeMap<String, Vec<SegmentationRecord>>;

/// Parse metadata, retrying on the content up to the last `}` when the file
/// was cut short. Unrecoverable content yields an empty index.
pub fn parse_metadata(content: &str) -> MetadataIndex {
    match serde_json::from_str(content) {
        Ok(index) => index,
        Err(err) => {
            tracing::warn!(error = %err, "metadata is not valid JSON, trying to recover");
            content
                .rfind('}')
                .and_then(|end| serde_json::from_str(&content[..=end]).ok())
                .unwrap_or_default()
        }
    }
}

/// One partition of the segmentation store
#[derive(Debug, Clone)]
pub struct SegmentationStore {
    arrays_dir: PathBuf,
    metadata_file: PathBuf,
    partition_id: usize,
}

impl SegmentationStore {
    /// Open partition `partition_id` under the given directories.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(arrays_dir: P, metadata_dir: Q, partition_id: usize) -> Self {
        Self {
            arrays_dir: arrays_dir.as_ref().join(format!("partition_{}", partition_id)),
            metadata_file: metadata_dir
                .as_ref()
                .join(format!("metadata_partition_{}.json", partition_id)),
            partition_id,
        }
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn metadata_file(&self) -> &Path {
        &self.metadata_file
    }

    /// Read the metadata index; a missing file is an empty index.
    pub fn metadata(&self) -> Result<MetadataIndex> {
        if !self.metadata_file.exists() {
            return Ok(MetadataIndex::new());
        }
        let content = fs::read_to_string(&self.metadata_file).map_err(io_error(&self.metadata_file))?;
        Ok(parse_metadata(&content))
    }

    /// Image keys stored in this partition, sorted
    pub fn image_keys(&self) -> Result<Vec<String>> {
        Ok(self.metadata()?.into_keys().collect())
    }

    /// Records of one image
    pub fn records(&self, image_key: &str) -> Result<Vec<SegmentationRecord>> {
        self.metadata()?
            .remove(image_key)
            .ok_or_else(|| StoreError::UnknownImage(image_key.to_string()))
    }

    fn array_path(&self, image_key: &str, file_name: &str) -> PathBuf {
        self.arrays_dir.join(image_key).join(file_name)
    }

    /// Load masks of one image in the requested order; `None` loads all of them.
    pub fn load_masks(&self, image_key: &str, indices: Option<&[usize]>) -> Result<Vec<BinaryMask>> {
        let records = self.records(image_key)?;
        let all: Vec<usize> = (0..records.len()).collect();
        let indices = indices.unwrap_or(&all);

        let mut masks = Vec::with_capacity(indices.len());
        for &index in indices {
            let record = records.get(index).ok_or_else(|| StoreError::IndexOutOfRange {
                key: image_key.to_string(),
                index,
                len: records.len(),
            })?;
            let path = self.array_path(image_key, &record.segmentation);
            let array: Array2<bool> = ndarray_npy::read_npy(&path)
                .map_err(|source| StoreError::ReadNpy { path: path.clone(), source })?;
            masks.push(BinaryMask::from_array(array));
        }
        tracing::debug!(image_key, count = masks.len(), "loaded masks");
        Ok(masks)
    }

    /// Store the masks of one image, replacing any previous entry.
    ///
    /// Record `i` points at `mask_{i}.npy`; area and box are filled in from the mask.
    pub fn save_masks(&self, image_key: &str, masks: &[BinaryMask]) -> Result<Vec<SegmentationRecord>> {
        let image_dir = self.arrays_dir.join(image_key);
        fs::create_dir_all(&image_dir).map_err(io_error(&image_dir))?;

        let mut records = Vec::with_capacity(masks.len());
        for (i, mask) in masks.iter().enumerate() {
            let file_name = format!("mask_{}.npy", i);
            let path = image_dir.join(&file_name);
            ndarray_npy::write_npy(&path, &mask.to_array())
                .map_err(|source| StoreError::WriteNpy { path: path.clone(), source })?;
            let bbox = mask.bbox().map(|b| b.map(|v| v as f64)).unwrap_or_default();
            records.push(SegmentationRecord {
                segmentation: file_name,
                area: mask.area() as u64,
                bbox,
                predicted_iou: 0.0,
                point_coords: Vec::new(),
                stability_score: 0.0,
                crop_box: [0.0, 0.0, mask.width as f64, mask.height as f64],
            });
        }

        let mut index = self.metadata()?;
        index.insert(image_key.to_string(), records.clone());
        self.write_metadata(&index)?;
        Ok(records)
    }

    /// Write the metadata through a temporary file so readers never see a partial file.
    fn write_metadata(&self, index: &MetadataIndex) -> Result<()> {
        if let Some(dir) = self.metadata_file.parent() {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        let tmp = self.metadata_file.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(index)?;
        fs::write(&tmp, content).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &self.metadata_file).map_err(io_error(&self.metadata_file))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("segtools-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn square(size: usize, x0: usize, y0: usize, side: usize) -> BinaryMask {
        let data = (0..size * size)
            .map(|i| {
                let (y, x) = (i / size, i % size);
                (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y)
            })
            .collect();
        BinaryMask::new(size, size, data)
    }

    #[test]
    fn test_partition_range_is_balanced() {
        // 10 items in 3 partitions: 4, 3, 3
        assert_eq!(partition_range(10, 0, 3).unwrap(), (0, 4));
        assert_eq!(partition_range(10, 1, 3).unwrap(), (4, 7));
        assert_eq!(partition_range(10, 2, 3).unwrap(), (7, 10));
        assert_eq!(partition_range(2, 3, 4).unwrap(), (2, 2));
        assert!(partition_range(10, 3, 3).is_err());
    }

    #[test]
    fn test_mask_area_and_bbox() {
        let mask = square(8, 2, 3, 4);
        assert_eq!(mask.area(), 16);
        assert_eq!(mask.bbox(), Some([2, 3, 4, 4]));
        assert_eq!(BinaryMask::new(2, 2, vec![false; 4]).bbox(), None);
    }

    #[test]
    fn test_truncated_metadata_is_recovered() {
        let full = r#"{"img_a": [{"segmentation": "mask_0.npy", "area": 4}]}"#;
        let truncated = format!("{}\n  , \"img_b\": [", full);
        let index = parse_metadata(&truncated);
        assert_eq!(index.len(), 1);
        assert_eq!(index["img_a"][0].area, 4);
        assert!(parse_metadata("not json at all").is_empty());
    }

    #[test]
    fn test_save_and_load_masks() {
        let root = scratch_dir("roundtrip");
        let store = SegmentationStore::open(root.join("arrays"), root.join("meta"), 2);
        let masks = vec![square(6, 0, 0, 2), square(6, 3, 1, 3)];
        let records = store.save_masks("000123", &masks).unwrap();
        assert_eq!(records[1].segmentation, "mask_1.npy");
        assert_eq!(records[1].bbox, [3.0, 1.0, 3.0, 3.0]);

        assert_eq!(store.image_keys().unwrap(), vec!["000123".to_string()]);
        let loaded = store.load_masks("000123", Some(&[1, 0])).unwrap();
        assert_eq!(loaded, vec![masks[1].clone(), masks[0].clone()]);
        assert!(root.join("arrays/partition_2/000123/mask_0.npy").exists());
        assert!(root.join("meta/metadata_partition_2.json").exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_image_and_index() {
        let root = scratch_dir("missing");
        let store = SegmentationStore::open(root.join("arrays"), root.join("meta"), 0);
        store.save_masks("a", &[square(4, 0, 0, 1)]).unwrap();
        assert!(matches!(store.records("b"), Err(StoreError::UnknownImage(_))));
        assert!(matches!(
            store.load_masks("a", Some(&[3])),
            Err(StoreError::IndexOutOfRange { index: 3, len: 1, .. })
        ));
        fs::remove_dir_all(&root).unwrap();
    }
}
