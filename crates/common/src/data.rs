//! Data pipeline: image loading, validation split, batching.
//!
//! Images are held in memory as `f32` pixels scaled to `[0, 1]`, laid out
//! `N × C × H × W`; labels are class indices. Shuffling takes an explicit
//! [`StdRng`] so that runs are reproducible from the experiment seed.
//!
//! Supported on-disk formats:
//!
//! | Dataset | Files |
//! |---------|-------|
//! | mnist | `{train,t10k}-{images-idx3,labels-idx1}-ubyte[.gz]` |
//! | cifar10 | `data_batch_{1..5}.bin`, `test_batch.bin` |
//! | cifar100 | `train.bin`, `test.bin` (fine labels) |
//! | svhn | `train.bin`, `test.bin` in the cifar10 record layout (converted, see below) |
//!
//! SVHN is distributed as MATLAB files (`train_32x32.mat`, `test_32x32.mat`),
//! which are not read here. Convert each one beforehand into 3073-byte
//! records: one label byte, then the 32×32 image as three channel planes
//! (R, G, B), row-major. Labels may be kept in the `.mat` convention, where
//! digit 0 is stored as `10`; the loader maps `10` back to `0`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use flate2::read::GzDecoder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::DatasetKind;

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// In-memory labelled image set.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    kind: DatasetKind,
    images: Vec<f32>,
    labels: Vec<u32>,
}

impl ImageDataset {
    /// Wrap raw pixels. `images.len()` must equal `labels.len() * C * H * W`.
    pub fn from_parts(kind: DatasetKind, images: Vec<f32>, labels: Vec<u32>) -> AnyhowResult<Self> {
        let (c, h, w) = kind.image_shape();
        let per = c * h * w;
        if images.len() != labels.len() * per {
            anyhow::bail!(
                "{}: {} pixels for {} labels (expected {} per image)",
                kind.name(),
                images.len(),
                labels.len(),
                per
            );
        }
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= kind.num_classes()) {
            anyhow::bail!("{}: label {bad} out of range", kind.name());
        }
        Ok(Self {
            kind,
            images,
            labels,
        })
    }

    /// Load the train or test split from `dir`.
    pub fn load(kind: DatasetKind, dir: &Path, train: bool) -> AnyhowResult<Self> {
        let (images, labels) = match kind {
            DatasetKind::Mnist => {
                let prefix = if train { "train" } else { "t10k" };
                let images = read_idx_images(&find_file(dir, &format!("{prefix}-images-idx3-ubyte"))?)?;
                let labels = read_idx_labels(&find_file(dir, &format!("{prefix}-labels-idx1-ubyte"))?)?;
                (images, labels)
            }
            DatasetKind::Cifar10 => {
                let files: Vec<PathBuf> = if train {
                    (1..=5).map(|i| dir.join(format!("data_batch_{i}.bin"))).collect()
                } else {
                    vec![dir.join("test_batch.bin")]
                };
                read_cifar_records(&files, 1, 0)?
            }
            DatasetKind::Cifar100 => {
                let file = dir.join(if train { "train.bin" } else { "test.bin" });
                // Records carry (coarse, fine) label bytes; keep the fine label.
                read_cifar_records(&[file], 2, 1)?
            }
            DatasetKind::Svhn => {
                let file = dir.join(if train { "train.bin" } else { "test.bin" });
                if !file.is_file() {
                    anyhow::bail!(
                        "missing {}: svhn needs the .mat release converted to 3073-byte records",
                        file.display()
                    );
                }
                let (images, mut labels) = read_cifar_records(&[file], 1, 0)?;
                svhn_labels(&mut labels);
                (images, labels)
            }
        };
        Self::from_parts(kind, images, labels)
    }

    /// Uniform-noise images with uniformly drawn labels.
    pub fn synthetic(kind: DatasetKind, n: usize, rng: &mut StdRng) -> Self {
        let (c, h, w) = kind.image_shape();
        let images = (0..n * c * h * w).map(|_| rng.gen::<f32>()).collect();
        let labels = (0..n)
            .map(|_| rng.gen_range(0..kind.num_classes() as u32))
            .collect();
        Self {
            kind,
            images,
            labels,
        }
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Split off the last `n_valid` samples as a validation set.
    ///
    /// When the set holds fewer than `2 * n_valid` samples, a fifth of it is
    /// held out instead so small (synthetic) sets still train.
    pub fn split_validation(self, n_valid: usize) -> (Self, Self) {
        let n = self.len();
        let n_valid = if n >= 2 * n_valid { n_valid } else { n / 5 };
        let n_train = n - n_valid;
        let per = self.pixels_per_image();

        let mut images = self.images;
        let mut labels = self.labels;
        let valid_images = images.split_off(n_train * per);
        let valid_labels = labels.split_off(n_train);
        (
            Self {
                kind: self.kind,
                images,
                labels,
            },
            Self {
                kind: self.kind,
                images: valid_images,
                labels: valid_labels,
            },
        )
    }

    /// Index batches in a random order. The trailing partial batch is dropped.
    pub fn shuffled_batches(&self, batch_size: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order
            .chunks_exact(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    }

    /// Index batches in storage order, keeping the trailing partial batch.
    pub fn ordered_batches(&self, batch_size: usize) -> Vec<Vec<usize>> {
        let order: Vec<usize> = (0..self.len()).collect();
        order.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
    }

    fn pixels_per_image(&self) -> usize {
        let (c, h, w) = self.kind.image_shape();
        c * h * w
    }
}

/// Gather `indices` into `(B, C, H, W)` F32 images and `(B,)` U32 labels.
pub fn batch_to_tensors(
    ds: &ImageDataset,
    indices: &[usize],
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let (c, h, w) = ds.kind.image_shape();
    let per = c * h * w;
    let mut pixels = Vec::with_capacity(indices.len() * per);
    let mut labels = Vec::with_capacity(indices.len());
    for &i in indices {
        pixels.extend_from_slice(&ds.images[i * per..(i + 1) * per]);
        labels.push(ds.labels[i]);
    }
    let b = indices.len();
    let images = Tensor::from_vec(pixels, (b, c, h, w), device)?;
    let labels = Tensor::from_vec(labels, b, device)?;
    Ok((images, labels))
}

// ── File formats ────────────────────────────────────────────────────────────

/// Resolve `name` or `name.gz` inside `dir`.
fn find_file(dir: &Path, name: &str) -> AnyhowResult<PathBuf> {
    let plain = dir.join(name);
    if plain.is_file() {
        return Ok(plain);
    }
    let gz = dir.join(format!("{name}.gz"));
    if gz.is_file() {
        return Ok(gz);
    }
    anyhow::bail!("missing {} (or .gz) in {}", name, dir.display())
}

fn read_bytes(path: &Path) -> AnyhowResult<Vec<u8>> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = Vec::new();
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        GzDecoder::new(file)
            .read_to_end(&mut buf)
            .with_context(|| format!("decompress {}", path.display()))?;
    } else {
        file.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_idx_images(path: &Path) -> AnyhowResult<Vec<f32>> {
    let buf = read_bytes(path)?;
    parse_idx_images(&buf).with_context(|| format!("parse {}", path.display()))
}

fn read_idx_labels(path: &Path) -> AnyhowResult<Vec<u32>> {
    let buf = read_bytes(path)?;
    parse_idx_labels(&buf).with_context(|| format!("parse {}", path.display()))
}

fn parse_idx_images(buf: &[u8]) -> AnyhowResult<Vec<f32>> {
    if buf.len() < 16 {
        anyhow::bail!("idx image file too small ({} bytes)", buf.len());
    }
    let magic = be_u32(buf, 0);
    if magic != IDX_IMAGES_MAGIC {
        anyhow::bail!("invalid idx image magic {magic:#x}");
    }
    let n = be_u32(buf, 4) as usize;
    let rows = be_u32(buf, 8) as usize;
    let cols = be_u32(buf, 12) as usize;
    let body = &buf[16..];
    let expected = n
        .checked_mul(rows)
        .and_then(|v| v.checked_mul(cols))
        .with_context(|| format!("idx image header {n}x{rows}x{cols} overflows"))?;
    if body.len() != expected {
        anyhow::bail!(
            "idx image body has {} bytes, header says {}x{}x{}",
            body.len(),
            n,
            rows,
            cols
        );
    }
    Ok(body.iter().map(|&p| p as f32 / 255.0).collect())
}

fn parse_idx_labels(buf: &[u8]) -> AnyhowResult<Vec<u32>> {
    if buf.len() < 8 {
        anyhow::bail!("idx label file too small ({} bytes)", buf.len());
    }
    let magic = be_u32(buf, 0);
    if magic != IDX_LABELS_MAGIC {
        anyhow::bail!("invalid idx label magic {magic:#x}");
    }
    let n = be_u32(buf, 4) as usize;
    let body = &buf[8..];
    if body.len() != n {
        anyhow::bail!("idx label body has {} bytes, header says {}", body.len(), n);
    }
    Ok(body.iter().map(|&l| l as u32).collect())
}

/// Fixed-size records: `label_bytes` label bytes then 3×32×32 channel-major pixels.
fn read_cifar_records(
    files: &[PathBuf],
    label_bytes: usize,
    label_index: usize,
) -> AnyhowResult<(Vec<f32>, Vec<u32>)> {
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for path in files {
        let buf = read_bytes(path)?;
        parse_cifar_records(&buf, label_bytes, label_index, &mut images, &mut labels)
            .with_context(|| format!("parse {}", path.display()))?;
    }
    Ok((images, labels))
}

/// SVHN stores digit 0 as class 10.
fn svhn_labels(labels: &mut [u32]) {
    for label in labels.iter_mut().filter(|l| **l == 10) {
        *label = 0;
    }
}

fn parse_cifar_records(
    buf: &[u8],
    label_bytes: usize,
    label_index: usize,
    images: &mut Vec<f32>,
    labels: &mut Vec<u32>,
) -> AnyhowResult<()> {
    const PIXELS: usize = 3 * 32 * 32;
    let record = label_bytes + PIXELS;
    if buf.len() % record != 0 {
        anyhow::bail!("{} bytes is not a multiple of the {record}-byte record", buf.len());
    }
    for rec in buf.chunks_exact(record) {
        labels.push(rec[label_index] as u32);
        images.extend(rec[label_bytes..].iter().map(|&p| p as f32 / 255.0));
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
