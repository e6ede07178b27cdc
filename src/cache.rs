//! On-disk activation chunk cache
//!
//! A dataset directory holds `0.safetensors`, `1.safetensors`, ... each with a
//! single `activations` tensor of shape `(n_samples, activation_dim)`. Chunks
//! are written once by the extraction step and read many times by training.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::checkpoint::{read_f32, write_tensors};
use crate::dataset::ActivationSource;

/// Tensor name inside every chunk file
pub const ACTIVATIONS_TENSOR: &str = "activations";

pub fn chunk_path(dataset_dir: &Path, index: usize) -> PathBuf {
    dataset_dir.join(format!("{index}.safetensors"))
}

/// Write `activations` (`[n, activation_dim]`) as chunk `index`.
pub fn write_chunk(dataset_dir: &Path, index: usize, activations: &Tensor) -> Result<PathBuf> {
    let (n, _) = activations.dims2()?;
    anyhow::ensure!(n > 0, "Refusing to write an empty chunk");
    std::fs::create_dir_all(dataset_dir)
        .with_context(|| format!("Failed to create {}", dataset_dir.display()))?;
    let path = chunk_path(dataset_dir, index);
    write_tensors(
        &path,
        &[(ACTIVATIONS_TENSOR.to_string(), activations.clone())],
        Default::default(),
    )?;
    debug!("Wrote chunk {} ({n} rows)", path.display());
    Ok(path)
}

/// Numbered chunk files in numeric order
pub fn chunk_paths(dataset_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dataset_dir)
        .with_context(|| format!("Failed to list {}", dataset_dir.display()))?;
    let mut numbered: Vec<(usize, PathBuf)> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
            continue;
        }
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(index) = index {
            numbered.push((index, path));
        }
    }
    numbered.sort_by_key(|(i, _)| *i);
    Ok(numbered.into_iter().map(|(_, p)| p).collect())
}

/// Load one chunk as F32 on `device`.
pub fn read_chunk(path: &Path, device: &Device) -> Result<Tensor> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read chunk {}", path.display()))?;
    let st = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to deserialize chunk {}", path.display()))?;
    let view = st
        .tensor(ACTIVATIONS_TENSOR)
        .with_context(|| format!("Chunk {} has no activations tensor", path.display()))?;
    anyhow::ensure!(
        view.shape().len() == 2,
        "Chunk {} must be 2-D, got shape {:?}",
        path.display(),
        view.shape()
    );
    read_f32(ACTIVATIONS_TENSOR, &view, device)
}

/// Activation dimension, read from the header of the first chunk.
pub fn read_activation_dim(dataset_dir: &Path) -> Result<usize> {
    let paths = chunk_paths(dataset_dir)?;
    let first = paths
        .first()
        .with_context(|| format!("No activation chunks in {}", dataset_dir.display()))?;
    let data = std::fs::read(first)
        .with_context(|| format!("Failed to read chunk {}", first.display()))?;
    let st = SafeTensors::deserialize(&data)?;
    let view = st.tensor(ACTIVATIONS_TENSOR)?;
    view.shape()
        .get(1)
        .copied()
        .with_context(|| format!("Chunk {} is not 2-D", first.display()))
}

/// Delete every numbered chunk; returns how many were removed.
pub fn clear_chunks(dataset_dir: &Path) -> Result<usize> {
    let paths = chunk_paths(dataset_dir)?;
    for path in &paths {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    info!(
        "Cleared {} chunks from {}",
        paths.len(),
        dataset_dir.display()
    );
    Ok(paths.len())
}

/// Regenerates the chunk cache between mini-runs. Implemented by the
/// host-model extraction code.
pub trait DatasetRefresher {
    fn refresh(&mut self, dataset_dir: &Path, mini_run: usize) -> Result<()>;
}

/// Endless shuffled batches over a chunk directory.
///
/// Each epoch visits chunks in a random order and rows within a chunk in a
/// random order. The last batch of a chunk may be short.
pub struct ChunkedActivations {
    paths: Vec<PathBuf>,
    batch_size: usize,
    activation_dim: usize,
    device: Device,
    rng: StdRng,
    chunk_order: Vec<usize>,
    next_chunk: usize,
    current: Option<Tensor>,
    row_order: Vec<u32>,
    next_row: usize,
}

impl ChunkedActivations {
    pub fn open(dataset_dir: &Path, batch_size: usize, device: &Device, seed: u64) -> Result<Self> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let paths = chunk_paths(dataset_dir)?;
        anyhow::ensure!(
            !paths.is_empty(),
            "No activation chunks in {}",
            dataset_dir.display()
        );
        let activation_dim = read_activation_dim(dataset_dir)?;
        debug!(
            "Chunked activations: {} chunks, dim {activation_dim}, batch {batch_size}",
            paths.len()
        );
        Ok(Self {
            paths,
            batch_size,
            activation_dim,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
            chunk_order: Vec::new(),
            next_chunk: 0,
            current: None,
            row_order: Vec::new(),
            next_row: 0,
        })
    }

    pub fn n_chunks(&self) -> usize {
        self.paths.len()
    }

    fn load_next_chunk(&mut self) -> Result<()> {
        if self.next_chunk >= self.chunk_order.len() {
            self.chunk_order = (0..self.paths.len()).collect();
            self.chunk_order.shuffle(&mut self.rng);
            self.next_chunk = 0;
        }
        let path = &self.paths[self.chunk_order[self.next_chunk]];
        self.next_chunk += 1;

        let chunk = read_chunk(path, &self.device)?;
        let (n, dim) = chunk.dims2()?;
        anyhow::ensure!(
            dim == self.activation_dim,
            "Chunk {} has dim {dim}, expected {}",
            path.display(),
            self.activation_dim
        );
        anyhow::ensure!(n > 0, "Chunk {} is empty", path.display());
        self.row_order = (0..n as u32).collect();
        self.row_order.shuffle(&mut self.rng);
        self.next_row = 0;
        self.current = Some(chunk);
        Ok(())
    }
}

impl ActivationSource for ChunkedActivations {
    fn next_batch(&mut self) -> Result<Tensor> {
        if self.current.is_none() || self.next_row >= self.row_order.len() {
            self.load_next_chunk()?;
        }
        let chunk = self.current.as_ref().context("No chunk loaded")?;
        let start = self.next_row;
        let end = (start + self.batch_size).min(self.row_order.len());
        self.next_row = end;
        let ids = Tensor::new(&self.row_order[start..end], &self.device)?;
        Ok(chunk.index_select(&ids, 0)?)
    }

    fn activation_dim(&self) -> usize {
        self.activation_dim
    }
}
