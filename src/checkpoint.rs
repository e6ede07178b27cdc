//! Safetensors checkpoints of sweep models
//!
//! One file holds every cell of a grid. Tensors are named
//! `<key>/encoder`, `<key>/encoder_bias` and (untied) `<key>/decoder`, where
//! `<key>` is [`checkpoint_key`]. The header metadata records the shared
//! `activation_dim` and the [`DictKind`] of each key as JSON.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::autoencoder::{DictKind, SparseAutoencoder};

const ACTIVATION_DIM_KEY: &str = "activation_dim";
const KIND_PREFIX: &str = "kind:";

/// `"l1=<l1>_dict_size=<n>"`. `l1` uses the shortest exponent form that
/// parses back to the identical `f64`.
pub fn checkpoint_key(l1_alpha: f64, dict_size: usize) -> String {
    format!("l1={l1_alpha:e}_dict_size={dict_size}")
}

/// Inverse of [`checkpoint_key`]
pub fn parse_checkpoint_key(key: &str) -> Result<(f64, usize)> {
    let rest = key
        .strip_prefix("l1=")
        .with_context(|| format!("Checkpoint key {key:?} does not start with l1="))?;
    let (l1, size) = rest
        .split_once("_dict_size=")
        .with_context(|| format!("Checkpoint key {key:?} has no _dict_size= part"))?;
    let l1: f64 = l1
        .parse()
        .with_context(|| format!("Bad l1 value in checkpoint key {key:?}"))?;
    let size: usize = size
        .parse()
        .with_context(|| format!("Bad dict_size in checkpoint key {key:?}"))?;
    Ok((l1, size))
}

/// Float storage types a checkpoint or chunk may use
fn float_dtype(dtype: safetensors::Dtype) -> Option<DType> {
    match dtype {
        safetensors::Dtype::F32 => Some(DType::F32),
        safetensors::Dtype::F16 => Some(DType::F16),
        safetensors::Dtype::BF16 => Some(DType::BF16),
        _ => None,
    }
}

/// Read a stored float tensor as F32 on `device`; `name` is for errors only.
pub(crate) fn read_f32(name: &str, view: &TensorView<'_>, device: &Device) -> Result<Tensor> {
    let stored = float_dtype(view.dtype())
        .with_context(|| format!("{name} is stored as {:?}, not a float", view.dtype()))?;
    let numel: usize = view.shape().iter().product();
    anyhow::ensure!(
        view.data().len() == numel * stored.size_in_bytes(),
        "{name} holds {} bytes for shape {:?}",
        view.data().len(),
        view.shape()
    );
    let raw = Tensor::from_raw_buffer(view.data(), stored, view.shape(), device)?;
    Ok(raw.to_dtype(DType::F32)?)
}

/// Write named tensors as little-endian F32 to one safetensors file.
pub(crate) fn write_tensors(
    path: &Path,
    tensors: &[(String, Tensor)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let values: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffers.push((name.clone(), tensor.dims().to_vec(), bytes));
    }
    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)
            .with_context(|| format!("Failed to build tensor view for {name}"))?;
        views.push((name.clone(), view));
    }
    safetensors::serialize_to_file(views, &Some(metadata), path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Save every model under its [`checkpoint_key`]. All models must share one
/// activation dimension and have distinct keys.
pub fn save_models(path: &Path, models: &[&SparseAutoencoder]) -> Result<()> {
    anyhow::ensure!(!models.is_empty(), "No models to checkpoint");
    let activation_dim = models[0].activation_dim();

    let mut tensors = Vec::new();
    let mut metadata = HashMap::new();
    metadata.insert(ACTIVATION_DIM_KEY.to_string(), activation_dim.to_string());
    for model in models {
        anyhow::ensure!(
            model.activation_dim() == activation_dim,
            "Mixed activation dims in one checkpoint: {} vs {activation_dim}",
            model.activation_dim()
        );
        let key = checkpoint_key(model.l1_alpha(), model.n_dict_components());
        let kind = serde_json::to_string(&model.kind())?;
        anyhow::ensure!(
            metadata.insert(format!("{KIND_PREFIX}{key}"), kind).is_none(),
            "Duplicate checkpoint key {key}"
        );
        for (name, tensor) in model.tensors() {
            tensors.push((format!("{key}/{name}"), tensor));
        }
    }

    write_tensors(path, &tensors, metadata)?;
    info!("Saved {} models to {}", models.len(), path.display());
    Ok(())
}

/// Models restored from a checkpoint file
pub struct CheckpointContents {
    pub activation_dim: usize,
    /// Ordered by checkpoint key
    pub models: Vec<SparseAutoencoder>,
}

pub fn load_models(path: &Path, device: &Device) -> Result<CheckpointContents> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let (_, header) = SafeTensors::read_metadata(&data)
        .with_context(|| format!("Failed to parse checkpoint header {}", path.display()))?;
    let metadata = header
        .metadata()
        .clone()
        .with_context(|| format!("Checkpoint {} has no metadata", path.display()))?;
    let st = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to deserialize checkpoint {}", path.display()))?;

    let activation_dim: usize = metadata
        .get(ACTIVATION_DIM_KEY)
        .context("Checkpoint metadata lacks activation_dim")?
        .parse()
        .context("Checkpoint activation_dim is not an integer")?;

    let kinds: BTreeMap<&str, &String> = metadata
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(KIND_PREFIX).map(|key| (key, v)))
        .collect();

    let mut models = Vec::with_capacity(kinds.len());
    for (key, kind_json) in kinds {
        let (l1_alpha, dict_size) = parse_checkpoint_key(key)?;
        let kind: DictKind = serde_json::from_str(kind_json)
            .with_context(|| format!("Bad variant metadata for {key}"))?;
        let load = |name: &str| -> Result<Tensor> {
            let full = format!("{key}/{name}");
            let view = st
                .tensor(&full)
                .with_context(|| format!("Checkpoint lacks {full}"))?;
            read_f32(&full, &view, device)
        };
        let decoder = match kind {
            DictKind::Untied => Some(load("decoder")?),
            DictKind::Tied { .. } => None,
        };
        let encoder = load("encoder")?;
        let bias = load("encoder_bias")?;
        let model = SparseAutoencoder::from_tensors(kind, l1_alpha, encoder, bias, decoder)?;
        anyhow::ensure!(
            model.n_dict_components() == dict_size && model.activation_dim() == activation_dim,
            "Checkpoint entry {key} has shape {}x{}, expected {dict_size}x{activation_dim}",
            model.n_dict_components(),
            model.activation_dim()
        );
        debug!("Loaded checkpoint entry {key}");
        models.push(model);
    }
    info!("Loaded {} models from {}", models.len(), path.display());
    Ok(CheckpointContents {
        activation_dim,
        models,
    })
}
