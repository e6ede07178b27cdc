//! L1 coefficient x dictionary size sweeps
//!
//! The grid is row-major: `l1_range` rows, `dict_sizes` columns. Every
//! mini-run trains every cell once, writes
//!
//! ```text
//! <outputs>/config.json
//! <outputs>/minirun<k>/autoencoders.safetensors
//! <outputs>/minirun<k>/metrics.json
//! <outputs>/minirun<k>/comparison.json   (only with >= 2 sizes)
//! ```
//!
//! and keeps the trained models for the next mini-run. A failing cell is
//! logged with its coordinates, gets empty (`null`) metrics, and the sweep
//! moves on. A cell whose model cannot even be built stays empty for the
//! whole sweep.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::autoencoder::{DictKind, SparseAutoencoder};
use crate::cache::{clear_chunks, read_activation_dim, ChunkedActivations, DatasetRefresher};
use crate::checkpoint::{checkpoint_key, load_models, save_models, CheckpointContents};
use crate::compare::{run_mmcs_with_larger, LargerDictComparison};
use crate::config::{DataMode, SweepConfig, TrainConfig};
use crate::dataset::{ActivationSource, DatasetGenerator, OnDevice};
use crate::pool::{run_job, run_jobs, CellJob, CellResult};
use crate::training::{count_dead_features, TrainOutcome};

/// Coordinates of one grid cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepCell {
    pub l1_index: usize,
    pub dict_index: usize,
    pub l1_alpha: f64,
    pub dict_size: usize,
}

/// One model slot per cell. A slot is empty when its model could not be
/// built.
pub struct SweepGrid {
    l1_range: Vec<f64>,
    dict_sizes: Vec<usize>,
    activation_dim: usize,
    kind: DictKind,
    models: Vec<Option<SparseAutoencoder>>,
}

impl SweepGrid {
    /// Fresh models for every cell; cell `k` (row-major) is seeded `seed + k`.
    /// A cell whose model fails to build is logged and left empty.
    pub fn new(
        l1_range: Vec<f64>,
        dict_sizes: Vec<usize>,
        activation_dim: usize,
        kind: DictKind,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        anyhow::ensure!(
            !l1_range.is_empty() && !dict_sizes.is_empty(),
            "Sweep grid needs at least one L1 value and one dictionary size"
        );
        anyhow::ensure!(
            dict_sizes.windows(2).all(|w| w[0] <= w[1]),
            "Dictionary sizes must be ascending: {dict_sizes:?}"
        );
        let mut grid = Self {
            l1_range,
            dict_sizes,
            activation_dim,
            kind,
            models: Vec::new(),
        };
        for (k, cell) in grid.cells().iter().enumerate() {
            let built = SparseAutoencoder::new(
                activation_dim,
                cell.dict_size,
                kind,
                cell.l1_alpha,
                device,
                seed.wrapping_add(k as u64),
            );
            let slot = match built {
                Ok(model) => Some(model),
                Err(e) => {
                    error!(
                        "Cell (l1_index={}, dict_index={}, l1={:e}, dict_size={}) \
                         could not be built: {e:#}",
                        cell.l1_index, cell.dict_index, cell.l1_alpha, cell.dict_size
                    );
                    None
                }
            };
            grid.models.push(slot);
        }
        Ok(grid)
    }

    pub fn l1_range(&self) -> &[f64] {
        &self.l1_range
    }

    pub fn dict_sizes(&self) -> &[usize] {
        &self.dict_sizes
    }

    pub fn activation_dim(&self) -> usize {
        self.activation_dim
    }

    /// Row-major cell list
    pub fn cells(&self) -> Vec<SweepCell> {
        let mut cells = Vec::with_capacity(self.l1_range.len() * self.dict_sizes.len());
        for (l1_index, &l1_alpha) in self.l1_range.iter().enumerate() {
            for (dict_index, &dict_size) in self.dict_sizes.iter().enumerate() {
                cells.push(SweepCell {
                    l1_index,
                    dict_index,
                    l1_alpha,
                    dict_size,
                });
            }
        }
        cells
    }

    fn flat_index(&self, cell: &SweepCell) -> usize {
        cell.l1_index * self.dict_sizes.len() + cell.dict_index
    }

    pub fn model(&self, l1_index: usize, dict_index: usize) -> Option<&SparseAutoencoder> {
        if l1_index >= self.l1_range.len() || dict_index >= self.dict_sizes.len() {
            return None;
        }
        self.models
            .get(l1_index * self.dict_sizes.len() + dict_index)
            .and_then(Option::as_ref)
    }

    /// Every built model, row-major
    pub fn models(&self) -> Vec<&SparseAutoencoder> {
        self.models.iter().flatten().collect()
    }

    /// Replace cells with checkpointed models that match both the L1
    /// coefficient and the dictionary size exactly. Unmatched entries and
    /// cells are reported and left as they are. Returns the number adopted.
    pub fn adopt_checkpoint(
        &mut self,
        contents: CheckpointContents,
        device: &Device,
    ) -> Result<usize> {
        anyhow::ensure!(
            contents.activation_dim == self.activation_dim,
            "Checkpoint activation_dim {} does not match the sweep's {}",
            contents.activation_dim,
            self.activation_dim
        );
        let cells = self.cells();
        let mut adopted = vec![false; self.models.len()];
        for model in contents.models {
            let key = checkpoint_key(model.l1_alpha(), model.n_dict_components());
            let slot = cells.iter().find(|c| {
                c.l1_alpha == model.l1_alpha() && c.dict_size == model.n_dict_components()
            });
            let Some(cell) = slot else {
                warn!("Checkpoint entry {key} matches no sweep cell; ignored");
                continue;
            };
            if model.kind() != self.kind {
                warn!(
                    "Checkpoint entry {key} is {:?} but the sweep trains {:?}; ignored",
                    model.kind(),
                    self.kind
                );
                continue;
            }
            let idx = self.flat_index(cell);
            self.models[idx] = Some(model.to_device(device)?);
            adopted[idx] = true;
        }
        for (cell, used) in cells.iter().zip(&adopted) {
            if !used {
                warn!(
                    "No checkpoint for l1={:e} dict_size={}; training from scratch",
                    cell.l1_alpha, cell.dict_size
                );
            }
        }
        let n = adopted.iter().filter(|&&a| a).count();
        info!("Resumed {n} of {} cells from checkpoint", self.models.len());
        Ok(n)
    }

    /// Current dictionaries as `[l1_index][dict_index]`, `None` for empty cells
    pub fn dictionaries(&self) -> Result<Vec<Vec<Option<Tensor>>>> {
        self.models
            .chunks(self.dict_sizes.len())
            .map(|row| {
                row.iter()
                    .map(|slot| slot.as_ref().map(SparseAutoencoder::learned_dict).transpose())
                    .collect()
            })
            .collect()
    }
}

/// Per-cell metrics for one mini-run, indexed `[l1_index][dict_index]`.
/// Failed cells hold `None` (written as `null`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniRunMetrics {
    pub mini_run: usize,
    /// Global step count at the end of this mini-run
    pub last_step: usize,
    pub l1_range: Vec<f64>,
    pub dict_sizes: Vec<usize>,
    pub dead_features: Vec<Vec<Option<usize>>>,
    pub reconstruction_loss: Vec<Vec<Option<f64>>>,
    pub l1_loss: Vec<Vec<Option<f64>>>,
    pub sparsity: Vec<Vec<Option<f64>>>,
    /// Only for synthetic data
    pub mmcs_with_ground_truth: Vec<Vec<Option<f64>>>,
    pub feature_activations: Vec<Vec<Vec<f64>>>,
    pub failed_cells: Vec<SweepCell>,
}

impl MiniRunMetrics {
    fn empty(mini_run: usize, last_step: usize, l1_range: &[f64], dict_sizes: &[usize]) -> Self {
        let none = vec![vec![None; dict_sizes.len()]; l1_range.len()];
        Self {
            mini_run,
            last_step,
            l1_range: l1_range.to_vec(),
            dict_sizes: dict_sizes.to_vec(),
            dead_features: vec![vec![None; dict_sizes.len()]; l1_range.len()],
            reconstruction_loss: none.clone(),
            l1_loss: none.clone(),
            sparsity: none.clone(),
            mmcs_with_ground_truth: none,
            feature_activations: vec![vec![Vec::new(); dict_sizes.len()]; l1_range.len()],
            failed_cells: Vec::new(),
        }
    }

    fn record(&mut self, cell: &SweepCell, outcome: TrainOutcome, dead_features: usize) {
        let (i, j) = (cell.l1_index, cell.dict_index);
        self.dead_features[i][j] = Some(dead_features);
        self.reconstruction_loss[i][j] = Some(outcome.running_recon_loss);
        self.l1_loss[i][j] = Some(outcome.running_l1_loss);
        self.sparsity[i][j] = Some(outcome.sparsity);
        self.mmcs_with_ground_truth[i][j] = outcome.mmcs;
        self.feature_activations[i][j] = outcome.feature_activations;
    }

    fn fail(&mut self, cell: SweepCell, reason: &str) {
        error!(
            "Mini-run {}: cell (l1_index={}, dict_index={}, l1={:e}, dict_size={}) \
             failed: {reason}",
            self.mini_run, cell.l1_index, cell.dict_index, cell.l1_alpha, cell.dict_size
        );
        self.failed_cells.push(cell);
    }
}

/// Everything a sweep produced
pub struct SweepOutcome {
    pub mini_runs: Vec<MiniRunMetrics>,
    /// `None` when only one dictionary size was swept
    pub comparisons: Vec<Option<LargerDictComparison>>,
    pub grid: SweepGrid,
}

/// Box an activation source for one cell on `device`.
fn open_source<'g>(
    generator: Option<&'g DatasetGenerator>,
    data: &DataMode,
    device: &Device,
    seed: u64,
) -> Result<Box<dyn ActivationSource + 'g>> {
    if let Some(gen) = generator {
        return Ok(Box::new(OnDevice::new(gen.stream(seed), device.clone())));
    }
    match data {
        DataMode::Chunks {
            dataset_dir,
            batch_size,
            ..
        } => Ok(Box::new(ChunkedActivations::open(dataset_dir, *batch_size, device, seed)?)),
        DataMode::Synthetic(_) => anyhow::bail!("Synthetic sweep without a generator"),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Drives training over the whole grid for every mini-run.
pub struct Sweep {
    config: SweepConfig,
    devices: Vec<Device>,
    refresher: Option<Box<dyn DatasetRefresher>>,
}

impl Sweep {
    /// `devices[0]` holds the grid between cells. More than one device turns
    /// on the worker pool.
    pub fn new(config: SweepConfig, devices: Vec<Device>) -> Result<Self> {
        config.validate()?;
        anyhow::ensure!(!devices.is_empty(), "Sweep needs at least one device");
        Ok(Self {
            config,
            devices,
            refresher: None,
        })
    }

    pub fn with_refresher(mut self, refresher: Box<dyn DatasetRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn mini_run_folder(&self, mini_run: usize) -> PathBuf {
        self.config
            .outputs_folder
            .join(format!("minirun{mini_run}"))
    }

    pub fn run(&mut self) -> Result<SweepOutcome> {
        let primary = self.devices[0].clone();
        let outputs = self.config.outputs_folder.clone();
        std::fs::create_dir_all(&outputs)
            .with_context(|| format!("Failed to create {}", outputs.display()))?;
        self.config.save(&outputs.join("config.json"))?;

        let data = self.config.data.clone();
        let generator = match &data {
            DataMode::Synthetic(gen_config) => {
                Some(DatasetGenerator::new(gen_config.clone(), &primary)?)
            }
            DataMode::Chunks { .. } => None,
        };
        let activation_dim = match (&generator, &data) {
            (Some(gen), _) => gen.config().activation_dim,
            (None, DataMode::Chunks { dataset_dir, .. }) => read_activation_dim(dataset_dir)?,
            (None, DataMode::Synthetic(_)) => anyhow::bail!("Synthetic sweep without a generator"),
        };

        let l1_range = self.config.l1_range();
        let dict_sizes = self.config.dict_sizes(activation_dim);
        let mut grid = SweepGrid::new(
            l1_range.clone(),
            dict_sizes.clone(),
            activation_dim,
            self.config.kind,
            &primary,
            self.config.seed,
        )?;
        if let Some(path) = &self.config.load_checkpoint {
            grid.adopt_checkpoint(load_models(path, &primary)?, &primary)?;
        }
        info!(
            "Sweep: {} L1 values x {} sizes {:?}, {} mini-runs, {} device(s)",
            l1_range.len(),
            dict_sizes.len(),
            dict_sizes,
            self.config.mini_runs,
            self.devices.len()
        );

        let steps_per_run = self.config.train.effective_steps();
        let mut completed_steps = self.config.train.start_step;
        let mut mini_runs = Vec::with_capacity(self.config.mini_runs);
        let mut comparisons = Vec::with_capacity(self.config.mini_runs);
        for mini_run in 0..self.config.mini_runs {
            let data_seed = self.config.seed.wrapping_add(mini_run as u64);
            let make_source = |_: &SweepCell, device: &Device| {
                open_source(generator.as_ref(), &data, device, data_seed)
            };

            let mut metrics = MiniRunMetrics::empty(
                mini_run,
                completed_steps + steps_per_run,
                &l1_range,
                &dict_sizes,
            );
            let cells = grid.cells();
            let mut jobs = Vec::with_capacity(cells.len());
            let slots = std::mem::take(&mut grid.models);
            for (k, (slot, cell)) in slots.into_iter().zip(&cells).enumerate() {
                let Some(model) = slot else {
                    metrics.fail(*cell, "no model (construction failed)");
                    continue;
                };
                jobs.push(CellJob {
                    cell: *cell,
                    model,
                    config: TrainConfig {
                        l1_alpha: cell.l1_alpha,
                        seed: self.config.train.seed.wrapping_add(k as u64),
                        start_step: completed_steps,
                        ..self.config.train.clone()
                    },
                });
            }
            info!(
                "Mini-run {}/{}: {} cells from step {completed_steps}",
                mini_run + 1,
                self.config.mini_runs,
                jobs.len()
            );

            let mut results: Vec<CellResult> = if self.devices.len() > 1 {
                run_jobs(jobs, &self.devices, make_source)?
            } else {
                jobs.into_iter()
                    .map(|job| run_job(job, &primary, &make_source))
                    .collect()
            };
            results.sort_by_key(|r| grid.flat_index(&r.cell));

            let mut models: Vec<Option<SparseAutoencoder>> = cells.iter().map(|_| None).collect();
            for result in results {
                let CellResult {
                    cell,
                    model,
                    outcome,
                } = result;
                let model = model.to_device(&primary)?;
                let dead = outcome.and_then(|outcome| match &generator {
                    Some(gen) => {
                        let mut fresh = gen.stream(data_seed.wrapping_add(1 << 32));
                        let dead = count_dead_features(
                            &model,
                            &mut fresh,
                            self.config.dead_feature_batches,
                        )?;
                        Ok((outcome, dead))
                    }
                    None => {
                        let dead = outcome.dead_features;
                        Ok((outcome, dead))
                    }
                });
                match dead {
                    Ok((outcome, dead)) => metrics.record(&cell, outcome, dead),
                    Err(e) => metrics.fail(cell, &format!("{e:#}")),
                }
                let idx = grid.flat_index(&cell);
                models[idx] = Some(model);
            }
            grid.models = models;
            completed_steps += steps_per_run;

            let comparison = if dict_sizes.len() >= 2 {
                Some(run_mmcs_with_larger(&grid.dictionaries()?, self.config.threshold)?)
            } else {
                info!("Only one dictionary size; skipping cross-size comparison");
                None
            };

            let folder = self.mini_run_folder(mini_run);
            std::fs::create_dir_all(&folder)
                .with_context(|| format!("Failed to create {}", folder.display()))?;
            let trained = grid.models();
            if trained.is_empty() {
                warn!("Mini-run {mini_run}: no cell has a model; nothing to checkpoint");
            } else {
                save_models(&folder.join("autoencoders.safetensors"), &trained)?;
            }
            write_json(&folder.join("metrics.json"), &metrics)?;
            if let Some(c) = &comparison {
                write_json(&folder.join("comparison.json"), c)?;
            }
            info!("Mini-run {mini_run} written to {}", folder.display());

            mini_runs.push(metrics);
            comparisons.push(comparison);

            if mini_run + 1 < self.config.mini_runs {
                self.refresh_dataset(&data, mini_run + 1)?;
            }
        }

        Ok(SweepOutcome {
            mini_runs,
            comparisons,
            grid,
        })
    }

    fn refresh_dataset(&mut self, data: &DataMode, next_mini_run: usize) -> Result<()> {
        let DataMode::Chunks {
            dataset_dir,
            refresh_data: true,
            ..
        } = data
        else {
            return Ok(());
        };
        match self.refresher.as_mut() {
            Some(refresher) => {
                clear_chunks(dataset_dir)?;
                refresher.refresh(dataset_dir, next_mini_run)?;
                info!("Refreshed activation chunks for mini-run {next_mini_run}");
            }
            None => warn!("refresh_data is set but no refresher is attached; reusing chunks"),
        }
        Ok(())
    }
}
