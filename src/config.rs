//! Typed configuration for data generation, training and sweeps
//!
//! Every knob is a named field with a default; the resolved configuration
//! is written next to sweep outputs as `config.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::autoencoder::DictKind;

/// Synthetic activation generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Dimension of each activation vector
    pub activation_dim: usize,
    /// Number of ground-truth features in the bank
    pub n_ground_truth_components: usize,
    /// Rows per generated batch
    pub batch_size: usize,
    /// Expected number of active components per sample
    pub feature_num_nonzero: usize,
    /// Per-index decay of component inclusion probability
    pub feature_prob_decay: f64,
    /// Use Gaussian-copula correlated activation instead of independent draws
    pub correlated: bool,
    /// Seed for the feature bank and correlation matrix
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            activation_dim: 256,
            n_ground_truth_components: 512,
            batch_size: 256,
            feature_num_nonzero: 5,
            feature_prob_decay: 0.99,
            correlated: true,
            seed: 0,
        }
    }
}

impl GeneratorConfig {
    /// Target fraction of active components per sample
    pub fn frac_nonzero(&self) -> f64 {
        self.feature_num_nonzero as f64 / self.n_ground_truth_components as f64
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.activation_dim > 0, "activation_dim must be positive");
        anyhow::ensure!(
            self.n_ground_truth_components > 0,
            "n_ground_truth_components must be positive"
        );
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(
            self.feature_num_nonzero <= self.n_ground_truth_components,
            "feature_num_nonzero ({}) exceeds n_ground_truth_components ({})",
            self.feature_num_nonzero,
            self.n_ground_truth_components
        );
        anyhow::ensure!(
            self.feature_prob_decay > 0.0 && self.feature_prob_decay <= 1.0,
            "feature_prob_decay must lie in (0, 1], got {}",
            self.feature_prob_decay
        );
        Ok(())
    }
}

/// Single-model training settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of optimizer steps per training call
    pub n_steps: usize,
    /// L1 penalty coefficient
    pub l1_alpha: f64,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Horizon of the exponentially weighted running losses
    /// (10 for synthetic runs, 1000 for real data)
    pub horizon: usize,
    /// Steps between diagnostics
    pub log_every: usize,
    /// Stop after this many steps (0 = no cap)
    pub max_steps: usize,
    /// Std of Gaussian noise added to each training batch
    pub noise_level: f64,
    /// Seed for the noise stream
    pub seed: u64,
    /// Steps already completed by earlier calls; diagnostics use the global
    /// step count `start_step + local_step`
    #[serde(default)]
    pub start_step: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_steps: 10_000,
            l1_alpha: 0.1,
            learning_rate: 1e-3,
            horizon: 10,
            log_every: 1000,
            max_steps: 0,
            noise_level: 0.0,
            seed: 0,
            start_step: 0,
        }
    }
}

impl TrainConfig {
    /// Steps actually executed once the optional cap is applied
    pub fn effective_steps(&self) -> usize {
        if self.max_steps > 0 {
            self.n_steps.min(self.max_steps)
        } else {
            self.n_steps
        }
    }
}

/// Where sweep cells draw their activations from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DataMode {
    /// One shared synthetic generator for the whole sweep
    Synthetic(GeneratorConfig),
    /// Numbered safetensors chunks produced from a host model
    Chunks {
        dataset_dir: PathBuf,
        batch_size: usize,
        /// Discard and regenerate the chunk cache between mini-runs
        refresh_data: bool,
    },
}

/// Grid sweep over (L1 coefficient x dictionary size)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub data: DataMode,
    pub train: TrainConfig,
    /// Dictionary variant trained in every cell
    pub kind: DictKind,
    pub l1_exp_base: f64,
    pub l1_exp_low: i32,
    /// Exclusive
    pub l1_exp_high: i32,
    pub dict_ratio_exp_base: f64,
    pub dict_ratio_exp_low: i32,
    /// Exclusive
    pub dict_ratio_exp_high: i32,
    /// Repetitions of the whole grid
    pub mini_runs: usize,
    /// Similarity above which a matched pair counts as the same feature
    pub threshold: f64,
    /// Checkpoint to resume cells from
    pub load_checkpoint: Option<PathBuf>,
    pub outputs_folder: PathBuf,
    /// Batches used to estimate dead features after synthetic runs
    pub dead_feature_batches: usize,
    pub seed: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            data: DataMode::Synthetic(GeneratorConfig::default()),
            train: TrainConfig::default(),
            kind: DictKind::Untied,
            l1_exp_base: 10f64.powf(0.25),
            l1_exp_low: -12,
            l1_exp_high: -11,
            dict_ratio_exp_base: 2.0,
            dict_ratio_exp_low: 1,
            dict_ratio_exp_high: 7,
            mini_runs: 1,
            threshold: 0.9,
            load_checkpoint: None,
            outputs_folder: PathBuf::from("outputs"),
            dead_feature_batches: 10,
            seed: 0,
        }
    }
}

impl SweepConfig {
    /// `l1_range[i] = l1_exp_base ^ (l1_exp_low + i)`
    pub fn l1_range(&self) -> Vec<f64> {
        (self.l1_exp_low..self.l1_exp_high)
            .map(|exp| self.l1_exp_base.powi(exp))
            .collect()
    }

    /// `dict_sizes[j] = activation_dim * dict_ratio_exp_base ^ (dict_ratio_exp_low + j)`
    pub fn dict_sizes(&self, activation_dim: usize) -> Vec<usize> {
        (self.dict_ratio_exp_low..self.dict_ratio_exp_high)
            .map(|exp| (activation_dim as f64 * self.dict_ratio_exp_base.powi(exp)) as usize)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.l1_exp_low < self.l1_exp_high,
            "empty L1 range: [{}, {})",
            self.l1_exp_low,
            self.l1_exp_high
        );
        anyhow::ensure!(
            self.dict_ratio_exp_low < self.dict_ratio_exp_high,
            "empty dictionary ratio range: [{}, {})",
            self.dict_ratio_exp_low,
            self.dict_ratio_exp_high
        );
        anyhow::ensure!(self.mini_runs > 0, "mini_runs must be at least 1");
        anyhow::ensure!(self.train.log_every > 0, "log_every must be positive");
        anyhow::ensure!(self.train.horizon > 0, "horizon must be positive");
        match &self.data {
            DataMode::Synthetic(gen) => gen.validate()?,
            DataMode::Chunks { batch_size, .. } => {
                anyhow::ensure!(*batch_size > 0, "batch_size must be positive");
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid_axes() {
        let config = SweepConfig::default();
        let l1 = config.l1_range();
        assert_eq!(l1.len(), 1);
        assert!((l1[0] - 1e-3).abs() < 1e-12);

        let sizes = config.dict_sizes(32);
        assert_eq!(sizes, vec![64, 128, 256, 512, 1024, 2048]);
    }

    #[test]
    fn test_l1_range_exponents() {
        let config = SweepConfig {
            l1_exp_base: 10.0,
            l1_exp_low: -3,
            l1_exp_high: 0,
            ..Default::default()
        };
        let l1 = config.l1_range();
        assert_eq!(l1.len(), 3);
        assert!((l1[0] - 1e-3).abs() < 1e-15);
        assert!((l1[2] - 1e-1).abs() < 1e-15);
    }

    #[test]
    fn test_fractional_dict_ratio() {
        let config = SweepConfig {
            dict_ratio_exp_low: -1,
            dict_ratio_exp_high: 1,
            ..Default::default()
        };
        assert_eq!(config.dict_sizes(16), vec![8, 16]);
    }

    #[test]
    fn test_validate_rejects_empty_ranges() {
        let config = SweepConfig {
            l1_exp_low: 2,
            l1_exp_high: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(SweepConfig::default().validate().is_ok());
    }

    #[test]
    fn test_generator_validate() {
        let config = GeneratorConfig {
            feature_num_nonzero: 10,
            n_ground_truth_components: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!((GeneratorConfig::default().frac_nonzero() - 5.0 / 512.0).abs() < 1e-12);
    }

    #[test]
    fn test_effective_steps() {
        let mut train = TrainConfig {
            n_steps: 500,
            ..Default::default()
        };
        assert_eq!(train.effective_steps(), 500);
        train.max_steps = 100;
        assert_eq!(train.effective_steps(), 100);
    }

    #[test]
    fn test_config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = SweepConfig {
            mini_runs: 3,
            kind: DictKind::Tied { norm_encoder: true },
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = SweepConfig::load(&path).unwrap();
        assert_eq!(loaded.mini_runs, 3);
        assert_eq!(loaded.kind, DictKind::Tied { norm_encoder: true });
    }
}
