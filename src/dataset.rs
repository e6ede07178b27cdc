//! Synthetic activation batches built from a known sparse code
//!
//! Each row of a batch is `Σ_i code[i] * strength[i] * feature[i]` where the
//! code is sparse. Two sampling modes:
//!
//! - **Independent**: component `i` fires with probability
//!   `decay^i * feature_num_nonzero / n_components`.
//! - **Correlated**: a Gaussian latent drawn with the [`CorrelationMatrix`] is
//!   mapped through the standard normal CDF, decayed, and rescaled so the mean
//!   probability equals the target sparsity. Probabilities that end up above 1
//!   are clamped before thresholding.
//!
//! In both modes a row that comes out all-zero gets one random component
//! forced on with coefficient 1.0.

use anyhow::Result;
use candle_core::{Device, Tensor};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::config::GeneratorConfig;
use crate::synthetic::{
    generate_correlation_matrix, generate_feature_bank, CorrelationMatrix, FeatureBank,
};

/// Anything that can feed activation batches to the training loop.
pub trait ActivationSource {
    /// Next `[batch, activation_dim]` batch. Sources never run dry.
    fn next_batch(&mut self) -> Result<Tensor>;

    fn activation_dim(&self) -> usize;

    /// Ground-truth features, when the data was generated from known ones.
    fn ground_truth(&self) -> Option<&Tensor> {
        None
    }
}

/// One generated batch together with its implied sparse code
#[derive(Debug, Clone)]
pub struct SyntheticBatch {
    /// `[batch, n_components]`, before the feature-strength scaling
    pub codes: Tensor,
    /// `[batch, activation_dim]`
    pub data: Tensor,
}

#[derive(Debug, Clone)]
enum SamplingMode {
    Independent { component_probs: Vec<f64> },
    Correlated { corr: CorrelationMatrix },
}

/// Immutable generator of synthetic activation batches.
///
/// Shared read-only across all cells of a sweep; randomness lives in the
/// caller's RNG (or in a [`SyntheticStream`]), never in the generator.
#[derive(Debug, Clone)]
pub struct DatasetGenerator {
    config: GeneratorConfig,
    bank: FeatureBank,
    decay: Vec<f64>,
    mode: SamplingMode,
}

impl DatasetGenerator {
    pub fn new(config: GeneratorConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let n = config.n_ground_truth_components;
        let decay = decay_profile(n, config.feature_prob_decay);
        let mode = if config.correlated {
            SamplingMode::Correlated {
                corr: generate_correlation_matrix(n, config.seed.wrapping_add(1))?,
            }
        } else {
            SamplingMode::Independent {
                component_probs: independent_component_probs(&decay, config.frac_nonzero()),
            }
        };
        let bank = generate_feature_bank(config.activation_dim, n, config.seed, device)?;
        debug!(
            "Dataset generator: {} components in {} dims, correlated={}",
            n, config.activation_dim, config.correlated
        );
        Ok(Self {
            config,
            bank,
            decay,
            mode,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn feature_bank(&self) -> &FeatureBank {
        &self.bank
    }

    pub fn correlation_matrix(&self) -> Option<&CorrelationMatrix> {
        match &self.mode {
            SamplingMode::Correlated { corr } => Some(corr),
            SamplingMode::Independent { .. } => None,
        }
    }

    /// Generate one batch using the caller's RNG.
    pub fn next_batch<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SyntheticBatch> {
        let n = self.config.n_ground_truth_components;
        let batch_size = self.config.batch_size;
        match &self.mode {
            SamplingMode::Independent { component_probs } => {
                generate_rand_dataset(n, batch_size, component_probs, &self.bank, rng)
            }
            SamplingMode::Correlated { corr } => generate_correlated_dataset(
                n,
                batch_size,
                corr,
                &self.bank,
                self.config.frac_nonzero(),
                &self.decay,
                rng,
            ),
        }
    }

    /// A seeded, restartable stream of batches over this generator.
    pub fn stream(&self, seed: u64) -> SyntheticStream<'_> {
        SyntheticStream {
            generator: self,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// [`ActivationSource`] pairing a shared generator with its own RNG
pub struct SyntheticStream<'a> {
    generator: &'a DatasetGenerator,
    rng: StdRng,
}

impl ActivationSource for SyntheticStream<'_> {
    fn next_batch(&mut self) -> Result<Tensor> {
        Ok(self.generator.next_batch(&mut self.rng)?.data)
    }

    fn activation_dim(&self) -> usize {
        self.generator.config.activation_dim
    }

    fn ground_truth(&self) -> Option<&Tensor> {
        Some(self.generator.bank.features())
    }
}

/// Moves every batch of `inner` onto `device`.
pub struct OnDevice<S> {
    inner: S,
    device: Device,
}

impl<S: ActivationSource> OnDevice<S> {
    pub fn new(inner: S, device: Device) -> Self {
        Self { inner, device }
    }
}

impl<S: ActivationSource> ActivationSource for OnDevice<S> {
    fn next_batch(&mut self) -> Result<Tensor> {
        Ok(self.inner.next_batch()?.to_device(&self.device)?)
    }

    fn activation_dim(&self) -> usize {
        self.inner.activation_dim()
    }

    fn ground_truth(&self) -> Option<&Tensor> {
        self.inner.ground_truth()
    }
}

/// `decay^i` for each component index
pub fn decay_profile(n_components: usize, feature_prob_decay: f64) -> Vec<f64> {
    (0..n_components)
        .map(|i| feature_prob_decay.powi(i as i32))
        .collect()
}

/// Independent-mode inclusion probabilities, clamped to `[0, 1]`.
pub fn independent_component_probs(decay: &[f64], frac_nonzero: f64) -> Vec<f64> {
    let mut probs: Vec<f64> = decay.iter().map(|d| d * frac_nonzero).collect();
    clamp_probabilities(&mut probs);
    probs
}

/// Correlated-mode probabilities before clamping: `Φ(latent) * decay`, rescaled
/// so that the mean over all components equals `frac_nonzero` exactly.
pub fn correlated_component_probs(
    latent: &DVector<f64>,
    decay: &[f64],
    frac_nonzero: f64,
) -> Result<Vec<f64>> {
    anyhow::ensure!(
        latent.len() == decay.len(),
        "Latent has {} components but decay profile has {}",
        latent.len(),
        decay.len()
    );
    let normal = Normal::new(0.0, 1.0)?;
    let mut probs: Vec<f64> = latent
        .iter()
        .zip(decay)
        .map(|(z, d)| normal.cdf(*z) * d)
        .collect();
    let mean_prob = probs.iter().sum::<f64>() / probs.len() as f64;
    anyhow::ensure!(
        mean_prob > 0.0,
        "Correlated component probabilities collapsed to zero"
    );
    let scaler = frac_nonzero / mean_prob;
    for p in &mut probs {
        *p *= scaler;
    }
    Ok(probs)
}

/// Clip every probability into `[0, 1]` so it is a valid Bernoulli threshold.
pub fn clamp_probabilities(probs: &mut [f64]) {
    for p in probs.iter_mut() {
        *p = p.clamp(0.0, 1.0);
    }
}

/// Threshold uniform draws against `probs`, give survivors a uniform
/// magnitude, and repair empty rows. Returns a row-major `[batch, n]` code.
fn sample_codes<R: Rng + ?Sized>(batch_size: usize, probs: &[f64], rng: &mut R) -> Vec<f32> {
    let n = probs.len();
    let thresh: Vec<f64> = (0..batch_size * n).map(|_| rng.gen::<f64>()).collect();
    let values: Vec<f32> = (0..batch_size * n).map(|_| rng.gen::<f32>()).collect();

    let mut codes: Vec<f32> = thresh
        .iter()
        .zip(values)
        .enumerate()
        .map(|(idx, (t, v))| if *t <= probs[idx % n] { v } else { 0.0 })
        .collect();

    let mut repaired = 0usize;
    for row in codes.chunks_mut(n) {
        if row.iter().all(|&c| c == 0.0) {
            row[rng.gen_range(0..n)] = 1.0;
            repaired += 1;
        }
    }
    if repaired > 0 {
        debug!("Forced one active component in {repaired} empty rows");
    }
    codes
}

/// Scale codes by a fresh uniform strength matrix and project through the bank.
fn synthesize<R: Rng + ?Sized>(
    codes: Vec<f32>,
    batch_size: usize,
    bank: &FeatureBank,
    rng: &mut R,
) -> Result<SyntheticBatch> {
    let n = bank.n_components();
    let weighted: Vec<f32> = codes.iter().map(|c| c * rng.gen::<f32>()).collect();
    let device = bank.features().device();
    let weighted = Tensor::from_vec(weighted, (batch_size, n), device)?;
    let data = weighted.matmul(bank.features())?;
    let codes = Tensor::from_vec(codes, (batch_size, n), device)?;
    Ok(SyntheticBatch { codes, data })
}

/// Independent-mode batch.
pub fn generate_rand_dataset<R: Rng + ?Sized>(
    n_components: usize,
    batch_size: usize,
    component_probs: &[f64],
    bank: &FeatureBank,
    rng: &mut R,
) -> Result<SyntheticBatch> {
    anyhow::ensure!(
        component_probs.len() == n_components && bank.n_components() == n_components,
        "Component count mismatch: probs={}, bank={}, expected {n_components}",
        component_probs.len(),
        bank.n_components()
    );
    let codes = sample_codes(batch_size, component_probs, rng);
    synthesize(codes, batch_size, bank, rng)
}

/// Correlated-mode batch. One latent vector is drawn per batch; its
/// probabilities are shared by every row.
pub fn generate_correlated_dataset<R: Rng + ?Sized>(
    n_components: usize,
    batch_size: usize,
    corr: &CorrelationMatrix,
    bank: &FeatureBank,
    frac_nonzero: f64,
    decay: &[f64],
    rng: &mut R,
) -> Result<SyntheticBatch> {
    anyhow::ensure!(
        corr.n_components() == n_components && bank.n_components() == n_components,
        "Component count mismatch: corr={}, bank={}, expected {n_components}",
        corr.n_components(),
        bank.n_components()
    );
    let latent = corr.sample(rng);
    let mut probs = correlated_component_probs(&latent, decay, frac_nonzero)?;
    clamp_probabilities(&mut probs);
    let codes = sample_codes(batch_size, &probs, rng);
    synthesize(codes, batch_size, bank, rng)
}
