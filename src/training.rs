//! Single-model training loop
//!
//! Each step: fetch a batch, optional additive noise, forward, loss,
//! backward, Adam step, then re-project the dictionary rows to unit norm.
//! Running averages use decay `(horizon - 1) / horizon` and are seeded by the
//! first batch. Whenever the global step (`start_step` plus the local step)
//! is a multiple of `log_every`, a [`Checkpoint`] records sparsity, dead
//! features, optimizer momentum, drift since the previous checkpoint and
//! (with ground truth) MMCS.

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::autoencoder::SparseAutoencoder;
use crate::compare::{check_feature_movement, mean_max_cosine_similarity};
use crate::config::TrainConfig;
use crate::dataset::ActivationSource;

/// Diagnostics captured every `log_every` steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Global step, counted across successive training calls
    pub step: usize,
    pub running_recon_loss: f64,
    pub running_l1_loss: f64,
    /// Mean number of nonzero codes per sample
    pub sparsity: f64,
    pub dead_features: usize,
    /// Sum of absolute values of Adam's first moment for the dictionary
    pub momentum_magnitude: f64,
    /// Mean `1 - cos` against the dictionary at the previous checkpoint
    pub feature_angle_shift: f64,
    pub mmcs: Option<f64>,
}

/// Final state of a training call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOutcome {
    /// Steps taken by this call
    pub steps: usize,
    /// Global step reached; pass it as the next call's `start_step`
    pub last_step: usize,
    pub running_recon_loss: f64,
    pub running_l1_loss: f64,
    pub sparsity: f64,
    /// Running mean activation of every dictionary feature
    pub feature_activations: Vec<f64>,
    pub dead_features: usize,
    pub mmcs: Option<f64>,
    pub history: Vec<Checkpoint>,
}

/// Exponentially weighted running statistics.
#[derive(Debug, Clone)]
pub struct RunningStats {
    decay: f64,
    initialized: bool,
    pub recon_loss: f64,
    pub l1_loss: f64,
    pub sparsity: f64,
    pub feature_activations: Vec<f64>,
}

impl RunningStats {
    pub fn new(horizon: usize, n_features: usize) -> Self {
        let horizon = horizon.max(1) as f64;
        Self {
            decay: (horizon - 1.0) / horizon,
            initialized: false,
            recon_loss: 0.0,
            l1_loss: 0.0,
            sparsity: 0.0,
            feature_activations: vec![0.0; n_features],
        }
    }

    pub fn update(&mut self, recon: f64, l1: f64, sparsity: f64, activations: &[f32]) {
        if !self.initialized {
            self.recon_loss = recon;
            self.l1_loss = l1;
            self.sparsity = sparsity;
            for (avg, a) in self.feature_activations.iter_mut().zip(activations) {
                *avg = f64::from(*a);
            }
            self.initialized = true;
            return;
        }
        let d = self.decay;
        self.recon_loss = d * self.recon_loss + (1.0 - d) * recon;
        self.l1_loss = d * self.l1_loss + (1.0 - d) * l1;
        self.sparsity = d * self.sparsity + (1.0 - d) * sparsity;
        for (avg, a) in self.feature_activations.iter_mut().zip(activations) {
            *avg = d * *avg + (1.0 - d) * f64::from(*a);
        }
    }

    /// Features whose running mean activation is exactly zero
    pub fn dead_features(&self) -> usize {
        self.feature_activations.iter().filter(|&&a| a == 0.0).count()
    }
}

/// Mirror of Adam's first moment for one parameter:
/// `m <- beta1 * m + (1 - beta1) * grad`, starting from zero.
struct FirstMoment {
    beta1: f64,
    moment: Option<Tensor>,
}

impl FirstMoment {
    fn new(beta1: f64) -> Self {
        Self {
            beta1,
            moment: None,
        }
    }

    fn update(&mut self, grad: &Tensor) -> Result<()> {
        let scaled = grad.affine(1.0 - self.beta1, 0.0)?;
        self.moment = Some(match &self.moment {
            Some(m) => (m.affine(self.beta1, 0.0)? + scaled)?,
            None => scaled,
        });
        Ok(())
    }

    fn magnitude(&self) -> Result<f64> {
        match &self.moment {
            Some(m) => Ok(f64::from(m.abs()?.sum_all()?.to_scalar::<f32>()?)),
            None => Ok(0.0),
        }
    }
}

/// Per-feature mean activation and mean nonzero count per row of a code batch.
fn code_statistics(codes: &Tensor) -> Result<(Vec<f32>, f64)> {
    let mean_activation: Vec<f32> = codes.mean(0)?.to_vec1()?;
    let sparsity = codes
        .ne(0f32)?
        .to_dtype(DType::F32)?
        .sum(1)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok((mean_activation, f64::from(sparsity)))
}

/// Train `model` on batches from `source` for `config.effective_steps()` steps.
pub fn train(
    model: &mut SparseAutoencoder,
    source: &mut dyn ActivationSource,
    config: &TrainConfig,
) -> Result<TrainOutcome> {
    anyhow::ensure!(
        source.activation_dim() == model.activation_dim(),
        "Data has {} dims but the model expects {}",
        source.activation_dim(),
        model.activation_dim()
    );
    anyhow::ensure!(config.log_every > 0, "log_every must be positive");
    model.set_l1_alpha(config.l1_alpha);

    let params = ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut momentum = FirstMoment::new(params.beta1);
    let mut optimizer = AdamW::new(model.vars(), params)?;
    let dictionary: Var = model.dictionary_var().clone();
    let noise = if config.noise_level > 0.0 {
        Some(Normal::new(0.0f32, config.noise_level as f32)?)
    } else {
        None
    };
    let mut noise_rng = StdRng::seed_from_u64(config.seed);

    let n_steps = config.effective_steps();
    let mut stats = RunningStats::new(config.horizon, model.n_dict_components());
    let mut previous_dict = model.learned_dict()?;
    let mut history = Vec::new();
    let mut last_mmcs = None;

    debug!(
        "Training {} features (l1={:e}) for {} steps from step {}",
        model.n_dict_components(),
        config.l1_alpha,
        n_steps,
        config.start_step
    );

    for local_step in 1..=n_steps {
        let step = config.start_step + local_step;
        let mut batch = source.next_batch()?.to_dtype(DType::F32)?;
        if let Some(dist) = &noise {
            let len = batch.elem_count();
            let draws: Vec<f32> = (0..len).map(|_| dist.sample(&mut noise_rng)).collect();
            let noise_t = Tensor::from_vec(draws, batch.shape().clone(), batch.device())?;
            batch = (batch + noise_t)?;
        }

        let terms = model.loss(&batch)?;
        let grads = terms.total.backward()?;
        if let Some(grad) = grads.get(dictionary.as_tensor()) {
            momentum.update(grad)?;
        }
        optimizer.step(&grads)?;
        model.normalize_dictionary()?;

        let (activations, sparsity) = code_statistics(&terms.codes)?;
        stats.update(
            f64::from(terms.reconstruction),
            f64::from(terms.l1),
            sparsity,
            &activations,
        );

        if step % config.log_every == 0 {
            let dict = model.learned_dict()?;
            let feature_angle_shift = check_feature_movement(&previous_dict, &dict)?;
            let mmcs = match source.ground_truth() {
                Some(gt) => Some(mean_max_cosine_similarity(gt, &dict)?),
                None => None,
            };
            last_mmcs = mmcs.or(last_mmcs);
            let checkpoint = Checkpoint {
                step,
                running_recon_loss: stats.recon_loss,
                running_l1_loss: stats.l1_loss,
                sparsity: stats.sparsity,
                dead_features: stats.dead_features(),
                momentum_magnitude: momentum.magnitude()?,
                feature_angle_shift,
                mmcs,
            };
            let mmcs_note = mmcs.map(|m| format!(" | mmcs {m:.4}")).unwrap_or_default();
            info!(
                "step {:6} | recon {:.6} | l1 {:.6} | sparsity {:.2} | dead {}{mmcs_note}",
                step,
                checkpoint.running_recon_loss,
                checkpoint.running_l1_loss,
                checkpoint.sparsity,
                checkpoint.dead_features
            );
            debug!(
                "step {:6} | momentum {:.4} | shift {:.4}",
                step, checkpoint.momentum_magnitude, checkpoint.feature_angle_shift
            );
            history.push(checkpoint);
            previous_dict = dict;
        }
    }

    if let Some(gt) = source.ground_truth() {
        last_mmcs = Some(mean_max_cosine_similarity(gt, &model.learned_dict()?)?);
    }

    Ok(TrainOutcome {
        steps: n_steps,
        last_step: config.start_step + n_steps,
        running_recon_loss: stats.recon_loss,
        running_l1_loss: stats.l1_loss,
        sparsity: stats.sparsity,
        dead_features: stats.dead_features(),
        feature_activations: stats.feature_activations,
        mmcs: last_mmcs,
        history,
    })
}

/// Count features that never fire over `n_batches` fresh batches.
pub fn count_dead_features(
    model: &SparseAutoencoder,
    source: &mut dyn ActivationSource,
    n_batches: usize,
) -> Result<usize> {
    anyhow::ensure!(n_batches > 0, "Need at least one batch to count dead features");
    let lens = model.to_lens()?;
    let mut totals = vec![0f64; model.n_dict_components()];
    for _ in 0..n_batches {
        let batch = source.next_batch()?.to_device(lens.device())?;
        let codes = lens.encode(&batch)?;
        let sums: Vec<f32> = codes.sum(0)?.to_vec1()?;
        for (t, s) in totals.iter_mut().zip(sums) {
            *t += f64::from(s);
        }
    }
    Ok(totals.iter().filter(|&&t| t == 0.0).count())
}
