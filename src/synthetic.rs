//! Ground-truth feature space for synthetic sparse-coding benchmarks
//!
//! A [`FeatureBank`] is a fixed set of random unit-norm directions; the
//! optional [`CorrelationMatrix`] couples which of them fire together.

use anyhow::Result;
use candle_core::{Device, Tensor};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Ground-truth dictionary: `[n_components, activation_dim]`, unit-norm rows.
///
/// Immutable once generated. Cloning shares the underlying storage.
#[derive(Debug, Clone)]
pub struct FeatureBank {
    feats: Tensor,
}

impl FeatureBank {
    /// The `[n_components, activation_dim]` feature matrix
    pub fn features(&self) -> &Tensor {
        &self.feats
    }

    pub fn n_components(&self) -> usize {
        self.feats.dims()[0]
    }

    pub fn activation_dim(&self) -> usize {
        self.feats.dims()[1]
    }
}

/// Draw `n_components` samples from N(0, I) in `activation_dim` dimensions
/// and normalize each to unit L2 norm.
pub fn generate_feature_bank(
    activation_dim: usize,
    n_components: usize,
    seed: u64,
    device: &Device,
) -> Result<FeatureBank> {
    anyhow::ensure!(
        activation_dim > 0 && n_components > 0,
        "Feature bank needs positive dimensions, got {n_components}x{activation_dim}"
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data: Vec<f32> = Vec::with_capacity(n_components * activation_dim);
    for _ in 0..n_components {
        let row: Vec<f64> = (0..activation_dim)
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        data.extend(row.iter().map(|v| (v / norm) as f32));
    }
    let feats = Tensor::from_vec(data, (n_components, activation_dim), device)?;
    Ok(FeatureBank { feats })
}

/// Symmetric positive-semidefinite matrix coupling component activation.
///
/// Keeps an eigen-factor `V·sqrt(Λ)` so that multivariate normal draws are
/// a single matrix-vector product.
#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    matrix: DMatrix<f64>,
    eigenvalues: DVector<f64>,
    factor: DMatrix<f64>,
}

impl CorrelationMatrix {
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn n_components(&self) -> usize {
        self.matrix.nrows()
    }

    /// Eigenvalues of the (shifted) matrix
    pub fn eigenvalues(&self) -> &DVector<f64> {
        &self.eigenvalues
    }

    pub fn min_eigenvalue(&self) -> f64 {
        self.eigenvalues.min()
    }

    /// Draw one latent vector from N(0, Σ).
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let n = self.n_components();
        let z = DVector::from_iterator(n, (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)));
        &self.factor * z
    }
}

/// Symmetrize a uniform random matrix and, if its smallest eigenvalue is
/// negative, add `1.001 * |min_eigenvalue|` to the diagonal.
pub fn generate_correlation_matrix(n_components: usize, seed: u64) -> Result<CorrelationMatrix> {
    anyhow::ensure!(n_components > 0, "Correlation matrix needs at least one component");
    let mut rng = StdRng::seed_from_u64(seed);
    let raw = DMatrix::from_fn(n_components, n_components, |_, _| rng.gen::<f64>());
    let mut matrix = (&raw + raw.transpose()) * 0.5;

    let eigen = matrix.clone().symmetric_eigen();
    let min_eig = eigen.eigenvalues.min();
    let shift = if min_eig < 0.0 { -1.001 * min_eig } else { 0.0 };
    for i in 0..n_components {
        matrix[(i, i)] += shift;
    }

    // Shifting the diagonal moves every eigenvalue by the same amount and
    // leaves the eigenvectors unchanged.
    let eigenvalues = eigen.eigenvalues.map(|l| l + shift);
    let sqrt_diag = DMatrix::from_diagonal(&eigenvalues.map(|l| l.max(0.0).sqrt()));
    let factor = &eigen.eigenvectors * sqrt_diag;

    Ok(CorrelationMatrix {
        matrix,
        eigenvalues,
        factor,
    })
}
