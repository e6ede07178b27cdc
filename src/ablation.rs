//! Feature ablation and erasure over a trained dictionary
//!
//! ## Resampling ablation
//!
//! For the selected features `F` and replacement codes `c'` (zeros when none
//! are given):
//!
//! - **Reconstruction**: `decode(c)` with `c[F]` replaced by `c'[F]`
//! - **PartialAblation**: `x + decode((c' - c)[F])`, the residual the
//!   dictionary misses is kept
//! - **FullAblation**: like partial, but `c` is the plain projection
//!   `x · d_f` onto each dictionary row instead of the encoder output
//!
//! Rows whose mask entry is `false` come back unchanged.
//!
//! ## Nullspace projection
//!
//! [`NullspaceProjector`] removes one direction: `x - (x · n) n`.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};

use crate::learned_dict::InferenceLens;

/// What to do with the selected features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AblationKind {
    Reconstruction,
    PartialAblation,
    FullAblation,
}

/// Projects activations onto the orthogonal complement of one direction.
#[derive(Debug, Clone)]
pub struct NullspaceProjector {
    direction: Tensor, // unit, [activation_dim]
}

impl NullspaceProjector {
    pub fn new(direction: &Tensor) -> Result<Self> {
        anyhow::ensure!(
            direction.rank() == 1,
            "Nullspace direction must be a vector, got shape {:?}",
            direction.dims()
        );
        let direction = direction.to_dtype(DType::F32)?;
        let norm = direction.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        anyhow::ensure!(norm > 0.0, "Nullspace direction has zero norm");
        Ok(Self {
            direction: (direction / f64::from(norm))?,
        })
    }

    /// Direction separating two classes: `mean(x | true) - mean(x | false)`.
    pub fn from_class_means(activations: &Tensor, labels: &[bool]) -> Result<Self> {
        let (n, _) = activations.dims2()?;
        anyhow::ensure!(
            labels.len() == n,
            "{} labels for {n} activation rows",
            labels.len()
        );
        let pick = |class: bool| -> Result<Tensor> {
            let ids: Vec<u32> = labels
                .iter()
                .enumerate()
                .filter(|(_, &l)| l == class)
                .map(|(i, _)| i as u32)
                .collect();
            anyhow::ensure!(!ids.is_empty(), "No activations labelled {class}");
            let ids = Tensor::new(ids.as_slice(), activations.device())?;
            Ok(activations
                .to_dtype(DType::F32)?
                .index_select(&ids, 0)?
                .mean(0)?)
        };
        Self::new(&(pick(true)? - pick(false)?)?)
    }

    pub fn direction(&self) -> &Tensor {
        &self.direction
    }

    /// `x - (x · n) n` on the last dimension of `activations`.
    pub fn project(&self, activations: &Tensor) -> Result<Tensor> {
        let dim = self.direction.dims()[0];
        anyhow::ensure!(
            activations.dims().last() == Some(&dim),
            "Activations {:?} do not end in dimension {dim}",
            activations.dims()
        );
        let x = activations.to_dtype(DType::F32)?;
        let n = self.direction.to_device(x.device())?;
        let dots = x.broadcast_mul(&n)?.sum_keepdim(D::Minus1)?;
        Ok((&x - dots.broadcast_mul(&n)?)?)
    }
}

/// `[n_features]` 0/1 selector for `features`.
fn feature_selector(features: &[usize], n_features: usize, device: &Device) -> Result<Tensor> {
    let mut sel = vec![0f32; n_features];
    for &f in features {
        anyhow::ensure!(
            f < n_features,
            "Feature {f} out of range (dictionary has {n_features})"
        );
        sel[f] = 1.0;
    }
    Ok(Tensor::from_vec(sel, n_features, device)?)
}

/// Ablate `features` in every row of `activations` (`[..., activation_dim]`).
///
/// `corrupted_codes` has the flattened row count and `n_features` columns;
/// `mask` has one entry per flattened row.
pub fn resample_ablation(
    lens: &InferenceLens,
    activations: &Tensor,
    features: &[usize],
    corrupted_codes: Option<&Tensor>,
    kind: AblationKind,
    mask: Option<&[bool]>,
) -> Result<Tensor> {
    let shape = activations.shape().clone();
    let dim = lens.activation_dim();
    anyhow::ensure!(
        activations.dims().last() == Some(&dim),
        "Activations {:?} do not end in dimension {dim}",
        activations.dims()
    );
    let x = activations.to_dtype(DType::F32)?.reshape(((), dim))?;
    let rows = x.dims()[0];
    let n_features = lens.n_features();
    let device = x.device();

    let selector = feature_selector(features, n_features, device)?;
    let replacement = match corrupted_codes {
        Some(c) => {
            anyhow::ensure!(
                c.dims() == [rows, n_features],
                "Corrupted codes must have shape [{rows}, {n_features}], got {:?}",
                c.dims()
            );
            c.to_dtype(DType::F32)?
        }
        None => Tensor::zeros((rows, n_features), DType::F32, device)?,
    };
    let dict = lens.get_dictionary()?;

    let ablated = match kind {
        AblationKind::Reconstruction => {
            let codes = lens.encode(&x)?;
            // c * (1 - s) + c' * s
            let kept = codes.broadcast_mul(&selector.affine(-1.0, 1.0)?)?;
            let swapped = replacement.broadcast_mul(&selector)?;
            lens.decode(&(kept + swapped)?)?
        }
        AblationKind::PartialAblation | AblationKind::FullAblation => {
            let codes = if kind == AblationKind::PartialAblation {
                lens.encode(&x)?
            } else {
                x.matmul(&dict.t()?)?
            };
            let delta = (replacement - codes)?.broadcast_mul(&selector)?;
            (&x + delta.matmul(&dict)?)?
        }
    };

    let out = match mask {
        Some(mask) => {
            anyhow::ensure!(
                mask.len() == rows,
                "Mask has {} entries for {rows} rows",
                mask.len()
            );
            let m: Vec<f32> = mask.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
            let m = Tensor::from_vec(m, (rows, 1), device)?;
            let keep = m.affine(-1.0, 1.0)?;
            (ablated.broadcast_mul(&m)? + x.broadcast_mul(&keep)?)?
        }
        None => ablated,
    };
    Ok(out.reshape(shape)?)
}

/// Fraction of rows in which each feature is active
pub fn activation_frequencies(lens: &InferenceLens, activations: &Tensor) -> Result<Vec<f64>> {
    let codes = lens.encode(activations)?;
    let freqs: Vec<f32> = codes.gt(0f32)?.to_dtype(DType::F32)?.mean(0)?.to_vec1()?;
    Ok(freqs.into_iter().map(f64::from).collect())
}

/// Features active in more than `threshold` of the rows
pub fn filter_by_activation_frequency(
    lens: &InferenceLens,
    activations: &Tensor,
    threshold: f64,
) -> Result<Vec<usize>> {
    Ok(activation_frequencies(lens, activations)?
        .into_iter()
        .enumerate()
        .filter(|(_, f)| *f > threshold)
        .map(|(i, _)| i)
        .collect())
}

/// Score each feature and sort ascending by score.
pub fn rank_features<F>(features: &[usize], mut score: F) -> Result<Vec<(usize, f64)>>
where
    F: FnMut(usize) -> Result<f64>,
{
    let mut ranked = features
        .iter()
        .map(|&f| Ok((f, score(f)?)))
        .collect::<Result<Vec<_>>>()?;
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    Ok(ranked)
}

/// L2 distance between clean and ablated activations along the last dimension
pub fn ce_distance(clean: &Tensor, ablated: &Tensor) -> Result<Tensor> {
    anyhow::ensure!(
        clean.dims() == ablated.dims(),
        "Shape mismatch: {:?} vs {:?}",
        clean.dims(),
        ablated.dims()
    );
    let diff = (clean.to_dtype(DType::F32)? - ablated.to_dtype(DType::F32)?)?;
    Ok(diff.sqr()?.sum(D::Minus1)?.sqrt()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learned_dict::UntiedSae;

    /// Identity dictionary on 3 dims with zero bias
    fn identity_lens() -> InferenceLens {
        let device = Device::Cpu;
        let eye = Tensor::eye(3, DType::F32, &device).unwrap();
        let bias = Tensor::zeros(3, DType::F32, &device).unwrap();
        let dict = UntiedSae::new(eye.clone(), eye, bias).unwrap();
        InferenceLens::new(Box::new(dict), device)
    }

    fn vec2(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2().unwrap()
    }

    #[test]
    fn test_nullspace_removes_direction() {
        let dir = Tensor::new(&[0f32, 2.0, 0.0], &Device::Cpu).unwrap();
        let proj = NullspaceProjector::new(&dir).unwrap();
        let x = Tensor::new(&[[1f32, 5.0, -1.0], [0.0, -3.0, 2.0]], &Device::Cpu).unwrap();
        let out = vec2(&proj.project(&x).unwrap());
        assert_eq!(out, vec![vec![1.0, 0.0, -1.0], vec![0.0, 0.0, 2.0]]);
    }

    #[test]
    fn test_nullspace_zero_direction_rejected() {
        let dir = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert!(NullspaceProjector::new(&dir).is_err());
    }

    #[test]
    fn test_class_mean_direction() {
        let x = Tensor::new(&[[1f32, 0.0], [3.0, 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let proj = NullspaceProjector::from_class_means(&x, &[true, true, false]).unwrap();
        let d: Vec<f32> = proj.direction().to_vec1().unwrap();
        assert_eq!(d, vec![1.0, 0.0]);
        assert!(NullspaceProjector::from_class_means(&x, &[true, true, true]).is_err());
    }

    #[test]
    fn test_reconstruction_zero_ablation() {
        let lens = identity_lens();
        let x = Tensor::new(&[[1f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let kind = AblationKind::Reconstruction;
        let out = resample_ablation(&lens, &x, &[1], None, kind, None).unwrap();
        assert_eq!(vec2(&out), vec![vec![1.0, 0.0, 3.0]]);
    }

    #[test]
    fn test_partial_ablation_keeps_residual() {
        let lens = identity_lens();
        // The negative coordinate is invisible to the ReLU encoder and survives.
        let x = Tensor::new(&[[-1f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let corrupted = Tensor::new(&[[0f32, 5.0, 0.0]], &Device::Cpu).unwrap();
        let kind = AblationKind::PartialAblation;
        let out = resample_ablation(&lens, &x, &[1], Some(&corrupted), kind, None).unwrap();
        assert_eq!(vec2(&out), vec![vec![-1.0, 5.0, 3.0]]);
    }

    #[test]
    fn test_full_ablation_uses_projection() {
        let lens = identity_lens();
        let x = Tensor::new(&[[-1f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let kind = AblationKind::FullAblation;
        let out = resample_ablation(&lens, &x, &[0], None, kind, None).unwrap();
        assert_eq!(vec2(&out), vec![vec![0.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_mask_keeps_unselected_rows() {
        let lens = identity_lens();
        let x = Tensor::new(&[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &Device::Cpu).unwrap();
        let kind = AblationKind::Reconstruction;
        let out = resample_ablation(&lens, &x, &[2], None, kind, Some(&[false, true])).unwrap();
        assert_eq!(vec2(&out), vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 0.0]]);
    }

    #[test]
    fn test_ablation_preserves_leading_dims() {
        let lens = identity_lens();
        let x = Tensor::ones((2, 4, 3), DType::F32, &Device::Cpu).unwrap();
        let kind = AblationKind::Reconstruction;
        let out = resample_ablation(&lens, &x, &[0], None, kind, None).unwrap();
        assert_eq!(out.dims(), &[2, 4, 3]);
    }

    #[test]
    fn test_out_of_range_feature_rejected() {
        let lens = identity_lens();
        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let kind = AblationKind::Reconstruction;
        assert!(resample_ablation(&lens, &x, &[3], None, kind, None).is_err());
    }

    #[test]
    fn test_activation_frequency_filter() {
        let lens = identity_lens();
        let rows = [
            [1f32, 0.0, -1.0],
            [1.0, 1.0, -1.0],
            [1.0, 0.0, -1.0],
            [1.0, 0.0, 2.0],
        ];
        let x = Tensor::new(&rows, &Device::Cpu).unwrap();
        let freqs = activation_frequencies(&lens, &x).unwrap();
        assert_eq!(freqs, vec![1.0, 0.25, 0.25]);
        let common = filter_by_activation_frequency(&lens, &x, 0.5).unwrap();
        assert_eq!(common, vec![0]);
        let all = filter_by_activation_frequency(&lens, &x, 0.1).unwrap();
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[test]
    fn test_rank_features_ascending() {
        let ranked = rank_features(&[0, 1, 2], |f| Ok([0.5, -1.0, 2.0][f])).unwrap();
        assert_eq!(ranked, vec![(1, -1.0), (0, 0.5), (2, 2.0)]);
    }

    #[test]
    fn test_ce_distance() {
        let a = Tensor::new(&[[0f32, 0.0], [1.0, 1.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[3f32, 4.0], [1.0, 1.0]], &Device::Cpu).unwrap();
        let d: Vec<f32> = ce_distance(&a, &b).unwrap().to_vec1().unwrap();
        assert_eq!(d, vec![5.0, 0.0]);
    }
}
