//! Dictionary comparison: recovery against ground truth and matching
//! across dictionary sizes
//!
//! - [`mean_max_cosine_similarity`]: for each reference row, best cosine to
//!   any learned row, averaged.
//! - [`compare_with_larger`]: optimal one-to-one assignment of every row of a
//!   smaller dictionary to a distinct row of a larger one (Hungarian method on
//!   `1 - cos`).
//! - [`check_feature_movement`]: slot-wise drift between two snapshots of the
//!   same dictionary.

use anyhow::Result;
use candle_core::{DType, Tensor};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::learned_dict::normalize_rows;

/// Slack when deciding whether a matched pair reaches the threshold, so that
/// identical rows count at `threshold = 1.0` despite rounding.
const THRESHOLD_TOLERANCE: f64 = 1e-6;

/// Pairwise cosine similarity `[rows_a, rows_b]`. `b` is moved to `a`'s device.
pub fn cosine_sim(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (_, dim_a) = a.dims2()?;
    let (_, dim_b) = b.dims2()?;
    anyhow::ensure!(
        dim_a == dim_b,
        "Dictionaries live in different spaces: {dim_a} vs {dim_b} dims"
    );
    let a = normalize_rows(&a.to_dtype(DType::F32)?)?;
    let b = normalize_rows(&b.to_dtype(DType::F32)?.to_device(a.device())?)?;
    Ok(a.matmul(&b.t()?)?)
}

/// Mean over reference rows of the max cosine similarity to any learned row.
/// Invariant under row permutations of `learned`.
pub fn mean_max_cosine_similarity(ground_truth: &Tensor, learned: &Tensor) -> Result<f64> {
    let (n_truth, _) = ground_truth.dims2()?;
    let (n_learned, _) = learned.dims2()?;
    anyhow::ensure!(
        n_truth > 0 && n_learned > 0,
        "Cannot score an empty dictionary ({n_truth} vs {n_learned} rows)"
    );
    let sim = cosine_sim(ground_truth, learned)?;
    let mmcs = sim.max(1)?.mean_all()?.to_scalar::<f32>()?;
    Ok(f64::from(mmcs))
}

/// Mean of `1 - cos` between rows with the same index.
pub fn check_feature_movement(dict_a: &Tensor, dict_b: &Tensor) -> Result<f64> {
    anyhow::ensure!(
        dict_a.dims() == dict_b.dims(),
        "Feature movement needs same-shaped dictionaries, got {:?} and {:?}",
        dict_a.dims(),
        dict_b.dims()
    );
    let a = normalize_rows(&dict_a.to_dtype(DType::F32)?)?;
    let b = normalize_rows(&dict_b.to_dtype(DType::F32)?.to_device(a.device())?)?;
    let cos = (a * b)?.sum(1)?;
    let shift = cos.affine(-1.0, 1.0)?.mean_all()?.to_scalar::<f32>()?;
    Ok(f64::from(shift))
}

/// Outcome of matching a smaller dictionary into a larger one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub mean_similarity: f64,
    /// Percentage (0 to 100) of matched pairs at or above the threshold
    pub pct_above_threshold: f64,
    /// Similarity of each matched pair, in smaller-dictionary row order
    pub similarities: Vec<f64>,
    /// `(smaller_row, larger_row)` pairs
    pub assignment: Vec<(usize, usize)>,
}

/// Optimal one-to-one matching of every row of `smaller` to a distinct row
/// of `larger`, maximizing total cosine similarity.
pub fn compare_with_larger(
    smaller: &Tensor,
    larger: &Tensor,
    threshold: f64,
) -> Result<ComparisonResult> {
    let (n_small, _) = smaller.dims2()?;
    let (n_large, _) = larger.dims2()?;
    anyhow::ensure!(
        n_small > 0 && n_large > 0,
        "Cannot match empty dictionaries ({n_small} vs {n_large} rows)"
    );
    anyhow::ensure!(
        n_small <= n_large,
        "Smaller dictionary has more rows ({n_small}) than the larger one ({n_large})"
    );

    let sim: Vec<Vec<f32>> = cosine_sim(smaller, larger)?.to_vec2()?;
    let cost = Array2::from_shape_fn((n_small, n_large), |(i, j)| 1.0 - f64::from(sim[i][j]));
    let assignment = hungarian(&cost)?;

    let similarities: Vec<f64> = assignment
        .iter()
        .map(|&(i, j)| f64::from(sim[i][j]))
        .collect();
    let mean_similarity = similarities.iter().sum::<f64>() / similarities.len() as f64;
    let above = similarities
        .iter()
        .filter(|&&s| s >= threshold - THRESHOLD_TOLERANCE)
        .count();
    let pct_above_threshold = 100.0 * above as f64 / similarities.len() as f64;
    debug!(
        "Matched {n_small} -> {n_large}: mean {mean_similarity:.4}, \
         {pct_above_threshold:.1}% >= {threshold}"
    );

    Ok(ComparisonResult {
        mean_similarity,
        pct_above_threshold,
        similarities,
        assignment,
    })
}

/// Minimum-cost assignment of every row to a distinct column (rows <= cols).
///
/// Shortest augmenting path with row/column potentials, O(rows^2 * cols).
/// Returns `(row, col)` pairs sorted by row.
pub fn hungarian(cost: &Array2<f64>) -> Result<Vec<(usize, usize)>> {
    let (n, m) = cost.dim();
    anyhow::ensure!(n > 0, "Empty cost matrix");
    anyhow::ensure!(n <= m, "Cost matrix has more rows ({n}) than columns ({m})");
    anyhow::ensure!(
        cost.iter().all(|c| c.is_finite()),
        "Cost matrix contains non-finite entries"
    );

    // 1-based; column 0 and row 0 are sentinels.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut row_of = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        row_of[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = row_of[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            anyhow::ensure!(j1 != 0, "No augmenting column for row {}", i - 1);
            for j in 0..=m {
                if used[j] {
                    u[row_of[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if row_of[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            row_of[j0] = row_of[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| row_of[j] != 0)
        .map(|j| (row_of[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    Ok(pairs)
}

/// Cross-size comparison matrices for one mini-run, indexed
/// `[l1_index][dict_index]`. The last size has no larger partner and is `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LargerDictComparison {
    pub mmcs_with_larger: Vec<Vec<Option<f64>>>,
    pub pct_above_threshold: Vec<Vec<Option<f64>>>,
    /// Per-pair similarities for every compared cell
    pub similarities: Vec<Vec<Vec<f64>>>,
}

/// Compare `dicts[l1][k]` against `dicts[l1][k + 1]` for every adjacent pair of
/// sizes. Sizes must be ordered ascending within each row. A missing
/// dictionary (a cell that could not be built) leaves its pairs at `None`
/// with no similarities.
pub fn run_mmcs_with_larger(
    dicts: &[Vec<Option<Tensor>>],
    threshold: f64,
) -> Result<LargerDictComparison> {
    let mut out = LargerDictComparison::default();
    for (l1_index, row) in dicts.iter().enumerate() {
        anyhow::ensure!(
            row.len() >= 2,
            "L1 row {l1_index} has {} dictionaries; need at least two sizes",
            row.len()
        );
        let mut mmcs_row = vec![None; row.len()];
        let mut pct_row = vec![None; row.len()];
        let mut sims_row = Vec::with_capacity(row.len() - 1);
        for (k, pair) in row.windows(2).enumerate() {
            let (Some(smaller), Some(larger)) = (&pair[0], &pair[1]) else {
                debug!("L1 row {l1_index}: size slot {k} has no partner to compare");
                sims_row.push(Vec::new());
                continue;
            };
            let result = compare_with_larger(smaller, larger, threshold)?;
            mmcs_row[k] = Some(result.mean_similarity);
            pct_row[k] = Some(result.pct_above_threshold);
            sims_row.push(result.similarities);
        }
        out.mmcs_with_larger.push(mmcs_row);
        out.pct_above_threshold.push(pct_row);
        out.similarities.push(sims_row);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use ndarray::array;

    fn assignment_cost(cost: &Array2<f64>, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(i, j)| cost[[i, j]]).sum()
    }

    #[test]
    fn test_hungarian_square() {
        let cost = array![[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let pairs = hungarian(&cost).unwrap();
        assert_eq!(pairs, vec![(0, 1), (1, 0), (2, 2)]);
        assert!((assignment_cost(&cost, &pairs) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_hungarian_rectangular_distinct_columns() {
        let cost = array![[0.9, 0.1, 0.5, 0.7], [0.2, 0.1, 0.8, 0.3]];
        let pairs = hungarian(&cost).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_ne!(pairs[0].1, pairs[1].1);
        // Brute force over all injective maps.
        let mut best = f64::INFINITY;
        for a in 0..4 {
            for b in 0..4 {
                if a != b {
                    best = best.min(cost[[0, a]] + cost[[1, b]]);
                }
            }
        }
        assert!((assignment_cost(&cost, &pairs) - best).abs() < 1e-12);
    }

    #[test]
    fn test_hungarian_rejects_degenerate() {
        assert!(hungarian(&Array2::<f64>::zeros((0, 3))).is_err());
        assert!(hungarian(&Array2::<f64>::zeros((3, 2))).is_err());
        assert!(hungarian(&array![[f64::NAN, 1.0]]).is_err());
    }

    #[test]
    fn test_mmcs_identity() {
        let eye = Tensor::eye(4, DType::F32, &Device::Cpu).unwrap();
        let mmcs = mean_max_cosine_similarity(&eye, &eye).unwrap();
        assert!((mmcs - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mmcs_ignores_scale() {
        let gt = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let learned = Tensor::new(&[[0.0f32, 5.0], [3.0, 0.0], [1.0, 1.0]], &Device::Cpu).unwrap();
        let mmcs = mean_max_cosine_similarity(&gt, &learned).unwrap();
        assert!((mmcs - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_feature_movement() {
        let a = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        assert!(check_feature_movement(&a, &a).unwrap().abs() < 1e-6);
        let b = Tensor::new(&[[0f32, 1.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        assert!((check_feature_movement(&a, &b).unwrap() - 0.5).abs() < 1e-6);
        let c = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();
        assert!(check_feature_movement(&a, &c).is_err());
    }

    #[test]
    fn test_compare_identical() {
        let d = Tensor::randn(0f32, 1.0, (6, 5), &Device::Cpu).unwrap();
        let result = compare_with_larger(&d, &d, 1.0).unwrap();
        assert!((result.mean_similarity - 1.0).abs() < 1e-5);
        assert!((result.pct_above_threshold - 100.0).abs() < 1e-9);
        assert_eq!(result.similarities.len(), 6);
    }

    #[test]
    fn test_compare_rejects_wrong_order() {
        let small = Tensor::randn(0f32, 1.0, (2, 3), &Device::Cpu).unwrap();
        let large = Tensor::randn(0f32, 1.0, (4, 3), &Device::Cpu).unwrap();
        assert!(compare_with_larger(&large, &small, 0.9).is_err());
    }

    #[test]
    fn test_run_mmcs_with_larger_adjacent_only() {
        let device = Device::Cpu;
        let row = vec![
            Some(Tensor::randn(0f32, 1.0, (2, 4), &device).unwrap()),
            Some(Tensor::randn(0f32, 1.0, (4, 4), &device).unwrap()),
            Some(Tensor::randn(0f32, 1.0, (8, 4), &device).unwrap()),
        ];
        let out = run_mmcs_with_larger(&[row.clone(), row], 0.9).unwrap();
        assert_eq!(out.mmcs_with_larger.len(), 2);
        assert!(out.mmcs_with_larger[0][0].is_some());
        assert!(out.mmcs_with_larger[0][1].is_some());
        assert!(out.mmcs_with_larger[0][2].is_none());
        assert_eq!(out.similarities[1].len(), 2);
        assert_eq!(out.similarities[1][0].len(), 2);
        assert_eq!(out.similarities[1][1].len(), 4);
    }

    #[test]
    fn test_run_mmcs_with_larger_skips_missing_cells() {
        let device = Device::Cpu;
        let row = vec![
            None,
            Some(Tensor::randn(0f32, 1.0, (4, 4), &device).unwrap()),
            Some(Tensor::randn(0f32, 1.0, (8, 4), &device).unwrap()),
        ];
        let out = run_mmcs_with_larger(&[row], 0.9).unwrap();
        assert!(out.mmcs_with_larger[0][0].is_none());
        assert!(out.mmcs_with_larger[0][1].is_some());
        assert!(out.mmcs_with_larger[0][2].is_none());
        assert!(out.pct_above_threshold[0][0].is_none());
        assert!(out.similarities[0][0].is_empty());
        assert_eq!(out.similarities[0][1].len(), 4);
    }

    #[test]
    fn test_mmcs_rejects_non_matrix_input() {
        let scalar = Tensor::new(1f32, &Device::Cpu).unwrap();
        let dict = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu).unwrap();
        assert!(mean_max_cosine_similarity(&scalar, &dict).is_err());
        assert!(mean_max_cosine_similarity(&dict, &scalar).is_err());
    }
}
