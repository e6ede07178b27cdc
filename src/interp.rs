//! Automatic feature interpretation through an external oracle
//!
//! The oracle (typically a language model behind an API) sees the top
//! activating examples of a feature, proposes an explanation and returns a
//! numeric agreement score. This module only selects the examples and drives
//! the oracle.

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::learned_dict::InferenceLens;

/// One row of the activation set together with a feature's activation on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatingExample {
    /// Row index into the activations passed to [`top_activating_examples`]
    pub index: usize,
    pub activation: f32,
}

/// What the oracle concluded about one feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureScore {
    pub feature: usize,
    pub explanation: String,
    pub score: f64,
}

/// Scores a feature from its strongest examples
pub trait ExplanationOracle {
    fn explain_and_score(
        &mut self,
        feature: usize,
        examples: &[ActivatingExample],
    ) -> Result<FeatureScore>;
}

/// The `k` rows on which `feature` fires hardest, strongest first. Rows where
/// the feature is inactive are never returned.
pub fn top_activating_examples(
    lens: &InferenceLens,
    activations: &Tensor,
    feature: usize,
    k: usize,
) -> Result<Vec<ActivatingExample>> {
    anyhow::ensure!(
        feature < lens.n_features(),
        "Feature {feature} out of range (dictionary has {})",
        lens.n_features()
    );
    let codes = lens.encode(activations)?;
    let column: Vec<f32> = codes.narrow(1, feature, 1)?.squeeze(1)?.to_vec1()?;
    let mut examples: Vec<ActivatingExample> = column
        .into_iter()
        .enumerate()
        .filter(|(_, a)| *a > 0.0)
        .map(|(index, activation)| ActivatingExample { index, activation })
        .collect();
    examples.sort_by(|a, b| b.activation.total_cmp(&a.activation));
    examples.truncate(k);
    Ok(examples)
}

/// Ask the oracle about every feature in `features`. Features that never
/// fire are skipped with a warning.
pub fn score_features(
    lens: &InferenceLens,
    activations: &Tensor,
    features: &[usize],
    k: usize,
    oracle: &mut dyn ExplanationOracle,
) -> Result<Vec<FeatureScore>> {
    let mut scores = Vec::with_capacity(features.len());
    for &feature in features {
        let examples = top_activating_examples(lens, activations, feature, k)?;
        if examples.is_empty() {
            warn!("Feature {feature} never activates; not scored");
            continue;
        }
        let score = oracle.explain_and_score(feature, &examples)?;
        debug!(
            "Feature {feature}: {:.3} ({})",
            score.score, score.explanation
        );
        scores.push(score);
    }
    Ok(scores)
}
