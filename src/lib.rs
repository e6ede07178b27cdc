// Pedantic lints this crate allows. Grid sizes, step counts and feature
// indices move between usize, i32 and the float types all the time.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)] // sweep::SweepGrid, checkpoint::CheckpointContents
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! sparse-coding-rs: sparse dictionary learning on neural activations
//!
//! Trains sparse autoencoders on activation vectors, sweeps them over an
//! L1 coefficient x dictionary size grid and measures how well the learned
//! dictionaries recover known features and how they relate across sizes.
//!
//! ## Architecture
//!
//! - `synthetic`: Ground-truth feature bank and correlation matrix
//! - `dataset`: Synthetic batch generation and the `ActivationSource` trait
//! - `cache`: On-disk activation chunks for real-model data
//! - `autoencoder`: Trainable tied/untied sparse autoencoder
//! - `learned_dict`: Read-only dictionaries and the `InferenceLens`
//! - `training`: Single-model training loop with running diagnostics
//! - `compare`: MMCS, Hungarian matching across sizes, feature drift
//! - `checkpoint`: Safetensors persistence keyed by (l1, dict_size)
//! - `sweep`: Grid sweeps over mini-runs with per-run artifacts
//! - `pool`: One-worker-per-device pool for sweep cells
//! - `ablation`: Nullspace projection and resampling ablation
//! - `interp`: Top-activating examples and oracle scoring
//! - `config`: Typed configuration with defaults

pub mod ablation;
pub mod autoencoder;
pub mod cache;
pub mod checkpoint;
pub mod compare;
pub mod config;
pub mod dataset;
pub mod interp;
pub mod learned_dict;
pub mod pool;
pub mod sweep;
pub mod synthetic;
pub mod training;

pub use ablation::{
    activation_frequencies, ce_distance, filter_by_activation_frequency, rank_features,
    resample_ablation, AblationKind, NullspaceProjector,
};
pub use autoencoder::{DictKind, LossTerms, SparseAutoencoder};
pub use cache::{
    chunk_paths, clear_chunks, read_activation_dim, write_chunk, ChunkedActivations,
    DatasetRefresher,
};
pub use checkpoint::{
    checkpoint_key, load_models, parse_checkpoint_key, save_models, CheckpointContents,
};
pub use compare::{
    check_feature_movement, compare_with_larger, cosine_sim, hungarian, mean_max_cosine_similarity,
    run_mmcs_with_larger, ComparisonResult, LargerDictComparison,
};
pub use config::{DataMode, GeneratorConfig, SweepConfig, TrainConfig};
pub use dataset::{
    generate_correlated_dataset, generate_rand_dataset, ActivationSource, DatasetGenerator,
    OnDevice, SyntheticBatch, SyntheticStream,
};
pub use interp::{score_features, top_activating_examples, ExplanationOracle, FeatureScore};
pub use learned_dict::{InferenceLens, LearnedDict, TiedSae, UntiedSae};
pub use pool::{CellJob, CellResult};
pub use sweep::{MiniRunMetrics, Sweep, SweepCell, SweepGrid, SweepOutcome};
pub use synthetic::{
    generate_correlation_matrix, generate_feature_bank, CorrelationMatrix, FeatureBank,
};
pub use training::{count_dead_features, train, Checkpoint, TrainOutcome};
