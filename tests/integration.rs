//! Integration tests for sparse-coding-rs
//!
//! Everything runs on CPU with small synthetic problems.

use candle_core::{DType, Device, Tensor};
use sparse_coding_rs::{
    compare_with_larger, count_dead_features, load_models, mean_max_cosine_similarity, save_models,
    train, write_chunk, DataMode, DatasetGenerator, DictKind, GeneratorConfig, SparseAutoencoder,
    Sweep, SweepCell, SweepConfig, TrainConfig,
};

fn independent_config(activation_dim: usize, n_components: usize) -> GeneratorConfig {
    GeneratorConfig {
        activation_dim,
        n_ground_truth_components: n_components,
        batch_size: 64,
        feature_num_nonzero: 1,
        feature_prob_decay: 1.0,
        correlated: false,
        seed: 3,
    }
}

fn row_norms(t: &Tensor) -> Vec<f32> {
    t.sqr().unwrap().sum(1).unwrap().sqrt().unwrap().to_vec1().unwrap()
}

/// A dictionary trained on clean sparse data recovers the ground-truth features
#[test]
fn test_recovers_ground_truth_features() {
    let generator = DatasetGenerator::new(independent_config(8, 4), &Device::Cpu).unwrap();
    let mut source = generator.stream(11);
    let mut model = SparseAutoencoder::new(8, 8, DictKind::Untied, 1e-3, &Device::Cpu, 5).unwrap();
    let config = TrainConfig {
        n_steps: 3000,
        l1_alpha: 1e-3,
        learning_rate: 1e-2,
        log_every: 1000,
        ..Default::default()
    };

    let before = mean_max_cosine_similarity(
        generator.feature_bank().features(),
        &model.learned_dict().unwrap(),
    )
    .unwrap();
    let outcome = train(&mut model, &mut source, &config).unwrap();
    let after = outcome.mmcs.unwrap();

    assert_eq!(outcome.history.len(), 3);
    assert!(after > before, "MMCS did not improve: {before} -> {after}");
    assert!(after > 0.85, "MMCS too low after training: {after}");
}

/// Square dictionary on 8 dims, 4 ground-truth features, two active per
/// sample: MMCS climbs across the 1000-step checkpoints and ends above 0.8
#[test]
fn test_square_dictionary_recovery_trend() {
    let gen_config = GeneratorConfig {
        batch_size: 256,
        feature_num_nonzero: 2,
        seed: 0,
        ..independent_config(8, 4)
    };
    let generator = DatasetGenerator::new(gen_config, &Device::Cpu).unwrap();
    let mut source = generator.stream(0);
    let mut model = SparseAutoencoder::new(8, 4, DictKind::Untied, 1e-3, &Device::Cpu, 0).unwrap();
    let config = TrainConfig {
        n_steps: 10_000,
        l1_alpha: 1e-3,
        learning_rate: 1e-3,
        log_every: 1000,
        ..Default::default()
    };
    let outcome = train(&mut model, &mut source, &config).unwrap();

    let curve: Vec<f64> = outcome.history.iter().map(|c| c.mmcs.unwrap()).collect();
    assert_eq!(curve.len(), 10);
    let trailing: Vec<f64> = curve
        .windows(3)
        .map(|w| w.iter().sum::<f64>() / 3.0)
        .collect();
    for pair in trailing.windows(2) {
        assert!(
            pair[1] >= pair[0] - 0.01,
            "running MMCS fell from {:.3} to {:.3}; curve {curve:?}",
            pair[0],
            pair[1]
        );
    }
    let last = *curve.last().unwrap();
    assert!(last > 0.8, "final MMCS {last}; curve {curve:?}");
    assert_eq!(outcome.last_step, 10_000);
}

/// Dictionary rows stay unit norm through training
#[test]
fn test_unit_norm_after_training() {
    let generator = DatasetGenerator::new(independent_config(6, 12), &Device::Cpu).unwrap();
    let mut source = generator.stream(0);
    for kind in [DictKind::Untied, DictKind::Tied { norm_encoder: true }] {
        let mut model = SparseAutoencoder::new(6, 12, kind, 0.05, &Device::Cpu, 1).unwrap();
        let config = TrainConfig {
            n_steps: 50,
            learning_rate: 1e-2,
            log_every: 25,
            ..Default::default()
        };
        train(&mut model, &mut source, &config).unwrap();
        for norm in row_norms(&model.learned_dict().unwrap()) {
            assert!((norm - 1.0).abs() < 1e-4, "{kind:?}: row norm {norm}");
        }
    }
}

#[test]
fn test_mmcs_permutation_invariant() {
    let generator = DatasetGenerator::new(independent_config(5, 6), &Device::Cpu).unwrap();
    let truth = generator.feature_bank().features();
    let learned = Tensor::randn(0f32, 1.0, (9, 5), &Device::Cpu).unwrap();
    let order = Tensor::new(&[8u32, 3, 0, 7, 1, 5, 2, 6, 4], &Device::Cpu).unwrap();
    let shuffled = learned.index_select(&order, 0).unwrap();

    let a = mean_max_cosine_similarity(truth, &learned).unwrap();
    let b = mean_max_cosine_similarity(truth, &shuffled).unwrap();
    assert!((a - b).abs() < 1e-6);
    assert!((mean_max_cosine_similarity(truth, truth).unwrap() - 1.0).abs() < 1e-5);
}

#[test]
fn test_compare_identical_dictionaries() {
    let dict = Tensor::randn(0f32, 1.0, (6, 4), &Device::Cpu).unwrap();
    let result = compare_with_larger(&dict, &dict, 1.0).unwrap();
    assert!((result.mean_similarity - 1.0).abs() < 1e-5);
    assert!((result.pct_above_threshold - 100.0).abs() < 1e-9);
    for (i, j) in result.assignment {
        assert_eq!(i, j);
    }
}

/// A larger dictionary that contains the smaller one matches it exactly
#[test]
fn test_compare_with_stacked_larger() {
    let small = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
    let extra = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
    let large = Tensor::cat(&[&extra, &small], 0).unwrap();

    let result = compare_with_larger(&small, &large, 0.99).unwrap();
    assert_eq!(result.similarities.len(), 4);
    assert!(result.mean_similarity >= 0.5);
    let exact = result.similarities.iter().filter(|&&s| s > 0.9999).count();
    assert_eq!(exact, 4);
    assert!((result.pct_above_threshold - 100.0).abs() < 1e-9);
    for (i, j) in result.assignment {
        assert_eq!(j, i + 4);
    }
}

#[test]
fn test_dead_feature_bounds() {
    let generator = DatasetGenerator::new(independent_config(4, 4), &Device::Cpu).unwrap();
    let model = SparseAutoencoder::new(4, 16, DictKind::Untied, 0.1, &Device::Cpu, 2).unwrap();
    let mut source = generator.stream(9);
    let dead = count_dead_features(&model, &mut source, 3).unwrap();
    assert!(dead <= 16);
    assert!(count_dead_features(&model, &mut source, 0).is_err());
}

#[test]
fn test_checkpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autoencoders.safetensors");
    let a = SparseAutoencoder::new(4, 8, DictKind::Untied, 1e-3, &Device::Cpu, 0).unwrap();
    let tied = DictKind::Tied {
        norm_encoder: false,
    };
    let b = SparseAutoencoder::new(4, 16, tied, 1e-2, &Device::Cpu, 1).unwrap();
    save_models(&path, &[&a, &b]).unwrap();

    let contents = load_models(&path, &Device::Cpu).unwrap();
    assert_eq!(contents.activation_dim, 4);
    assert_eq!(contents.models.len(), 2);
    for saved in [&a, &b] {
        let loaded = contents
            .models
            .iter()
            .find(|m| m.n_dict_components() == saved.n_dict_components())
            .unwrap();
        assert_eq!(loaded.kind(), saved.kind());
        assert_eq!(loaded.l1_alpha(), saved.l1_alpha());
        let x: Vec<Vec<f32>> = saved.learned_dict().unwrap().to_vec2().unwrap();
        let y: Vec<Vec<f32>> = loaded.learned_dict().unwrap().to_vec2().unwrap();
        assert_eq!(x, y);
    }
}

/// Two sizes, two L1 values, two mini-runs: every artifact is written
#[test]
fn test_synthetic_sweep_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = SweepConfig {
        data: DataMode::Synthetic(GeneratorConfig {
            batch_size: 16,
            ..independent_config(4, 8)
        }),
        train: TrainConfig {
            n_steps: 10,
            log_every: 5,
            ..Default::default()
        },
        l1_exp_base: 10.0,
        l1_exp_low: -3,
        l1_exp_high: -1,
        dict_ratio_exp_low: 0,
        dict_ratio_exp_high: 2,
        mini_runs: 2,
        dead_feature_batches: 2,
        outputs_folder: dir.path().join("out"),
        ..Default::default()
    };
    let mut sweep = Sweep::new(config, vec![Device::Cpu]).unwrap();
    let outcome = sweep.run().unwrap();

    assert!(dir.path().join("out/config.json").exists());
    assert_eq!(outcome.mini_runs.len(), 2);
    for k in 0..2 {
        let folder = sweep.mini_run_folder(k);
        assert!(folder.join("autoencoders.safetensors").exists());
        assert!(folder.join("metrics.json").exists());
        assert!(folder.join("comparison.json").exists());
    }

    let metrics = &outcome.mini_runs[1];
    assert_eq!(metrics.dict_sizes, vec![4, 8]);
    assert!(metrics.failed_cells.is_empty());
    for i in 0..2 {
        for j in 0..2 {
            assert!(metrics.mmcs_with_ground_truth[i][j].is_some());
            assert!(metrics.reconstruction_loss[i][j].unwrap().is_finite());
            assert!(metrics.dead_features[i][j].unwrap() <= metrics.dict_sizes[j]);
        }
    }

    let comparison = outcome.comparisons[1].as_ref().unwrap();
    for row in &comparison.mmcs_with_larger {
        assert!(row[0].is_some());
        assert!(row[1].is_none());
    }

    assert_eq!(outcome.mini_runs[0].last_step, 10);
    assert_eq!(outcome.mini_runs[1].last_step, 20);

    let checkpoint = sweep.mini_run_folder(1).join("autoencoders.safetensors");
    let saved = load_models(&checkpoint, &Device::Cpu).unwrap();
    assert_eq!(saved.models.len(), 4);
}

/// A dictionary size that rounds to zero fails its cells only
#[test]
fn test_sweep_survives_unbuildable_cells() {
    let dir = tempfile::tempdir().unwrap();
    let config = SweepConfig {
        data: DataMode::Synthetic(GeneratorConfig {
            batch_size: 16,
            ..independent_config(4, 8)
        }),
        train: TrainConfig {
            n_steps: 4,
            log_every: 2,
            ..Default::default()
        },
        l1_exp_low: -3,
        l1_exp_high: -2,
        dict_ratio_exp_base: 2.0,
        dict_ratio_exp_low: -3,
        dict_ratio_exp_high: 1,
        dead_feature_batches: 2,
        outputs_folder: dir.path().join("out"),
        ..Default::default()
    };
    let mut sweep = Sweep::new(config, vec![Device::Cpu]).unwrap();
    let outcome = sweep.run().unwrap();

    let metrics = &outcome.mini_runs[0];
    assert_eq!(metrics.dict_sizes, vec![0, 1, 2, 4]);
    let failed: Vec<SweepCell> = metrics.failed_cells.clone();
    assert_eq!(failed.len(), 1);
    assert_eq!((failed[0].l1_index, failed[0].dict_index), (0, 0));
    assert!(metrics.reconstruction_loss[0][0].is_none());
    for j in 1..4 {
        assert!(metrics.reconstruction_loss[0][j].is_some());
    }

    let comparison = outcome.comparisons[0].as_ref().unwrap();
    let row = &comparison.mmcs_with_larger[0];
    assert!(row[0].is_none());
    assert!(row[1].is_some());
    assert!(row[2].is_some());
    assert!(row[3].is_none());

    let checkpoint = sweep.mini_run_folder(0).join("autoencoders.safetensors");
    let saved = load_models(&checkpoint, &Device::Cpu).unwrap();
    assert_eq!(saved.models.len(), 3);
}

/// Chunk-mode sweep, then a zero-step sweep resumed from its checkpoint
#[test]
fn test_chunk_sweep_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("chunks");
    for index in 0..2 {
        let acts = Tensor::randn(0f32, 1.0, (40, 4), &Device::Cpu).unwrap();
        write_chunk(&data_dir, index, &acts).unwrap();
    }

    let base = SweepConfig {
        data: DataMode::Chunks {
            dataset_dir: data_dir.clone(),
            batch_size: 16,
            refresh_data: false,
        },
        train: TrainConfig {
            n_steps: 6,
            log_every: 3,
            horizon: 1000,
            ..Default::default()
        },
        dict_ratio_exp_low: 0,
        dict_ratio_exp_high: 2,
        outputs_folder: dir.path().join("first"),
        ..Default::default()
    };
    let mut first = Sweep::new(base.clone(), vec![Device::Cpu]).unwrap();
    let trained = first.run().unwrap();
    assert!(trained.mini_runs[0].mmcs_with_ground_truth[0][0].is_none());
    assert!(trained.comparisons[0].is_some());

    let checkpoint = first.mini_run_folder(0).join("autoencoders.safetensors");
    let resumed_config = SweepConfig {
        train: TrainConfig {
            n_steps: 0,
            ..base.train.clone()
        },
        load_checkpoint: Some(checkpoint),
        outputs_folder: dir.path().join("second"),
        ..base
    };
    let mut second = Sweep::new(resumed_config, vec![Device::Cpu]).unwrap();
    let resumed = second.run().unwrap();

    assert_eq!(resumed.mini_runs[0].last_step, 0);
    for (a, b) in trained.grid.models().into_iter().zip(resumed.grid.models()) {
        let x = a.learned_dict().unwrap().to_dtype(DType::F32).unwrap();
        let x: Vec<Vec<f32>> = x.to_vec2().unwrap();
        let y: Vec<Vec<f32>> = b.learned_dict().unwrap().to_vec2().unwrap();
        assert_eq!(x, y);
    }
}
