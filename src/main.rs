//! sparse-coding-rs CLI: dictionary learning sweeps

use anyhow::Result;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use sparse_coding_rs::{DataMode, DictKind, GeneratorConfig, Sweep, SweepConfig};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sparse-coding-rs")]
#[command(about = "Sparse autoencoder sweeps over L1 coefficient and dictionary size")]
#[command(version)]
struct Cli {
    /// JSON sweep configuration; flags below override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output directory for checkpoints and metrics
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,

    /// Number of CUDA devices to spread sweep cells over
    #[arg(long, default_value_t = 1, global = true)]
    gpus: usize,

    /// Sweep flags, accepted before or after the subcommand
    #[command(flatten)]
    sweep: SweepArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SweepArgs {
    /// Training steps per cell and mini-run
    #[arg(long, global = true)]
    steps: Option<usize>,

    #[arg(long, global = true)]
    lr: Option<f64>,

    /// Stop each cell after this many steps
    #[arg(long, global = true)]
    max_steps: Option<usize>,

    #[arg(long, global = true)]
    l1_exp_low: Option<i32>,

    #[arg(long, global = true)]
    l1_exp_high: Option<i32>,

    #[arg(long, global = true)]
    dict_ratio_exp_low: Option<i32>,

    #[arg(long, global = true)]
    dict_ratio_exp_high: Option<i32>,

    #[arg(long, global = true)]
    mini_runs: Option<usize>,

    /// Similarity threshold for cross-size matching
    #[arg(long, global = true)]
    threshold: Option<f64>,

    /// Tie encoder and decoder weights
    #[arg(long, global = true)]
    tied: bool,

    /// With --tied, normalize the encoder rows as well
    #[arg(long, global = true, requires = "tied")]
    norm_encoder: bool,

    /// Resume matching cells from this checkpoint
    #[arg(long, global = true)]
    load_checkpoint: Option<PathBuf>,

    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep on synthetic data with known ground-truth features
    Synthetic {
        #[arg(long)]
        activation_dim: Option<usize>,

        #[arg(long)]
        n_ground_truth_components: Option<usize>,

        #[arg(long)]
        feature_num_nonzero: Option<usize>,

        #[arg(long)]
        feature_prob_decay: Option<f64>,

        /// Draw components independently instead of through the correlation matrix
        #[arg(long)]
        independent: bool,

        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Sweep over an existing activation chunk directory
    Chunks {
        #[arg(long)]
        dataset_dir: PathBuf,

        #[arg(long, default_value_t = 256)]
        batch_size: usize,
    },
}

fn select_devices(force_cpu: bool, gpus: usize) -> Vec<Device> {
    if force_cpu {
        info!("Forcing CPU mode");
        return vec![Device::Cpu];
    }
    let devices: Vec<Device> = (0..gpus.max(1))
        .filter_map(|ordinal| match Device::cuda_if_available(ordinal) {
            Ok(dev) if dev.is_cuda() => Some(dev),
            _ => None,
        })
        .collect();
    if devices.is_empty() {
        info!("CUDA not available, using CPU");
        vec![Device::Cpu]
    } else {
        info!("Using {} CUDA device(s)", devices.len());
        devices
    }
}

fn build_config(cli: &Cli) -> Result<SweepConfig> {
    let mut config = match &cli.config {
        Some(path) => SweepConfig::load(path)?,
        None => SweepConfig::default(),
    };
    let args = &cli.sweep;

    match &cli.command {
        Command::Synthetic {
            activation_dim,
            n_ground_truth_components,
            feature_num_nonzero,
            feature_prob_decay,
            independent,
            batch_size,
        } => {
            let mut gen = match &config.data {
                DataMode::Synthetic(gen) => gen.clone(),
                DataMode::Chunks { .. } => GeneratorConfig::default(),
            };
            gen.activation_dim = activation_dim.unwrap_or(gen.activation_dim);
            gen.n_ground_truth_components =
                n_ground_truth_components.unwrap_or(gen.n_ground_truth_components);
            gen.feature_num_nonzero = feature_num_nonzero.unwrap_or(gen.feature_num_nonzero);
            gen.feature_prob_decay = feature_prob_decay.unwrap_or(gen.feature_prob_decay);
            gen.batch_size = batch_size.unwrap_or(gen.batch_size);
            if *independent {
                gen.correlated = false;
            }
            if let Some(seed) = args.seed {
                gen.seed = seed;
            }
            config.data = DataMode::Synthetic(gen);
            if cli.config.is_none() {
                config.train.horizon = 10;
            }
        }
        Command::Chunks {
            dataset_dir,
            batch_size,
        } => {
            let refresh_data = matches!(config.data, DataMode::Chunks { refresh_data: true, .. });
            config.data = DataMode::Chunks {
                dataset_dir: dataset_dir.clone(),
                batch_size: *batch_size,
                refresh_data,
            };
            if refresh_data {
                warn!("refresh_data needs an extraction backend; the CLI reuses existing chunks");
            }
            if cli.config.is_none() {
                config.train.horizon = 1000;
            }
        }
    }

    if let Some(v) = args.steps {
        config.train.n_steps = v;
    }
    if let Some(v) = args.lr {
        config.train.learning_rate = v;
    }
    if let Some(v) = args.max_steps {
        config.train.max_steps = v;
    }
    if let Some(v) = args.l1_exp_low {
        config.l1_exp_low = v;
    }
    if let Some(v) = args.l1_exp_high {
        config.l1_exp_high = v;
    }
    if let Some(v) = args.dict_ratio_exp_low {
        config.dict_ratio_exp_low = v;
    }
    if let Some(v) = args.dict_ratio_exp_high {
        config.dict_ratio_exp_high = v;
    }
    if let Some(v) = args.mini_runs {
        config.mini_runs = v;
    }
    if let Some(v) = args.threshold {
        config.threshold = v;
    }
    if args.tied {
        config.kind = DictKind::Tied {
            norm_encoder: args.norm_encoder,
        };
    }
    if let Some(path) = &args.load_checkpoint {
        config.load_checkpoint = Some(path.clone());
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
        config.train.seed = seed;
    }
    if let Some(output) = &cli.output {
        config.outputs_folder = output.clone();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&cli)?;
    let devices = select_devices(cli.cpu, cli.gpus);

    println!("=== sparse-coding-rs ===");
    match &config.data {
        DataMode::Synthetic(gen) => println!(
            "Data:   synthetic ({} dims, {} features, correlated={})",
            gen.activation_dim, gen.n_ground_truth_components, gen.correlated
        ),
        DataMode::Chunks { dataset_dir, .. } => {
            println!("Data:   chunks in {}", dataset_dir.display());
        }
    }
    println!("L1:     {:?}", config.l1_range());
    println!("Steps:  {}", config.train.effective_steps());
    println!("Output: {}", config.outputs_folder.display());

    let mut sweep = Sweep::new(config, devices)?;
    let outcome = sweep.run()?;

    println!("\n=== Results ===");
    if let Some(last) = outcome.mini_runs.last() {
        for (i, l1) in last.l1_range.iter().enumerate() {
            for (j, size) in last.dict_sizes.iter().enumerate() {
                let Some(recon) = last.reconstruction_loss[i][j] else {
                    println!("l1={l1:.2e} size={size:6}: failed");
                    continue;
                };
                let dead = last.dead_features[i][j]
                    .map_or_else(|| "-".into(), |d| d.to_string());
                let mmcs = last.mmcs_with_ground_truth[i][j]
                    .map(|m| format!(" mmcs {m:.3}"))
                    .unwrap_or_default();
                println!("l1={l1:.2e} size={size:6}: recon {recon:.5} dead {dead:>4}{mmcs}");
            }
        }
        if !last.failed_cells.is_empty() {
            println!("{} cells failed; see log", last.failed_cells.len());
        }
    }
    info!(
        "Results saved to {}",
        sweep.config().outputs_folder.display()
    );

    Ok(())
}
