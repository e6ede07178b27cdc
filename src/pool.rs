//! Fixed worker pool for sweep cells
//!
//! One worker per device pulls [`CellJob`]s from a shared queue, moves the
//! model onto its device, trains it to completion and sends the result back.
//! Cells own disjoint model and data state, so workers never synchronize
//! beyond the two channels.

use anyhow::Result;
use candle_core::Device;
use crossbeam_channel::unbounded;
use tracing::{debug, error, info};

use crate::autoencoder::SparseAutoencoder;
use crate::config::TrainConfig;
use crate::dataset::ActivationSource;
use crate::sweep::SweepCell;
use crate::training::{train, TrainOutcome};

/// A model plus the settings to train it with
pub struct CellJob {
    pub cell: SweepCell,
    pub model: SparseAutoencoder,
    pub config: TrainConfig,
}

/// The model after training (on the worker's device) and how training went
pub struct CellResult {
    pub cell: SweepCell,
    pub model: SparseAutoencoder,
    pub outcome: Result<TrainOutcome>,
}

/// Train one cell on `device`. Failures are captured in `outcome`; the model
/// is returned either way.
pub fn run_job<'a, F>(job: CellJob, device: &Device, make_source: &F) -> CellResult
where
    F: Fn(&SweepCell, &Device) -> Result<Box<dyn ActivationSource + 'a>>,
{
    let CellJob {
        cell,
        model,
        config,
    } = job;
    let mut model = match model.to_device(device) {
        Ok(m) => m,
        Err(e) => {
            return CellResult {
                cell,
                model,
                outcome: Err(e),
            }
        }
    };
    info!(
        "Cell l1={:e} dict_size={} on {:?}",
        cell.l1_alpha, cell.dict_size, device
    );
    let outcome = make_source(&cell, device)
        .and_then(|mut source| train(&mut model, source.as_mut(), &config));
    match &outcome {
        Ok(o) => debug!(
            "Cell l1={:e} dict_size={} done: recon {:.6}, dead {}",
            cell.l1_alpha, cell.dict_size, o.running_recon_loss, o.dead_features
        ),
        Err(e) => error!(
            "Cell l1={:e} dict_size={} failed: {e:#}",
            cell.l1_alpha, cell.dict_size
        ),
    }
    CellResult {
        cell,
        model,
        outcome,
    }
}

/// Run all jobs across `devices`, one worker thread each. Results come back
/// in completion order.
pub fn run_jobs<'a, F>(
    jobs: Vec<CellJob>,
    devices: &[Device],
    make_source: F,
) -> Result<Vec<CellResult>>
where
    F: Fn(&SweepCell, &Device) -> Result<Box<dyn ActivationSource + 'a>> + Sync,
{
    anyhow::ensure!(!devices.is_empty(), "Worker pool needs at least one device");
    let n_jobs = jobs.len();
    let (job_tx, job_rx) = unbounded::<CellJob>();
    let (result_tx, result_rx) = unbounded::<CellResult>();
    for job in jobs {
        job_tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("Job queue closed before dispatch"))?;
    }
    drop(job_tx);

    info!("Dispatching {n_jobs} cells to {} workers", devices.len());
    let make_source = &make_source;
    std::thread::scope(|scope| {
        for (worker, device) in devices.iter().enumerate() {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for job in job_rx.iter() {
                    let result = run_job(job, device, make_source);
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
                debug!("Worker {worker} drained the queue");
            });
        }
    });
    drop(result_tx);

    let results: Vec<CellResult> = result_rx.iter().collect();
    anyhow::ensure!(
        results.len() == n_jobs,
        "Worker pool returned {} of {n_jobs} results",
        results.len()
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoencoder::DictKind;
    use crate::config::GeneratorConfig;
    use crate::dataset::DatasetGenerator;

    fn jobs(n: usize) -> Vec<CellJob> {
        let device = Device::Cpu;
        (0..n)
            .map(|i| CellJob {
                cell: SweepCell {
                    l1_index: 0,
                    dict_index: i,
                    l1_alpha: 1e-3,
                    dict_size: 4 * (i + 1),
                },
                model: SparseAutoencoder::new(4, 4 * (i + 1), DictKind::Untied, 1e-3, &device, 0)
                    .unwrap(),
                config: TrainConfig {
                    n_steps: 4,
                    log_every: 2,
                    l1_alpha: 1e-3,
                    ..Default::default()
                },
            })
            .collect()
    }

    fn generator() -> DatasetGenerator {
        let config = GeneratorConfig {
            activation_dim: 4,
            n_ground_truth_components: 6,
            batch_size: 8,
            feature_num_nonzero: 2,
            correlated: false,
            ..Default::default()
        };
        DatasetGenerator::new(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_pool_runs_every_job() {
        let gen = generator();
        let devices = vec![Device::Cpu, Device::Cpu];
        let results = run_jobs(jobs(3), &devices, |_, _| {
            Ok(Box::new(gen.stream(0)) as Box<dyn ActivationSource + '_>)
        })
        .unwrap();
        assert_eq!(results.len(), 3);
        let mut sizes: Vec<usize> = results
            .iter()
            .map(|r| r.model.n_dict_components())
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![4, 8, 12]);
        assert!(results.iter().all(|r| r.outcome.is_ok()));
    }

    #[test]
    fn test_failed_source_is_captured() {
        let results = run_jobs(jobs(2), &[Device::Cpu], |_, _| {
            Err::<Box<dyn ActivationSource>, _>(anyhow::anyhow!("no data"))
        })
        .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome.is_err()));
    }

    #[test]
    fn test_empty_device_list_rejected() {
        let gen = generator();
        let out = run_jobs(jobs(1), &[], |_, _| {
            Ok(Box::new(gen.stream(0)) as Box<dyn ActivationSource + '_>)
        });
        assert!(out.is_err());
    }
}
