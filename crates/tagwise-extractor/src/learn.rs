//! Parallel online learning
//!
//! All trainers share one loop: perceptron-style updates over the training
//! set, parallelized by iterative parameter mixing. Each epoch splits the
//! instances into `thread_count` contiguous shards, runs one pass per shard
//! on a private copy of the current weights, and averages the shard weights
//! in shard order. The shards never share mutable state, and the merge
//! order is fixed, so a given thread count and instance order always
//! produce the same model.

use ndarray::Array1;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use tagwise_core::{Result, TagwiseError, TrainingConfig};

/// A learning problem the online loop can optimize
pub trait OnlineObjective: Sync {
    type Instance: Sync;

    /// Length of the weight vector
    fn dimension(&self) -> usize;

    /// Apply one update for `instance`; returns whether the weights changed
    fn update(&self, weights: &mut Array1<f64>, instance: &Self::Instance, learning_rate: f64)
        -> bool;

    /// Whether `weights` get `instance` wrong, without any margin
    fn is_mistake(&self, weights: &Array1<f64>, instance: &Self::Instance) -> bool;
}

/// What happened during a training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub converged: bool,
    pub training_mistakes: usize,
    pub averaged: bool,
}

/// Contiguous, near-equal shards; empty shards are dropped
fn shards<T>(items: &[T], count: usize) -> Vec<&[T]> {
    let n = items.len();
    (0..count)
        .map(|k| &items[k * n / count..(k + 1) * n / count])
        .filter(|shard| !shard.is_empty())
        .collect()
}

fn count_mistakes<O: OnlineObjective>(
    objective: &O,
    weights: &Array1<f64>,
    instances: &[O::Instance],
) -> usize {
    instances
        .par_iter()
        .filter(|inst| objective.is_mistake(weights, inst))
        .count()
}

/// Optimize `objective` over `instances`
///
/// Stops after an epoch with no updates or after `config.max_epochs`.
/// Returns the average of the per-epoch weights unless the final weights
/// make fewer training mistakes.
pub fn train_online<O: OnlineObjective>(
    objective: &O,
    instances: &[O::Instance],
    config: &TrainingConfig,
    thread_count: usize,
) -> Result<(Array1<f64>, TrainingSummary)> {
    if instances.is_empty() {
        return Err(TagwiseError::EmptyTrainingSet(
            "no training instances were supplied".to_string(),
        ));
    }

    let thread_count = thread_count.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(thread_count)
        .build()
        .map_err(anyhow::Error::from)?;
    let shards = shards(instances, thread_count);

    let dimension = objective.dimension();
    let mut weights = Array1::<f64>::zeros(dimension);
    let mut sum = Array1::<f64>::zeros(dimension);
    let mut epochs = 0;
    let mut converged = false;

    info!(
        "Training on {} instances, {} shards, {} dimensions",
        instances.len(),
        shards.len(),
        dimension
    );

    for epoch in 1..=config.max_epochs {
        let current = &weights;
        let results: Vec<(Array1<f64>, usize)> = pool.install(|| {
            shards
                .par_iter()
                .map(|shard| {
                    let mut local = current.clone();
                    let updates = shard
                        .iter()
                        .filter(|inst| objective.update(&mut local, inst, config.learning_rate))
                        .count();
                    (local, updates)
                })
                .collect()
        });

        let updates: usize = results.iter().map(|(_, u)| u).sum();
        epochs = epoch;

        if updates > 0 {
            let mut mixed = Array1::<f64>::zeros(dimension);
            for (local, _) in &results {
                mixed += local;
            }
            mixed /= results.len() as f64;
            weights = mixed;

            if weights.iter().any(|w| !w.is_finite()) {
                return Err(TagwiseError::Numerical(format!(
                    "weights became non-finite in epoch {epoch}"
                )));
            }
        }
        sum += &weights;

        debug!("Epoch {}: {} updates", epoch, updates);
        if updates == 0 {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            "Training stopped after {} epochs without converging",
            config.max_epochs
        );
    }

    let averaged = sum / epochs.max(1) as f64;
    let (avg_mistakes, final_mistakes) = pool.install(|| {
        (
            count_mistakes(objective, &averaged, instances),
            count_mistakes(objective, &weights, instances),
        )
    });

    let (chosen, training_mistakes, used_average) = if avg_mistakes <= final_mistakes {
        (averaged, avg_mistakes, true)
    } else {
        (weights, final_mistakes, false)
    };

    info!(
        "Training finished after {} epochs ({} training mistakes)",
        epochs, training_mistakes
    );

    Ok((
        chosen,
        TrainingSummary {
            epochs,
            converged,
            training_mistakes,
            averaged: used_average,
        },
    ))
}
