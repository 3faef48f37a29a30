//! # Multi-Task Training (`train`)
//!
//! Drives one shared optimizer over several task objectives (sentiment,
//! paraphrase, similarity, ...) whose losses all reach the same parameters.

use crate::nn::Module;
use crate::optim::{AdamW, AdamWConfig, OptimError, Optimizer};
use crate::tensor::{Tensor, TensorError};
use crate::utils::serialization::{self, SerializationError};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum TrainError {
    #[error("No task objectives registered")]
    NoTasks,
    #[error("Task '{task}' failed: {source}")]
    Task { task: String, source: TensorError },
    #[error("Optimizer error: {0}")]
    Optim(#[from] OptimError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] SerializationError),
}

/// One supervised task. The forward pass, loss and backward pass live in the
/// implementation; the trainer only sees the resulting loss and gradients.
pub trait TaskObjective {
    fn name(&self) -> &str;

    /// Computes the loss on the task's next batch and *adds* its gradients to
    /// the parameters it depends on (see [`Tensor::accumulate_grad`]).
    fn backward(&mut self, params: &BTreeMap<String, Tensor>) -> Result<f32, TensorError>;

    /// Scores the current parameters on held-out data, higher is better.
    /// Tasks without a dev set keep the default and are left out of the average.
    fn evaluate(&mut self, _params: &BTreeMap<String, Tensor>) -> Result<Option<f32>, TensorError> {
        Ok(None)
    }
}

/// How task gradients are combined into optimizer steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Schedule {
    /// Backward every task into the same gradients, then step once. The
    /// projection pass sees all task contributions at once.
    #[default]
    Accumulate,
    /// Clear, backward and step once per task, in registration order.
    Sequential,
}

/// Outcome of one [`MultiTaskTrainer::train_step`].
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    /// Loss of each task, in registration order.
    pub losses: Vec<(String, f32)>,
    /// Optimizer steps taken.
    pub optimizer_steps: usize,
}

impl StepReport {
    pub fn total_loss(&self) -> f32 {
        self.losses.iter().map(|(_, loss)| loss).sum()
    }
}

pub struct MultiTaskTrainer<M: Module> {
    model: M,
    optimizer: AdamW,
    tasks: Vec<Box<dyn TaskObjective>>,
    schedule: Schedule,
    step: u64,
    best_score: Option<f32>,
}

impl<M: Module> MultiTaskTrainer<M> {
    /// Builds an optimizer over all of the model's parameters, in name order.
    /// A tensor exposed under several names (tied weights) is managed once, at
    /// the position of its first name.
    pub fn new(model: M, config: AdamWConfig, schedule: Schedule) -> Result<Self, TrainError> {
        let mut seen = HashSet::new();
        let params: Vec<Tensor> = model
            .parameters()
            .into_values()
            .filter(|p| seen.insert(p.id()))
            .collect();
        let optimizer = AdamW::new(params, config)?;
        Ok(MultiTaskTrainer {
            model,
            optimizer,
            tasks: Vec::new(),
            schedule,
            step: 0,
            best_score: None,
        })
    }

    pub fn add_task(&mut self, task: Box<dyn TaskObjective>) {
        self.tasks.push(task);
    }

    pub fn with_task(mut self, task: Box<dyn TaskObjective>) -> Self {
        self.add_task(task);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Number of completed calls to [`train_step`](Self::train_step).
    pub fn steps_completed(&self) -> u64 {
        self.step
    }

    fn run_task(
        task: &mut dyn TaskObjective,
        params: &BTreeMap<String, Tensor>,
    ) -> Result<(String, f32), TrainError> {
        let name = task.name().to_string();
        let loss = task.backward(params).map_err(|source| TrainError::Task {
            task: name.clone(),
            source,
        })?;
        if !loss.is_finite() {
            tracing::warn!(task = %name, loss, "non-finite task loss");
        }
        Ok((name, loss))
    }

    /// Runs every task once according to the schedule.
    pub fn train_step(&mut self) -> Result<StepReport, TrainError> {
        if self.tasks.is_empty() {
            return Err(TrainError::NoTasks);
        }
        let params = self.model.parameters();
        let mut losses = Vec::with_capacity(self.tasks.len());
        let mut optimizer_steps = 0;

        match self.schedule {
            Schedule::Accumulate => {
                self.optimizer.clear_grad();
                for task in self.tasks.iter_mut() {
                    losses.push(Self::run_task(task.as_mut(), &params)?);
                }
                self.optimizer.step()?;
                optimizer_steps += 1;
            }
            Schedule::Sequential => {
                for task in self.tasks.iter_mut() {
                    self.optimizer.clear_grad();
                    losses.push(Self::run_task(task.as_mut(), &params)?);
                    self.optimizer.step()?;
                    optimizer_steps += 1;
                }
            }
        }

        self.step += 1;
        let report = StepReport {
            losses,
            optimizer_steps,
        };
        tracing::info!(
            step = self.step,
            schedule = ?self.schedule,
            total_loss = report.total_loss(),
            losses = ?report.losses,
            "multi-task step"
        );
        Ok(report)
    }

    /// Runs `n` steps and returns their reports.
    pub fn train(&mut self, n: usize) -> Result<Vec<StepReport>, TrainError> {
        (0..n).map(|_| self.train_step()).collect()
    }

    /// Mean of the dev scores of the tasks that report one, `None` if none do.
    pub fn evaluate(&mut self) -> Result<Option<f32>, TrainError> {
        if self.tasks.is_empty() {
            return Err(TrainError::NoTasks);
        }
        let params = self.model.parameters();
        let mut scores = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.iter_mut() {
            let score = task.evaluate(&params).map_err(|source| TrainError::Task {
                task: task.name().to_string(),
                source,
            })?;
            if let Some(score) = score {
                tracing::debug!(task = task.name(), score, "dev score");
                scores.push(score);
            }
        }
        if scores.is_empty() {
            return Ok(None);
        }
        Ok(Some(scores.iter().sum::<f32>() / scores.len() as f32))
    }

    /// Best mean dev score seen by [`save_if_best`](Self::save_if_best).
    pub fn best_score(&self) -> Option<f32> {
        self.best_score
    }

    /// Evaluates and writes a checkpoint to `path` when the mean dev score beats
    /// the best one so far. Returns whether a checkpoint was written.
    pub fn save_if_best<P: AsRef<Path>>(&mut self, path: P) -> Result<bool, TrainError> {
        let Some(score) = self.evaluate()? else {
            return Ok(false);
        };
        if self.best_score.is_some_and(|best| score <= best) {
            tracing::info!(score, best = ?self.best_score, "dev score did not improve");
            return Ok(false);
        }
        self.save_checkpoint(path.as_ref())?;
        self.best_score = Some(score);
        tracing::info!(score, path = %path.as_ref().display(), "new best dev score, saved checkpoint");
        Ok(true)
    }

    /// Runs `epochs` rounds of `steps_per_epoch` steps, keeping the checkpoint
    /// with the best dev score at `path`. Returns that score.
    pub fn fit<P: AsRef<Path>>(
        &mut self,
        epochs: usize,
        steps_per_epoch: usize,
        path: P,
    ) -> Result<Option<f32>, TrainError> {
        for epoch in 0..epochs {
            let reports = self.train(steps_per_epoch)?;
            let train_loss = if reports.is_empty() {
                0.0
            } else {
                reports.iter().map(StepReport::total_loss).sum::<f32>() / reports.len() as f32
            };
            let saved = self.save_if_best(path.as_ref())?;
            tracing::info!(epoch, train_loss, saved, "epoch finished");
        }
        Ok(self.best_score)
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainError> {
        serialization::save_checkpoint(&self.model, &self.optimizer, path)?;
        Ok(())
    }

    /// Restores parameters and optimizer state saved by
    /// [`save_checkpoint`](Self::save_checkpoint).
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<(), TrainError> {
        serialization::load_checkpoint(&self.model, &mut self.optimizer, path, true)?;
        Ok(())
    }
}
