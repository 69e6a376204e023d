// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod checkpoint;
pub mod context;
pub mod progress;

use burn::{
    config::Config,
    data::dataset::Dataset,
    module::AutodiffModule,
    optim::{AdamWConfig, Optimizer},
    prelude::Backend,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use strum_macros::IntoStaticStr;
use tracing::{debug, error, info};

use crate::{
    data::{PixelLoader, build_data_loader, dataset::PixelSequenceItem},
    error::{TrainingError, TrainingResult},
    modules::model::PixelTransformer,
    optim::{
        grads::clip_global_norm,
        groups::{GroupedOptimizer, ParamGroups},
        schedule::{LrSchedule, LrScheduler},
    },
    running_mean::RunningMean,
};
use checkpoint::CheckpointSink;
use context::{ExecutionContext, ReplicaStep};
use progress::{EpochProgress, ProgressReporter, StepProgress};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 3e-4)]
    pub learning_rate: f64,
    #[config(default = 0.9)]
    pub beta_1: f32,
    #[config(default = 0.95)]
    pub beta_2: f32,
    #[config(default = 1e-8)]
    pub epsilon: f32,
    /// Maximum global L2 norm of the gradients.
    #[config(default = 1.0)]
    pub grad_norm_clip: f64,
    /// Applied to linear weights only.
    #[config(default = 0.1)]
    pub weight_decay: f32,
    #[config(default = "LrSchedule::Fixed")]
    pub lr_schedule: LrSchedule,
    /// Target tokens over which the rate warms up linearly.
    #[config(default = 375_000_000)]
    pub warmup_tokens: u64,
    /// Target tokens at which the cosine decay reaches its floor.
    #[config(default = 260_000_000_000)]
    pub final_tokens: u64,
    /// Background threads encoding batches; zero encodes on the training thread.
    #[config(default = 0)]
    pub num_workers: usize,
    /// Seeds the shuffling of the training split.
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainingError::InvalidConfig("learning_rate must be positive".into()));
        }
        if !(self.grad_norm_clip.is_finite() && self.grad_norm_clip > 0.0) {
            return Err(TrainingError::InvalidConfig("grad_norm_clip must be positive".into()));
        }
        for (name, beta) in [("beta_1", self.beta_1), ("beta_2", self.beta_2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TrainingError::InvalidConfig(format!("{name} must be in [0, 1)")));
            }
        }
        if self.weight_decay < 0.0 {
            return Err(TrainingError::InvalidConfig("weight_decay must not be negative".into()));
        }
        Ok(())
    }

    pub fn adamw(&self) -> AdamWConfig {
        AdamWConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.epsilon)
    }

    pub fn scheduler(&self) -> LrScheduler {
        LrScheduler::new(
            self.lr_schedule,
            self.learning_rate,
            self.warmup_tokens,
            self.final_tokens,
        )
    }

    /// Loader over the training split, reshuffled every epoch.
    pub fn train_loader<B, D>(&self, dataset: D) -> PixelLoader<B>
    where
        B: Backend,
        D: Dataset<PixelSequenceItem> + 'static,
    {
        build_data_loader(dataset, self.batch_size, self.num_workers, Some(self.seed))
    }

    pub fn valid_loader<B, D>(&self, dataset: D) -> PixelLoader<B>
    where
        B: Backend,
        D: Dataset<PixelSequenceItem> + 'static,
    {
        build_data_loader(dataset, self.batch_size, self.num_workers, None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum TrainingPhase {
    Idle,
    TrainEpoch { epoch: usize },
    ValidateEpoch { epoch: usize },
    CheckpointDecision { epoch: usize },
    Done,
}

/// Tracks the best validation loss and decides when to checkpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct BestLossTracker {
    best: Option<f64>,
}

impl BestLossTracker {
    /// Without validation every epoch checkpoints. Otherwise only a finite loss
    /// strictly below the best so far does, and it becomes the new best.
    pub fn should_checkpoint(&mut self, valid_loss: Option<f64>) -> bool {
        match valid_loss {
            None => true,
            Some(loss) if loss.is_finite() && self.best.is_none_or(|best| loss < best) => {
                self.best = Some(loss);
                true
            }
            Some(_) => false,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub steps: usize,
    /// Target tokens processed over the run.
    pub tokens: u64,
    pub train_losses: Vec<f64>,
    pub valid_losses: Vec<f64>,
    pub best_valid_loss: Option<f64>,
    pub checkpoints: usize,
}

pub(crate) fn ensure_finite(loss: f64, epoch: usize, step: usize) -> TrainingResult<f64> {
    if loss.is_finite() {
        Ok(loss)
    } else {
        error!(epoch, step, loss, "training loss is not finite");
        Err(TrainingError::NonFiniteLoss { epoch, step, loss })
    }
}

/// A loader stops at the first item its dataset fails to produce.
pub(crate) fn ensure_complete(epoch: usize, seen: usize, expected: usize) -> TrainingResult<()> {
    if seen != expected {
        error!(epoch, seen, expected, "epoch ended before the whole split was read");
        return Err(TrainingError::IncompleteEpoch { epoch, seen, expected });
    }
    Ok(())
}

/// Drives epochs of training, validation and checkpoint decisions.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    context: ExecutionContext<B>,
    phase: TrainingPhase,
}

struct EpochState<'a, O, R: ?Sized> {
    optimizer: &'a mut GroupedOptimizer<O>,
    scheduler: &'a mut LrScheduler,
    reporter: &'a mut R,
    summary: &'a mut TrainingSummary,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, context: ExecutionContext<B>) -> TrainingResult<Self> {
        config.validate()?;
        Ok(Self { config, context, phase: TrainingPhase::Idle })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    fn enter(&mut self, phase: TrainingPhase) {
        let name: &'static str = (&phase).into();
        debug!(phase = name, "training phase");
        self.phase = phase;
    }

    /// Trains `model` for the configured number of epochs.
    ///
    /// Returns the trained model and a summary of the run. A non-finite training
    /// loss aborts the run before the offending update is applied.
    pub fn fit<R, C>(
        &mut self,
        model: PixelTransformer<B>,
        train: &PixelLoader<B>,
        valid: Option<&PixelLoader<B::InnerBackend>>,
        reporter: &mut R,
        checkpoints: &mut C,
    ) -> TrainingResult<(PixelTransformer<B>, TrainingSummary)>
    where
        R: ProgressReporter + ?Sized,
        C: CheckpointSink<PixelTransformer<B>> + ?Sized,
    {
        let groups = ParamGroups::from_model(&model, self.config.weight_decay)?;
        let adamw = self.config.adamw();
        let decay = adamw
            .clone()
            .with_weight_decay(groups.decay.weight_decay)
            .init::<B, PixelTransformer<B>>();
        let no_decay = adamw
            .with_weight_decay(groups.no_decay.weight_decay)
            .init::<B, PixelTransformer<B>>();
        let mut optimizer = GroupedOptimizer::new(groups, decay, no_decay);
        let mut scheduler = self.config.scheduler();
        let mut best = BestLossTracker::default();
        let mut summary = TrainingSummary::default();

        info!(
            num_epochs = self.config.num_epochs,
            batch_size = self.config.batch_size,
            replicas = self.context.replica_count(),
            "starting training"
        );

        let mut model = model;
        for epoch in 0..self.config.num_epochs {
            self.enter(TrainingPhase::TrainEpoch { epoch });
            let mut state = EpochState {
                optimizer: &mut optimizer,
                scheduler: &mut scheduler,
                reporter: &mut *reporter,
                summary: &mut summary,
            };
            let (trained, train_loss) = self.train_epoch(epoch, model, train, &mut state)?;
            model = trained;

            let valid_loss = match valid {
                Some(loader) => {
                    self.enter(TrainingPhase::ValidateEpoch { epoch });
                    Some(self.validate_epoch(epoch, &model, loader)?)
                }
                None => None,
            };

            self.enter(TrainingPhase::CheckpointDecision { epoch });
            let checkpointed = best.should_checkpoint(valid_loss);
            if checkpointed {
                checkpoints.save(epoch, &model)?;
                summary.checkpoints += 1;
            }

            summary.epochs += 1;
            summary.train_losses.push(train_loss);
            summary.valid_losses.extend(valid_loss);
            reporter.on_epoch(&EpochProgress { epoch, train_loss, valid_loss, checkpointed });
        }

        self.enter(TrainingPhase::Done);
        summary.best_valid_loss = best.best();
        Ok((model, summary))
    }

    fn train_epoch<O, R>(
        &self,
        epoch: usize,
        mut model: PixelTransformer<B>,
        loader: &PixelLoader<B>,
        state: &mut EpochState<'_, O, R>,
    ) -> TrainingResult<(PixelTransformer<B>, f64)>
    where
        O: Optimizer<PixelTransformer<B>, B>,
        R: ProgressReporter + ?Sized,
    {
        let mut losses = RunningMean::new();
        let mut seen = 0;
        for (step, batch) in loader.iter().enumerate() {
            let num_targets = batch.num_targets();
            seen += batch.inputs.dims()[0];
            let ReplicaStep { loss, mut grads } = self.context.forward_backward(&model, batch)?;
            let loss = ensure_finite(loss, epoch, step)?;

            let grad_norm = clip_global_norm::<B::InnerBackend>(
                &mut grads,
                model.param_roles().entries(),
                self.config.grad_norm_clip,
            );
            let learning_rate = state.scheduler.step(num_targets);
            model = state.optimizer.step::<B, _>(learning_rate, model, grads);

            losses.add(loss);
            state.summary.steps += 1;
            state.summary.tokens += num_targets as u64;
            state.reporter.on_step(&StepProgress {
                epoch,
                step,
                global_step: state.summary.steps,
                loss,
                learning_rate,
                grad_norm,
                tokens: state.summary.tokens,
            });
        }

        ensure_complete(epoch, seen, loader.num_items())?;
        match losses.value() {
            Some(train_loss) => Ok((model, train_loss)),
            None => Err(TrainingError::EmptyTrainingSplit),
        }
    }

    fn validate_epoch(
        &self,
        epoch: usize,
        model: &PixelTransformer<B>,
        loader: &PixelLoader<B::InnerBackend>,
    ) -> TrainingResult<f64> {
        let model = model.valid();
        let device = self.context.primary();
        let mut losses = RunningMean::new();
        let mut seen = 0;
        for batch in loader.iter() {
            seen += batch.inputs.dims()[0];
            let inputs = batch.inputs.to_device(device);
            let targets = batch.targets.to_device(device);
            if let Some(loss) = model.forward(inputs, Some(targets))?.loss {
                losses.add(loss.into_scalar().elem::<f64>());
            }
        }
        ensure_complete(epoch, seen, loader.num_items())?;
        losses.value().ok_or_else(|| {
            TrainingError::InvalidConfig("validation split produced no batches".into())
        })
    }
}
