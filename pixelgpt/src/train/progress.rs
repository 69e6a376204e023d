use tracing::{debug, info};

/// One optimizer update.
#[derive(Clone, Debug, PartialEq)]
pub struct StepProgress {
    pub epoch: usize,
    /// Step index within the epoch.
    pub step: usize,
    pub global_step: usize,
    pub loss: f64,
    pub learning_rate: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    /// Target tokens seen so far in the run.
    pub tokens: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EpochProgress {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: Option<f64>,
    pub checkpointed: bool,
}

/// Receives progress as training runs.
pub trait ProgressReporter {
    fn on_step(&mut self, _progress: &StepProgress) {}

    fn on_epoch(&mut self, _progress: &EpochProgress) {}
}

/// Logs steps at debug level every `log_every` steps and every epoch at info level.
#[derive(Clone, Debug)]
pub struct TracingReporter {
    log_every: usize,
}

impl TracingReporter {
    pub fn new(log_every: usize) -> Self {
        Self { log_every: log_every.max(1) }
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ProgressReporter for TracingReporter {
    fn on_step(&mut self, progress: &StepProgress) {
        if progress.global_step % self.log_every == 0 {
            debug!(
                epoch = progress.epoch,
                step = progress.step,
                loss = progress.loss,
                lr = progress.learning_rate,
                grad_norm = progress.grad_norm,
                tokens = progress.tokens,
                "train step"
            );
        }
    }

    fn on_epoch(&mut self, progress: &EpochProgress) {
        info!(
            epoch = progress.epoch,
            train_loss = progress.train_loss,
            valid_loss = progress.valid_loss,
            checkpointed = progress.checkpointed,
            "epoch finished"
        );
    }
}
