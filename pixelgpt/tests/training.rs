#![allow(clippy::unwrap_used, clippy::expect_used)]

use burn::backend::{Autodiff, NdArray};
use burn::data::dataset::{Dataset, InMemDataset};
use pixelgpt::{
    data::dataset::PixelSequenceItem,
    error::TrainingError,
    modules::model::{PixelTransformer, PixelTransformerConfig},
    optim::schedule::LrSchedule,
    train::{
        Trainer, TrainingConfig, TrainingPhase,
        checkpoint::InMemoryCheckpoint,
        context::ExecutionContext,
        progress::{EpochProgress, ProgressReporter, StepProgress, TracingReporter},
    },
};

type TestBackend = Autodiff<NdArray<f32>>;

#[derive(Default)]
struct Recorder {
    steps: Vec<StepProgress>,
    epochs: Vec<EpochProgress>,
}

impl ProgressReporter for Recorder {
    fn on_step(&mut self, progress: &StepProgress) {
        self.steps.push(progress.clone());
    }

    fn on_epoch(&mut self, progress: &EpochProgress) {
        self.epochs.push(progress.clone());
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Alternating two-color sequences of block size 4.
fn alternating(count: usize) -> InMemDataset<PixelSequenceItem> {
    let items = (0..count)
        .map(|i| {
            let first = (i % 2) as u32;
            let tokens: Vec<u32> = (0..5).map(|p| (first + p) % 2).collect();
            PixelSequenceItem { inputs: tokens[..4].to_vec(), targets: tokens[1..].to_vec() }
        })
        .collect();
    InMemDataset::new(items)
}

/// Wraps a split and fails to produce one of its items.
struct Unreadable {
    items: InMemDataset<PixelSequenceItem>,
    broken: usize,
}

impl Dataset<PixelSequenceItem> for Unreadable {
    fn get(&self, index: usize) -> Option<PixelSequenceItem> {
        if index == self.broken { None } else { self.items.get(index) }
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn tiny_model() -> PixelTransformer<TestBackend> {
    PixelTransformerConfig::new(2, 4)
        .with_embedding_dim(16)
        .with_num_layers(1)
        .with_num_heads(1)
        .with_embedding_dropout(0.0)
        .with_residual_dropout(0.0)
        .with_attention_dropout(0.0)
        .init(&Default::default())
        .unwrap()
}

fn config() -> TrainingConfig {
    TrainingConfig::new().with_num_epochs(8).with_batch_size(4).with_learning_rate(1e-2)
}

#[test]
fn loss_decreases_on_a_repeating_pattern() {
    init_logging();
    let config = config();
    let train = config.train_loader(alternating(8));
    let mut trainer = Trainer::new(config, ExecutionContext::single(Default::default())).unwrap();
    let mut recorder = Recorder::default();
    let mut checkpoints = InMemoryCheckpoint::new();

    let (_, summary) =
        trainer.fit(tiny_model(), &train, None, &mut recorder, &mut checkpoints).unwrap();

    let first = summary.train_losses[0];
    let last = *summary.train_losses.last().unwrap();
    assert!(last < first, "loss went from {first} to {last}");
    let first_step = recorder.steps[0].loss;
    let last_step = recorder.steps.last().unwrap().loss;
    assert!(last_step < first_step, "step loss went from {first_step} to {last_step}");
    assert_eq!(summary.epochs, 8);
    assert_eq!(summary.steps, 16);
    assert_eq!(summary.tokens, 16 * 16);
    assert_eq!(recorder.steps.len(), 16);
    assert_eq!(trainer.phase(), TrainingPhase::Done);

    // Without a validation split every epoch is checkpointed.
    assert_eq!(checkpoints.saved_epochs(), (0..8).collect::<Vec<_>>().as_slice());
    assert_eq!(summary.best_valid_loss, None);
}

#[test]
fn validation_drives_checkpoints() {
    let config = config().with_num_epochs(4);
    let train = config.train_loader(alternating(8));
    let valid = config.valid_loader(alternating(4));
    let mut trainer = Trainer::new(config, ExecutionContext::single(Default::default())).unwrap();
    let mut recorder = Recorder::default();
    let mut checkpoints = InMemoryCheckpoint::new();

    let (_, summary) =
        trainer.fit(tiny_model(), &train, Some(&valid), &mut recorder, &mut checkpoints).unwrap();

    assert_eq!(summary.valid_losses.len(), 4);
    assert_eq!(checkpoints.saved_epochs().first(), Some(&0));
    assert_eq!(checkpoints.saved_epochs().len(), summary.checkpoints);

    let best = summary.valid_losses.iter().copied().fold(f64::INFINITY, f64::min);
    assert_eq!(summary.best_valid_loss, Some(best));
    for epoch in &recorder.epochs {
        assert_eq!(epoch.checkpointed, checkpoints.saved_epochs().contains(&epoch.epoch));
    }
}

#[test]
fn warmup_scales_the_first_steps() {
    let config = config()
        .with_num_epochs(1)
        .with_lr_schedule(LrSchedule::WarmupCosine)
        .with_warmup_tokens(1_000)
        .with_final_tokens(10_000);
    let train = config.train_loader(alternating(8));
    let mut trainer = Trainer::new(config, ExecutionContext::single(Default::default())).unwrap();
    let mut recorder = Recorder::default();

    trainer
        .fit(tiny_model(), &train, None, &mut recorder, &mut InMemoryCheckpoint::new())
        .unwrap();

    let rates: Vec<f64> = recorder.steps.iter().map(|step| step.learning_rate).collect();
    assert!((rates[0] - 1e-2 * 16.0 / 1_000.0).abs() < 1e-12);
    assert!((rates[1] - 1e-2 * 32.0 / 1_000.0).abs() < 1e-12);
}

#[test]
fn replicas_share_each_batch() {
    let config = config();
    let train = config.train_loader(alternating(8));
    let context = ExecutionContext::replicated(vec![Default::default(); 2]).unwrap();
    let mut trainer = Trainer::new(config, context).unwrap();

    let (_, summary) = trainer
        .fit(
            tiny_model(),
            &train,
            None,
            &mut TracingReporter::default(),
            &mut InMemoryCheckpoint::new(),
        )
        .unwrap();

    assert!(summary.train_losses.last().unwrap() < &summary.train_losses[0]);
    assert_eq!(summary.tokens, 16 * 16);
}

#[test]
fn empty_training_split_is_an_error() {
    let config = config();
    let train = config.train_loader(InMemDataset::new(vec![]));
    let mut trainer = Trainer::new(config, ExecutionContext::single(Default::default())).unwrap();

    let result = trainer.fit(
        tiny_model(),
        &train,
        None,
        &mut TracingReporter::default(),
        &mut InMemoryCheckpoint::new(),
    );
    assert_eq!(result.err(), Some(TrainingError::EmptyTrainingSplit));
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let result = Trainer::<TestBackend>::new(
        config().with_grad_norm_clip(0.0),
        ExecutionContext::single(Default::default()),
    );
    assert!(matches!(result, Err(TrainingError::InvalidConfig(_))));
}

#[test]
fn unreadable_item_in_the_middle_fails_the_epoch() {
    let config = config().with_batch_size(1);
    let train = config.train_loader(Unreadable { items: alternating(5), broken: 2 });
    let mut trainer = Trainer::new(config, ExecutionContext::single(Default::default())).unwrap();

    let result = trainer.fit(
        tiny_model(),
        &train,
        None,
        &mut TracingReporter::default(),
        &mut InMemoryCheckpoint::new(),
    );
    match result {
        Err(TrainingError::IncompleteEpoch { epoch, seen, expected }) => {
            assert_eq!(epoch, 0);
            assert_eq!(expected, 5);
            assert!(seen < expected);
        }
        other => panic!("expected an incomplete epoch, got {:?}", other.err()),
    }
}
