// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use burn::{
    prelude::Backend,
    store::{ModuleSnapshot, SafetensorsStore},
};
use tracing::info;

use crate::{
    error::{TrainingError, TrainingResult},
    modules::model::PixelTransformer,
};

/// Destination for parameter snapshots taken when validation loss improves.
pub trait CheckpointSink<M> {
    fn save(&mut self, epoch: usize, model: &M) -> TrainingResult<()>;
}

/// Keeps the most recent snapshot in memory.
#[derive(Debug)]
pub struct InMemoryCheckpoint<M> {
    latest: Option<(usize, M)>,
    saved_epochs: Vec<usize>,
}

impl<M> Default for InMemoryCheckpoint<M> {
    fn default() -> Self {
        Self { latest: None, saved_epochs: Vec::new() }
    }
}

impl<M> InMemoryCheckpoint<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&(usize, M)> {
        self.latest.as_ref()
    }

    pub fn saved_epochs(&self) -> &[usize] {
        &self.saved_epochs
    }

    pub fn into_latest(self) -> Option<M> {
        self.latest.map(|(_, model)| model)
    }
}

impl<M: Clone> CheckpointSink<M> for InMemoryCheckpoint<M> {
    fn save(&mut self, epoch: usize, model: &M) -> TrainingResult<()> {
        self.latest = Some((epoch, model.clone()));
        self.saved_epochs.push(epoch);
        Ok(())
    }
}

/// Writes each snapshot to a single safetensors file, replacing the previous one.
#[derive(Clone, Debug)]
pub struct SafetensorsCheckpoint {
    path: PathBuf,
}

impl SafetensorsCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<B: Backend> CheckpointSink<PixelTransformer<B>> for SafetensorsCheckpoint {
    fn save(&mut self, epoch: usize, model: &PixelTransformer<B>) -> TrainingResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| TrainingError::Checkpoint(err.to_string()))?;
        }
        let mut store = SafetensorsStore::from_file(&self.path);
        model
            .save_into(&mut store)
            .map_err(|err| TrainingError::Checkpoint(format!("{err:?}")))?;
        info!(epoch, path = %self.path.display(), "saved checkpoint");
        Ok(())
    }
}

/// Loads parameters written by [`SafetensorsCheckpoint`] into `model`.
pub fn load_checkpoint<B: Backend>(
    mut model: PixelTransformer<B>,
    path: impl AsRef<Path>,
) -> TrainingResult<PixelTransformer<B>> {
    let mut store = SafetensorsStore::from_file(path.as_ref());
    model
        .load_from(&mut store)
        .map_err(|err| TrainingError::Checkpoint(format!("{err:?}")))?;
    Ok(model)
}
