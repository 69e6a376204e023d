// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use strum_macros::IntoStaticStr;
use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;
pub type CodebookResult<T> = Result<T, CodebookError>;
pub type TrainingResult<T> = Result<T, TrainingError>;

/// Configuration and forward-time failures of the transformer and its optimizer groups.
#[derive(Clone, Debug, Error, IntoStaticStr, PartialEq)]
pub enum ModelError {
    #[error("embedding dim {embedding_dim} is not divisible by num heads {num_heads}")]
    HeadsDoNotDivideEmbedding { embedding_dim: usize, num_heads: usize },
    #[error("sequence length {seq_len} exceeds block size {block_size}")]
    BlockSizeExceeded { seq_len: usize, block_size: usize },
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("parameters assigned to both decay groups: {0:?}")]
    OverlappingParamGroups(Vec<String>),
    #[error("{missing} of {total} model parameters are in neither decay group")]
    IncompleteParamGroups { missing: usize, total: usize },
    #[error("parameter groups reference tensors the model does not own: {0:?}")]
    ForeignParams(Vec<String>),
    #[error("invalid sampling config: {0}")]
    InvalidSampling(String),
    #[error("failed to read tensor data: {0}")]
    TensorData(String),
}

/// Failures while building or applying the color codebook.
#[derive(Clone, Debug, Error, IntoStaticStr, PartialEq)]
pub enum CodebookError {
    #[error("need at least {clusters} sample points, got {points}")]
    InsufficientData { points: usize, clusters: usize },
    #[error("{dead} clusters still empty after {attempts} re-seed attempts")]
    DeadClustersPersist { dead: usize, attempts: usize },
    #[error("invalid k-means config: {0}")]
    InvalidConfig(String),
    #[error("image has {actual} pixels but the permutation expects {expected}")]
    PixelCountMismatch { expected: usize, actual: usize },
    #[error("image {index} cannot be encoded: {reason}")]
    InvalidImage { index: usize, reason: String },
    #[error("token {token} is outside a codebook of {size} colors")]
    TokenOutOfRange { token: usize, size: usize },
    #[error("codebook serialization error: {0}")]
    Serialization(String),
}

/// Fatal errors raised while driving a training run.
#[derive(Clone, Debug, Error, IntoStaticStr, PartialEq)]
pub enum TrainingError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("non-finite training loss {loss} at epoch {epoch} step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, loss: f64 },
    #[error("invalid training config: {0}")]
    InvalidConfig(String),
    #[error("training split produced no batches")]
    EmptyTrainingSplit,
    #[error("epoch {epoch} read {seen} of {expected} items")]
    IncompleteEpoch { epoch: usize, seen: usize, expected: usize },
    #[error("checkpoint sink failed: {0}")]
    Checkpoint(String),
}
