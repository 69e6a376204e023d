// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

//! Autoregressive transformer over color-quantized image pixels.
//!
//! Images are quantized against a k-means [`codebook::Codebook`], flattened
//! into token sequences in a fixed pixel order, and modeled one token at a time
//! by [`modules::model::PixelTransformer`].

pub mod codebook;
pub mod data;
pub mod error;
pub mod modules;
pub mod optim;
pub mod running_mean;
pub mod sample;
pub mod train;

pub use codebook::{Codebook, KMeansConfig, kmeans};
pub use data::dataset::{PixelPermutation, PixelSequenceDataset, SequenceEncoder};
pub use error::{CodebookError, ModelError, TrainingError};
pub use modules::model::{ModelOutput, PixelTransformer, PixelTransformerConfig};
pub use sample::{SamplingConfig, sample};
pub use train::{Trainer, TrainingConfig, TrainingSummary};
