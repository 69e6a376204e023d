// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use super::{
    attention::{CausalSelfAttention, CausalSelfAttentionConfig},
    model::PixelTransformerConfig,
    pwff::{FeedForward, FeedForwardConfig},
};
use crate::{error::ModelResult, optim::roles::ParamRegistry};
use burn::{
    module::Module,
    nn::{LayerNorm, LayerNormConfig},
    tensor::{Tensor, backend::Backend},
};

/// Pre-norm transformer block.
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    norm_1: LayerNorm<B>,
    attention: CausalSelfAttention<B>,
    norm_2: LayerNorm<B>,
    pwff: FeedForward<B>,
}

impl<B: Backend> Block<B> {
    pub(crate) fn new(config: &PixelTransformerConfig, device: &B::Device) -> ModelResult<Self> {
        Ok(Block {
            norm_1: LayerNormConfig::new(config.embedding_dim).init(device),
            attention: CausalSelfAttentionConfig::new(
                config.embedding_dim,
                config.num_heads,
                config.block_size,
            )
            .with_attention_dropout(config.attention_dropout)
            .with_residual_dropout(config.residual_dropout)
            .with_initializer(config.initializer.clone())
            .init(device)?,
            norm_2: LayerNormConfig::new(config.embedding_dim).init(device),
            pwff: FeedForwardConfig::new(config.embedding_dim, 4 * config.embedding_dim)
                .with_dropout_rate(config.residual_dropout)
                .with_initializer(config.initializer.clone())
                .init(device),
        })
    }

    pub(crate) fn forward(&self, context: Tensor<B, 3>) -> ModelResult<Tensor<B, 3>> {
        let x = context;
        let residual_path = self.norm_1.forward(x.clone());
        let residual_path = self.attention.forward(residual_path)?;
        let x = x + residual_path;
        let residual_path = self.norm_2.forward(x.clone());
        let residual_path = self.pwff.forward(residual_path);
        Ok(x + residual_path)
    }

    pub(crate) fn register_params(&self, registry: &mut ParamRegistry) {
        registry.register_layer_norm("norm_1", &self.norm_1);
        registry.scoped("attention", |r| self.attention.register_params(r));
        registry.register_layer_norm("norm_2", &self.norm_2);
        registry.scoped("pwff", |r| self.pwff.register_params(r));
    }
}
