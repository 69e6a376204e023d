// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::attention::generate_autoregressive_mask;
use burn::nn::{Dropout, DropoutConfig, Initializer, Linear};
use burn::prelude::Backend;
use burn::tensor::activation::softmax;
use burn::tensor::{Bool, Tensor, TensorData};

use crate::error::{ModelError, ModelResult};
use crate::modules::linear;
use crate::optim::roles::ParamRegistry;

/// Autoregressive mask computed once for the longest sequence the model accepts.
///
/// Entries are `true` where key position `j` lies after query position `i`.
#[derive(Clone, Debug)]
pub struct CausalMask {
    block_size: usize,
    data: TensorData,
}

impl CausalMask {
    pub fn new<B: Backend>(block_size: usize, device: &B::Device) -> Self {
        let data = generate_autoregressive_mask::<B>(1, block_size, device).into_data();
        Self { block_size, data }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Top-left `[1, 1, seq_len, seq_len]` corner of the mask.
    pub fn slice<B: Backend>(&self, seq_len: usize, device: &B::Device) -> Tensor<B, 4, Bool> {
        Tensor::<B, 3, Bool>::from_data(self.data.clone(), device)
            .slice([0..1, 0..seq_len, 0..seq_len])
            .unsqueeze_dim(1)
    }
}

/// Configuration to create a [causal self-attention](CausalSelfAttention) layer using the [init function](CausalSelfAttentionConfig::init).
#[derive(Config, Debug)]
pub struct CausalSelfAttentionConfig {
    /// Feature size (same size for input, keys, query, out, etc.)
    pub num_features: usize,
    /// The number of heads.
    pub num_heads: usize,
    /// The longest sequence the mask is built for.
    pub block_size: usize,
    /// Dropout applied to the attention weights.
    #[config(default = 0.1)]
    pub attention_dropout: f64,
    /// Dropout applied after the output projection.
    #[config(default = 0.1)]
    pub residual_dropout: f64,
    /// The type of function used to initialize neural network parameters
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

#[derive(Module, Debug)]
pub struct CausalSelfAttention<B: Backend> {
    /// Linear layer to transform the input features into the query space.
    pub query: Linear<B>,
    /// Linear layer to transform the input features into the key space.
    pub key: Linear<B>,
    /// Linear layer to transform the input features into the value space.
    pub value: Linear<B>,
    /// Linear layer mixing the recombined heads back into the embedding space.
    pub output: Linear<B>,
    attention_dropout: Dropout,
    residual_dropout: Dropout,
    mask: Ignored<CausalMask>,
    /// The number of heads.
    pub num_heads: usize,
    /// The dimension per head.
    pub head_dim: usize,
}

impl CausalSelfAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelResult<CausalSelfAttention<B>> {
        if self.num_heads == 0 || self.num_features % self.num_heads != 0 {
            return Err(ModelError::HeadsDoNotDivideEmbedding {
                embedding_dim: self.num_features,
                num_heads: self.num_heads,
            });
        }
        if self.block_size == 0 {
            return Err(ModelError::InvalidConfig("block_size must be positive".into()));
        }
        let projection =
            || linear(self.num_features, self.num_features, true, &self.initializer, device);

        Ok(CausalSelfAttention {
            query: projection(),
            key: projection(),
            value: projection(),
            output: projection(),
            attention_dropout: DropoutConfig::new(self.attention_dropout).init(),
            residual_dropout: DropoutConfig::new(self.residual_dropout).init(),
            mask: Ignored(CausalMask::new::<B>(self.block_size, device)),
            num_heads: self.num_heads,
            head_dim: self.num_features / self.num_heads,
        })
    }
}

impl<B: Backend> CausalSelfAttention<B> {
    /// Shape `[batch_size, seq_length, num_features]` in and out.
    pub fn forward(&self, input: Tensor<B, 3>) -> ModelResult<Tensor<B, 3>> {
        let [batch_size, seq_length, d_model] = input.dims();
        let block_size = self.mask.0.block_size();
        if seq_length > block_size {
            return Err(ModelError::BlockSizeExceeded { seq_len: seq_length, block_size });
        }

        let query = self.attention_linear(input.clone(), &self.query);
        let key = self.attention_linear(input.clone(), &self.key);
        let value = self.attention_linear(input, &self.value);

        let attn_scores = self.attn_scores(query, key);
        let weights = self.attn_weights(attn_scores);
        let context = weights.matmul(value);
        let context = context.swap_dims(1, 2).reshape([batch_size, seq_length, d_model]);
        Ok(self.residual_dropout.forward(self.output.forward(context)))
    }

    pub fn block_size(&self) -> usize {
        self.mask.0.block_size()
    }

    pub(crate) fn register_params(&self, registry: &mut ParamRegistry) {
        registry.register_linear("query", &self.query);
        registry.register_linear("key", &self.key);
        registry.register_linear("value", &self.value);
        registry.register_linear("output", &self.output);
    }

    fn attn_scores(&self, query: Tensor<B, 4>, key: Tensor<B, 4>) -> Tensor<B, 4> {
        query.matmul(key.transpose()).div_scalar((self.head_dim as f32).sqrt())
    }

    fn attn_weights(&self, attn_scores: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, seq_length, _] = attn_scores.dims();
        let mask = self
            .mask
            .0
            .slice::<B>(seq_length, &attn_scores.device())
            .expand(attn_scores.dims());

        // The diagonal is never masked, so every row keeps a finite entry.
        let attn_scores = attn_scores.mask_fill(mask, f32::NEG_INFINITY);
        self.attention_dropout.forward(softmax(attn_scores, 3))
    }

    fn attention_linear(&self, x: Tensor<B, 3>, linear: &Linear<B>) -> Tensor<B, 4> {
        let [batch_size, seq_length, _d_model] = x.dims();
        linear
            .forward(x)
            .reshape([batch_size, seq_length, self.num_heads, self.head_dim])
            .swap_dims(1, 2)
    }
}
