// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use burn::{
    config::Config,
    prelude::Backend,
    tensor::{Int, Tensor, TensorData, activation::softmax},
};
use rand::{SeedableRng, distributions::WeightedIndex, prelude::Distribution, rngs::StdRng};

use crate::{
    error::{ModelError, ModelResult},
    modules::model::PixelTransformer,
};

#[derive(Config, Debug)]
pub struct SamplingConfig {
    /// Number of tokens to append.
    pub steps: usize,
    /// Divides the logits before the softmax.
    #[config(default = 1.0)]
    pub temperature: f64,
    /// Draw from the distribution instead of taking the most likely token.
    #[config(default = false)]
    pub sample: bool,
    /// Keep only the `k` highest logits before the softmax.
    pub top_k: Option<usize>,
    #[config(default = 42)]
    pub seed: u64,
}

impl SamplingConfig {
    pub fn validate(&self, vocab_size: usize) -> ModelResult<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(ModelError::InvalidSampling(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if let Some(k) = self.top_k {
            if k == 0 || k > vocab_size {
                return Err(ModelError::InvalidSampling(format!(
                    "top_k must be in 1..={vocab_size}, got {k}"
                )));
            }
        }
        Ok(())
    }
}

/// Extends `context` (`[batch_size, seq_length]`) by `config.steps` tokens, one
/// at a time, conditioning on at most the last `block_size` tokens.
///
/// Pass a model on a non-autodiff backend, e.g. from `model.valid()`, so no
/// graph is recorded and dropout stays off.
pub fn sample<B: Backend>(
    model: &PixelTransformer<B>,
    context: Tensor<B, 2, Int>,
    config: &SamplingConfig,
) -> ModelResult<Tensor<B, 2, Int>> {
    config.validate(model.vocab_size())?;
    let [_, context_len] = context.dims();
    if context_len == 0 {
        return Err(ModelError::InvalidSampling("context must hold at least one token".into()));
    }

    let block_size = model.block_size();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut tokens = context;
    for _ in 0..config.steps {
        let [batch_size, seq_len] = tokens.dims();
        let window = if seq_len > block_size {
            tokens.clone().slice([0..batch_size, seq_len - block_size..seq_len])
        } else {
            tokens.clone()
        };

        let logits = model.forward(window, None)?.logits;
        let [_, window_len, vocab_size] = logits.dims();
        let logits = logits
            .slice([0..batch_size, window_len - 1..window_len, 0..vocab_size])
            .reshape([batch_size, vocab_size])
            .div_scalar(config.temperature);
        let logits = match config.top_k {
            Some(k) => top_k_logits(logits, k),
            None => logits,
        };
        let probs = softmax(logits, 1);

        let next = if config.sample { draw(probs, &mut rng)? } else { probs.argmax(1) };
        tokens = Tensor::cat(vec![tokens, next], 1);
    }
    Ok(tokens)
}

/// Sets every logit below the `k`-th largest of its row to negative infinity.
fn top_k_logits<B: Backend>(logits: Tensor<B, 2>, k: usize) -> Tensor<B, 2> {
    let [batch_size, vocab_size] = logits.dims();
    let threshold = logits.clone().topk(k, 1).slice([0..batch_size, k - 1..k]);
    let mask = logits.clone().lower(threshold.expand([batch_size, vocab_size]));
    logits.mask_fill(mask, f32::NEG_INFINITY)
}

/// Draws one token per row of `probs` (`[batch_size, vocab_size]`).
fn draw<B: Backend>(probs: Tensor<B, 2>, rng: &mut StdRng) -> ModelResult<Tensor<B, 2, Int>> {
    let [batch_size, vocab_size] = probs.dims();
    let device = probs.device();
    let values = probs
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| ModelError::TensorData(format!("{err:?}")))?;

    let tokens = values
        .chunks(vocab_size)
        .map(|row| {
            WeightedIndex::new(row)
                .map(|dist| dist.sample(rng) as i64)
                .map_err(|err| ModelError::InvalidSampling(err.to_string()))
        })
        .collect::<ModelResult<Vec<_>>>()?;
    Ok(Tensor::from_data(TensorData::new(tokens, [batch_size, 1]), &device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn top_k_keeps_the_largest_logits() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[1.0, 4.0, 3.0, 2.0]], &device);
        let kept = top_k_logits(logits, 2).into_data().to_vec::<f32>().unwrap();
        assert_eq!(kept[1], 4.0);
        assert_eq!(kept[2], 3.0);
        assert!(kept[0].is_infinite() && kept[3].is_infinite());
    }

    #[test]
    fn draw_respects_zero_probabilities() {
        let device = Default::default();
        let probs = Tensor::<B, 2>::from_floats([[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], &device);
        let mut rng = StdRng::seed_from_u64(0);
        let tokens = draw(probs, &mut rng).unwrap();
        let tokens = tokens.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(tokens, vec![1, 2]);
    }

    #[test]
    fn rejects_bad_temperature_and_top_k() {
        assert!(SamplingConfig::new(1).with_temperature(0.0).validate(4).is_err());
        assert!(SamplingConfig::new(1).with_top_k(Some(0)).validate(4).is_err());
        assert!(SamplingConfig::new(1).with_top_k(Some(5)).validate(4).is_err());
        assert!(SamplingConfig::new(1).with_top_k(Some(4)).validate(4).is_ok());
    }
}
