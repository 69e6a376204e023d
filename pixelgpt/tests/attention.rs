#![allow(clippy::unwrap_used, clippy::expect_used)]

use burn::backend::NdArray;
use burn::tensor::ops::FloatElem;
use burn::tensor::{Tensor, TensorData, Tolerance};
use pixelgpt::{error::ModelError, modules::attention::CausalSelfAttentionConfig};

type TestBackend = NdArray<f32>;
type FT = FloatElem<TestBackend>;

const SEQ_LEN: usize = 5;
const FEATURES: usize = 8;

fn input(last_position_value: f32) -> Tensor<TestBackend, 3> {
    let values: Vec<f32> = (0..SEQ_LEN * FEATURES)
        .map(|i| {
            if i / FEATURES == SEQ_LEN - 1 {
                last_position_value
            } else {
                ((i * 7 % 11) as f32 - 5.0) / 5.0
            }
        })
        .collect();
    Tensor::from_data(TensorData::new(values, [1, SEQ_LEN, FEATURES]), &Default::default())
}

#[test]
fn future_positions_do_not_leak_into_the_past() {
    let device = Default::default();
    let attention = CausalSelfAttentionConfig::new(FEATURES, 2, 8)
        .with_attention_dropout(0.0)
        .with_residual_dropout(0.0)
        .init::<TestBackend>(&device)
        .unwrap();

    let baseline = attention.forward(input(0.5)).unwrap();
    let perturbed = attention.forward(input(-3.0)).unwrap();
    assert_eq!(baseline.dims(), [1, SEQ_LEN, FEATURES]);

    let prefix = |t: Tensor<TestBackend, 3>| t.slice([0..1, 0..SEQ_LEN - 1, 0..FEATURES]);
    prefix(perturbed.clone())
        .to_data()
        .assert_approx_eq::<FT>(&prefix(baseline.clone()).to_data(), Tolerance::default());

    let last = |t: Tensor<TestBackend, 3>| t.slice([0..1, SEQ_LEN - 1..SEQ_LEN, 0..FEATURES]);
    let difference = (last(perturbed) - last(baseline)).abs().sum().into_scalar();
    assert!(difference > 1e-4);
}

#[test]
fn first_position_attends_only_to_itself() {
    let device = Default::default();
    let attention = CausalSelfAttentionConfig::new(FEATURES, 4, SEQ_LEN)
        .with_attention_dropout(0.0)
        .with_residual_dropout(0.0)
        .init::<TestBackend>(&device)
        .unwrap();

    let full = attention.forward(input(0.5)).unwrap();
    let single = attention.forward(input(0.5).slice([0..1, 0..1, 0..FEATURES])).unwrap();

    full.slice([0..1, 0..1, 0..FEATURES])
        .to_data()
        .assert_approx_eq::<FT>(&single.to_data(), Tolerance::default());
}

#[test]
fn sequences_longer_than_block_size_are_rejected() {
    let device = Default::default();
    let attention =
        CausalSelfAttentionConfig::new(FEATURES, 2, 4).init::<TestBackend>(&device).unwrap();
    assert_eq!(
        attention.forward(input(0.0)).unwrap_err(),
        ModelError::BlockSizeExceeded { seq_len: SEQ_LEN, block_size: 4 }
    );
}

#[test]
fn heads_must_divide_features() {
    let device = Default::default();
    let result = CausalSelfAttentionConfig::new(FEATURES, 3, 4).init::<TestBackend>(&device);
    assert_eq!(
        result.unwrap_err(),
        ModelError::HeadsDoNotDivideEmbedding { embedding_dim: FEATURES, num_heads: 3 }
    );
}
