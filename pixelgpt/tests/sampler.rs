#![allow(clippy::unwrap_used, clippy::expect_used)]

use burn::backend::NdArray;
use burn::tensor::{Int, Tensor, TensorData};
use pixelgpt::{
    error::ModelError,
    modules::model::{PixelTransformer, PixelTransformerConfig},
    sample::{SamplingConfig, sample},
};

type TestBackend = NdArray<f32>;

const VOCAB: usize = 6;
const BLOCK_SIZE: usize = 4;

fn model() -> PixelTransformer<TestBackend> {
    PixelTransformerConfig::new(VOCAB, BLOCK_SIZE)
        .with_embedding_dim(12)
        .with_num_layers(1)
        .with_num_heads(3)
        .init(&Default::default())
        .unwrap()
}

fn context(rows: &[&[i64]]) -> Tensor<TestBackend, 2, Int> {
    let width = rows[0].len();
    let values: Vec<i64> = rows.iter().flat_map(|row| row.iter().copied()).collect();
    Tensor::from_data(TensorData::new(values, [rows.len(), width]), &Default::default())
}

fn to_rows(tokens: Tensor<TestBackend, 2, Int>) -> Vec<Vec<i64>> {
    let [_, width] = tokens.dims();
    let values = tokens.into_data().convert::<i64>().to_vec::<i64>().unwrap();
    values.chunks(width).map(|row| row.to_vec()).collect()
}

#[test]
fn greedy_sampling_is_deterministic_and_keeps_the_prefix() {
    let model = model();
    let config = SamplingConfig::new(5);
    let first = to_rows(sample(&model, context(&[&[1, 2], &[3, 0]]), &config).unwrap());
    let second = to_rows(sample(&model, context(&[&[1, 2], &[3, 0]]), &config).unwrap());

    assert_eq!(first, second);
    assert_eq!(first[0].len(), 7);
    assert_eq!(&first[0][..2], &[1, 2]);
    assert_eq!(&first[1][..2], &[3, 0]);
    assert!(first.iter().flatten().all(|token| (0..VOCAB as i64).contains(token)));
}

#[test]
fn context_longer_than_block_size_is_cropped() {
    let model = model();
    let long = context(&[&[0, 1, 2, 3, 4, 5, 0]]);
    let tokens = to_rows(sample(&model, long, &SamplingConfig::new(3)).unwrap());
    assert_eq!(tokens[0].len(), 10);
}

#[test]
fn top_one_sampling_matches_greedy() {
    let model = model();
    let greedy = to_rows(sample(&model, context(&[&[4]]), &SamplingConfig::new(6)).unwrap());
    let sampled = to_rows(
        sample(
            &model,
            context(&[&[4]]),
            &SamplingConfig::new(6).with_sample(true).with_top_k(Some(1)).with_seed(9),
        )
        .unwrap(),
    );
    assert_eq!(greedy, sampled);
}

#[test]
fn seeded_sampling_is_reproducible() {
    let model = model();
    let config = SamplingConfig::new(6).with_sample(true).with_temperature(1.5).with_seed(3);
    let first = to_rows(sample(&model, context(&[&[2, 2]]), &config).unwrap());
    let second = to_rows(sample(&model, context(&[&[2, 2]]), &config).unwrap());
    assert_eq!(first, second);
}

#[test]
fn invalid_settings_are_rejected() {
    let model = model();
    let result = sample(&model, context(&[&[1]]), &SamplingConfig::new(1).with_temperature(0.0));
    assert!(matches!(result, Err(ModelError::InvalidSampling(_))));

    let result =
        sample(&model, context(&[&[1]]), &SamplingConfig::new(1).with_top_k(Some(VOCAB + 1)));
    assert!(matches!(result, Err(ModelError::InvalidSampling(_))));
}
