use burn::{
    Tensor,
    data::dataloader::batcher::Batcher,
    prelude::Backend,
    tensor::{Int, TensorData},
};

use crate::data::dataset::PixelSequenceItem;

#[derive(Clone, Default)]
pub struct PixelSequenceBatcher {}

impl PixelSequenceBatcher {
    pub fn new() -> Self {
        Self {}
    }
}

#[derive(Clone, Debug)]
pub struct PixelSequenceBatch<B: Backend> {
    /// Shape `[batch_size, block_size]`
    pub inputs: Tensor<B, 2, Int>,
    /// Shape `[batch_size, block_size]`, shifted one position left of `inputs`.
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> PixelSequenceBatch<B> {
    pub fn num_targets(&self) -> usize {
        let [batch_size, seq_len] = self.targets.dims();
        batch_size * seq_len
    }
}

fn stack_tokens<B: Backend>(rows: Vec<&[u32]>, device: &B::Device) -> Tensor<B, 2, Int> {
    let seq_len = rows.first().map_or(0, |row| row.len());
    let batch_size = rows.len();
    let values: Vec<i64> = rows.into_iter().flatten().map(|&token| token as i64).collect();
    Tensor::from_data(TensorData::new(values, [batch_size, seq_len]), device)
}

impl<B: Backend> Batcher<B, PixelSequenceItem, PixelSequenceBatch<B>> for PixelSequenceBatcher {
    fn batch(&self, items: Vec<PixelSequenceItem>, device: &B::Device) -> PixelSequenceBatch<B> {
        let inputs =
            stack_tokens(items.iter().map(|item| item.inputs.as_slice()).collect(), device);
        let targets =
            stack_tokens(items.iter().map(|item| item.targets.as_slice()).collect(), device);

        PixelSequenceBatch { inputs, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Device};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_shapes_and_values() {
        let items = vec![
            PixelSequenceItem { inputs: vec![0, 1, 2], targets: vec![1, 2, 3] },
            PixelSequenceItem { inputs: vec![4, 5, 6], targets: vec![5, 6, 7] },
        ];
        let device: Device<TestBackend> = Default::default();
        let batch: PixelSequenceBatch<TestBackend> =
            PixelSequenceBatcher::new().batch(items, &device);

        assert_eq!(batch.inputs.dims(), [2, 3], "inputs should be [batch=2, block_size=3]");
        assert_eq!(batch.targets.dims(), [2, 3], "targets should be [batch=2, block_size=3]");
        assert_eq!(batch.num_targets(), 6);

        let inputs: Vec<i64> = batch.inputs.to_data().convert::<i64>().to_vec().unwrap();
        let targets: Vec<i64> = batch.targets.to_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(inputs, vec![0, 1, 2, 4, 5, 6]);
        assert_eq!(targets, vec![1, 2, 3, 5, 6, 7]);
    }
}
