use std::sync::Arc;

use batcher::{PixelSequenceBatch, PixelSequenceBatcher};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::Backend,
};
use dataset::PixelSequenceItem;

pub mod batcher;
pub mod dataset;
pub mod image;

pub type PixelLoader<B> = Arc<dyn DataLoader<B, PixelSequenceBatch<B>> + Send + Sync>;

/// Build a [`DataLoader`] over encoded pixel sequences.
///
/// With `shuffle_seed` set, the split is reshuffled every time the loader is
/// iterated. `num_workers` greater than zero encodes batches on that many
/// background threads.
pub fn build_data_loader<B, D>(
    dataset: D,
    batch_size: usize,
    num_workers: usize,
    shuffle_seed: Option<u64>,
) -> PixelLoader<B>
where
    B: Backend,
    D: Dataset<PixelSequenceItem> + 'static,
{
    let mut builder = DataLoaderBuilder::new(PixelSequenceBatcher::new()).batch_size(batch_size);
    if let Some(seed) = shuffle_seed {
        builder = builder.shuffle(seed);
    }
    if num_workers > 0 {
        builder = builder.num_workers(num_workers);
    }
    builder.build(dataset)
}
