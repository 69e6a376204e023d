// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use burn::data::dataset::Dataset;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    codebook::{Codebook, Color},
    data::image::RgbImage,
    error::{CodebookError, CodebookResult},
};

/// Fixed reordering of pixel positions shared by every image of a dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPermutation {
    order: Vec<usize>,
}

impl PixelPermutation {
    pub fn identity(num_pixels: usize) -> Self {
        Self { order: (0..num_pixels).collect() }
    }

    pub fn random(num_pixels: usize, seed: u64) -> Self {
        let mut order: Vec<usize> = (0..num_pixels).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        Self { order }
    }

    pub fn from_order(order: Vec<usize>) -> CodebookResult<Self> {
        let mut seen = vec![false; order.len()];
        for &position in &order {
            match seen.get_mut(position) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(CodebookError::InvalidConfig(format!(
                        "position {position} is repeated or out of range in a permutation of {}",
                        order.len()
                    )));
                }
            }
        }
        Ok(Self { order })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position in raster order of the pixel placed at `idx` in the sequence.
    pub fn source(&self, idx: usize) -> usize {
        self.order[idx]
    }

    pub fn inverse(&self) -> Self {
        let mut order = vec![0; self.order.len()];
        for (idx, &position) in self.order.iter().enumerate() {
            order[position] = idx;
        }
        Self { order }
    }
}

/// One next-token training example: `targets[i] == inputs[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelSequenceItem {
    pub inputs: Vec<u32>,
    pub targets: Vec<u32>,
}

/// Quantizes images into codebook token sequences.
#[derive(Clone, Debug)]
pub struct SequenceEncoder {
    codebook: Arc<Codebook>,
    permutation: Arc<PixelPermutation>,
}

impl SequenceEncoder {
    pub fn new(codebook: Arc<Codebook>, permutation: Arc<PixelPermutation>) -> Self {
        Self { codebook, permutation }
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    pub fn permutation(&self) -> &PixelPermutation {
        &self.permutation
    }

    /// Sequence length seen by the model, one less than the pixel count.
    pub fn block_size(&self) -> usize {
        self.permutation.len().saturating_sub(1)
    }

    /// Checks that `image` can be turned into a training item.
    pub fn check(&self, image: &RgbImage) -> CodebookResult<()> {
        if image.num_pixels() != self.permutation.len() {
            return Err(CodebookError::PixelCountMismatch {
                expected: self.permutation.len(),
                actual: image.num_pixels(),
            });
        }
        Ok(())
    }

    /// Tokens of every pixel, in permuted order.
    pub fn encode(&self, image: &RgbImage) -> CodebookResult<Vec<u32>> {
        self.check(image)?;
        let pixels = image.pixels();
        let tokens = (0..self.permutation.len())
            .map(|idx| {
                let pixel = pixels[self.permutation.source(idx)];
                let color: Color = pixel.map(f32::from);
                self.codebook.nearest(&color) as u32
            })
            .collect();
        Ok(tokens)
    }

    pub fn encode_item(&self, image: &RgbImage) -> CodebookResult<PixelSequenceItem> {
        let tokens = self.encode(image)?;
        if tokens.len() < 2 {
            return Err(CodebookError::InvalidConfig(
                "images need at least two pixels to form a next-token pair".into(),
            ));
        }
        let inputs = tokens[..tokens.len() - 1].to_vec();
        let targets = tokens[1..].to_vec();
        Ok(PixelSequenceItem { inputs, targets })
    }

    /// Maps a full-length token sequence back to colors in raster order.
    pub fn decode(
        &self,
        tokens: &[usize],
        width: usize,
        height: usize,
    ) -> CodebookResult<RgbImage> {
        if tokens.len() != self.permutation.len() || width * height != tokens.len() {
            return Err(CodebookError::PixelCountMismatch {
                expected: self.permutation.len(),
                actual: tokens.len(),
            });
        }
        let inverse = self.permutation.inverse();
        let pixels = (0..tokens.len())
            .map(|position| {
                let color = self.codebook.color(tokens[inverse.source(position)])?;
                Ok(color.map(|channel| channel.round().clamp(0.0, 255.0) as u8))
            })
            .collect::<CodebookResult<Vec<_>>>()?;
        RgbImage::from_pixels(width, height, pixels)
    }
}

/// Lazily encodes the images of an underlying image dataset.
///
/// Every image is checked when the dataset is built, so `get` only fails if
/// the underlying dataset changes afterwards.
pub struct PixelSequenceDataset<D> {
    images: D,
    encoder: SequenceEncoder,
}

impl<D: Dataset<RgbImage>> PixelSequenceDataset<D> {
    pub fn new(images: D, encoder: SequenceEncoder) -> CodebookResult<Self> {
        if encoder.block_size() == 0 {
            return Err(CodebookError::InvalidConfig(
                "images need at least two pixels to form a next-token pair".into(),
            ));
        }
        for index in 0..images.len() {
            let image = images.get(index).ok_or_else(|| CodebookError::InvalidImage {
                index,
                reason: "missing from the image dataset".into(),
            })?;
            encoder
                .check(&image)
                .map_err(|e| CodebookError::InvalidImage { index, reason: e.to_string() })?;
        }
        Ok(Self { images, encoder })
    }

    pub fn encoder(&self) -> &SequenceEncoder {
        &self.encoder
    }

    /// Target tokens seen per pass over the dataset, used to size the warmup.
    pub fn tokens_per_epoch(&self) -> u64 {
        (self.images.len() * self.encoder.block_size()) as u64
    }
}

impl<D: Dataset<RgbImage>> Dataset<PixelSequenceItem> for PixelSequenceDataset<D> {
    fn get(&self, index: usize) -> Option<PixelSequenceItem> {
        let image = self.images.get(index)?;
        match self.encoder.encode_item(&image) {
            Ok(item) => Some(item),
            Err(e) => {
                // Ends the loader's pass early; the trainer reports the short epoch.
                error!(index, error = %e, "failed to encode image");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}
