// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{CodebookError, CodebookResult};

/// A raw `height x width x 3` image stored in raster order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbImage {
    width: usize,
    height: usize,
    pixels: Vec<[u8; 3]>,
}

impl RgbImage {
    pub fn from_pixels(width: usize, height: usize, pixels: Vec<[u8; 3]>) -> CodebookResult<Self> {
        if pixels.len() != width * height {
            return Err(CodebookError::PixelCountMismatch {
                expected: width * height,
                actual: pixels.len(),
            });
        }
        Ok(Self { width, height, pixels })
    }

    /// Builds an image from interleaved `RGBRGB...` bytes.
    pub fn from_raw(width: usize, height: usize, bytes: &[u8]) -> CodebookResult<Self> {
        if bytes.len() != width * height * 3 {
            return Err(CodebookError::PixelCountMismatch {
                expected: width * height,
                actual: bytes.len() / 3,
            });
        }
        let pixels = bytes.chunks_exact(3).map(|p| [p[0], p[1], p[2]]).collect();
        Self::from_pixels(width, height, pixels)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn num_pixels(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels(&self) -> &[[u8; 3]] {
        &self.pixels
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.pixels.into_iter().flatten().collect()
    }
}
