// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

//! Color palette learned with k-means over sampled pixels.
//!
//! The codebook is built once, offline, and afterwards shared read-only by
//! every sequence encoder and by the sampler when decoding generated tokens.

use std::{fs, path::Path};

use burn::{config::Config, data::dataset::Dataset};
use ndarray::{Array2, ArrayView2};
use rand::{SeedableRng, rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    data::image::RgbImage,
    error::{CodebookError, CodebookResult},
};

pub type Color = [f32; 3];

#[derive(Config, Debug)]
pub struct KMeansConfig {
    /// Number of centroids, which becomes the model vocabulary size.
    pub num_clusters: usize,
    /// Lloyd iterations to run.
    #[config(default = 10)]
    pub iterations: usize,
    /// Seed for the initial centroid draw and every re-seed.
    #[config(default = 42)]
    pub seed: u64,
    /// Repair rounds allowed after the last iteration before dead clusters are an error.
    #[config(default = 16)]
    pub max_repair_rounds: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    centroids: Vec<Color>,
}

impl Codebook {
    pub fn new(centroids: Vec<Color>) -> CodebookResult<Self> {
        if centroids.is_empty() {
            return Err(CodebookError::InvalidConfig("codebook needs at least one color".into()));
        }
        if centroids.iter().flatten().any(|c| !c.is_finite()) {
            return Err(CodebookError::InvalidConfig("codebook colors must be finite".into()));
        }
        Ok(Self { centroids })
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    pub fn centroids(&self) -> &[Color] {
        &self.centroids
    }

    /// Index of the closest centroid; ties resolve to the lowest index.
    pub fn nearest(&self, color: &Color) -> usize {
        nearest_centroid(&self.centroids, color)
    }

    pub fn color(&self, token: usize) -> CodebookResult<Color> {
        self.centroids
            .get(token)
            .copied()
            .ok_or(CodebookError::TokenOutOfRange { token, size: self.centroids.len() })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> CodebookResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CodebookError::Serialization(e.to_string()))?;
        fs::write(path, json).map_err(|e| CodebookError::Serialization(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> CodebookResult<Self> {
        let json =
            fs::read_to_string(path).map_err(|e| CodebookError::Serialization(e.to_string()))?;
        let codebook: Codebook =
            serde_json::from_str(&json).map_err(|e| CodebookError::Serialization(e.to_string()))?;
        Codebook::new(codebook.centroids)
    }
}

fn squared_distance(a: &Color, b: &Color) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn nearest_centroid(centroids: &[Color], color: &Color) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (idx, centroid) in centroids.iter().enumerate() {
        let distance = squared_distance(centroid, color);
        if distance < best_distance {
            best = idx;
            best_distance = distance;
        }
    }
    best
}

fn row(points: &ArrayView2<f32>, idx: usize) -> Color {
    [points[[idx, 0]], points[[idx, 1]], points[[idx, 2]]]
}

/// Assigns every point and returns the per-centroid color sums and counts.
fn assign(points: &ArrayView2<f32>, centroids: &[Color]) -> (Vec<[f64; 3]>, Vec<usize>) {
    let mut sums = vec![[0f64; 3]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];
    for idx in 0..points.nrows() {
        let point = row(points, idx);
        let cluster = nearest_centroid(centroids, &point);
        counts[cluster] += 1;
        for (sum, value) in sums[cluster].iter_mut().zip(point) {
            *sum += value as f64;
        }
    }
    (sums, counts)
}

/// Moves every dead centroid onto a freshly drawn sample point.
fn reseed(points: &ArrayView2<f32>, centroids: &mut [Color], dead: &[usize], rng: &mut StdRng) {
    let draws = index::sample(rng, points.nrows(), dead.len());
    for (&cluster, point_idx) in dead.iter().zip(draws.iter()) {
        centroids[cluster] = row(points, point_idx);
    }
}

fn dead_clusters(counts: &[usize]) -> Vec<usize> {
    counts.iter().enumerate().filter(|(_, count)| **count == 0).map(|(idx, _)| idx).collect()
}

/// Runs Lloyd's k-means over an `N x 3` point set.
///
/// Clusters left without points have no defined mean; they are re-seeded from
/// the sample after every iteration. Once the iteration budget is spent a
/// bounded number of repair rounds makes sure every centroid owns at least one
/// point; if that cannot be reached the cluster count is too large for the
/// number of distinct colors in the sample.
pub fn kmeans(points: ArrayView2<f32>, config: &KMeansConfig) -> CodebookResult<Codebook> {
    let k = config.num_clusters;
    let n = points.nrows();
    if points.ncols() != 3 {
        return Err(CodebookError::InvalidConfig(format!(
            "points must have 3 color channels, got {}",
            points.ncols()
        )));
    }
    if k == 0 {
        return Err(CodebookError::InvalidConfig("num_clusters must be positive".into()));
    }
    if n < k {
        return Err(CodebookError::InsufficientData { points: n, clusters: k });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut centroids: Vec<Color> =
        index::sample(&mut rng, n, k).iter().map(|idx| row(&points, idx)).collect();

    for iteration in 0..config.iterations {
        let (sums, counts) = assign(&points, &centroids);
        for ((centroid, sum), count) in centroids.iter_mut().zip(&sums).zip(&counts) {
            if *count > 0 {
                let count = *count as f64;
                *centroid = sum.map(|channel| (channel / count) as f32);
            }
        }
        let dead = dead_clusters(&counts);
        if !dead.is_empty() {
            reseed(&points, &mut centroids, &dead, &mut rng);
        }
        info!(
            iteration = iteration + 1,
            iterations = config.iterations,
            reinitialized = dead.len(),
            "k-means step"
        );
    }

    for attempt in 0..config.max_repair_rounds {
        let (_, counts) = assign(&points, &centroids);
        let dead = dead_clusters(&counts);
        if dead.is_empty() {
            debug!(repair_rounds = attempt, clusters = k, "no dead clusters after k-means");
            return Codebook::new(centroids);
        }
        warn!(attempt, dead = dead.len(), "re-seeding dead clusters after final iteration");
        reseed(&points, &mut centroids, &dead, &mut rng);
    }

    let (_, counts) = assign(&points, &centroids);
    let dead = dead_clusters(&counts);
    if dead.is_empty() {
        return Codebook::new(centroids);
    }
    Err(CodebookError::DeadClustersPersist { dead: dead.len(), attempts: config.max_repair_rounds })
}

/// Plucks up to `per_image` distinct random pixels from every image into an `N x 3` sample.
pub fn sample_pixels<D: Dataset<RgbImage>>(
    images: &D,
    per_image: usize,
    seed: u64,
) -> CodebookResult<Array2<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(images.len() * per_image * 3);
    for image in (0..images.len()).filter_map(|idx| images.get(idx)) {
        let pixels = image.pixels();
        let take = per_image.min(pixels.len());
        for idx in index::sample(&mut rng, pixels.len(), take).iter() {
            values.extend(pixels[idx].iter().map(|channel| *channel as f32));
        }
    }
    let rows = values.len() / 3;
    Array2::from_shape_vec((rows, 3), values)
        .map_err(|e| CodebookError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_prefers_lowest_index_on_ties() {
        let centroids = [[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        assert_eq!(nearest_centroid(&centroids, &[1.0, 0.0, 0.0]), 0);
        assert_eq!(nearest_centroid(&centroids, &[2.0, 0.0, 0.0]), 1);
    }

    #[test]
    fn codebook_rejects_empty_palette() {
        assert!(Codebook::new(vec![]).is_err());
    }

    #[test]
    fn color_out_of_range() {
        let codebook = Codebook::new(vec![[1.0, 2.0, 3.0]]).unwrap();
        assert_eq!(codebook.color(0).unwrap(), [1.0, 2.0, 3.0]);
        assert_eq!(codebook.color(1), Err(CodebookError::TokenOutOfRange { token: 1, size: 1 }));
    }
}
