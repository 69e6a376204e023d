// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

/// Incremental mean of scalar losses.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunningMean {
    running_mean: Option<f64>,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.running_mean = Some(match self.running_mean {
            Some(mean) => mean + (value - mean) / self.count as f64,
            None => value,
        });
    }

    pub fn value(&self) -> Option<f64> {
        self.running_mean
    }
}
