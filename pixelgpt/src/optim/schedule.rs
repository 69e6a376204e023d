// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Floor of the cosine decay, as a fraction of the base rate.
const MIN_LR_FRACTION: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// The base rate at every step.
    Fixed,
    /// Linear warmup over `warmup_tokens`, then cosine decay to 10% of the base
    /// rate at `final_tokens`.
    WarmupCosine,
}

/// Token-driven learning rate schedule.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    schedule: LrSchedule,
    base_lr: f64,
    warmup_tokens: u64,
    final_tokens: u64,
    tokens: u64,
}

impl LrScheduler {
    pub fn new(schedule: LrSchedule, base_lr: f64, warmup_tokens: u64, final_tokens: u64) -> Self {
        Self { schedule, base_lr, warmup_tokens, final_tokens, tokens: 0 }
    }

    /// Target tokens counted so far. Only advances under [`LrSchedule::WarmupCosine`].
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Counts `target_tokens` more tokens and returns the rate for the next update.
    pub fn step(&mut self, target_tokens: usize) -> f64 {
        if self.schedule == LrSchedule::WarmupCosine {
            self.tokens = self.tokens.saturating_add(target_tokens as u64);
        }
        self.learning_rate_at(self.tokens)
    }

    pub fn learning_rate_at(&self, tokens: u64) -> f64 {
        match self.schedule {
            LrSchedule::Fixed => self.base_lr,
            LrSchedule::WarmupCosine => self.base_lr * self.multiplier(tokens),
        }
    }

    fn multiplier(&self, tokens: u64) -> f64 {
        if tokens < self.warmup_tokens {
            return tokens as f64 / self.warmup_tokens.max(1) as f64;
        }
        let span = self.final_tokens.saturating_sub(self.warmup_tokens).max(1);
        let progress = (tokens - self.warmup_tokens) as f64 / span as f64;
        let cosine = 0.5 * (1.0 + (PI * progress).cos());
        cosine.max(MIN_LR_FRACTION)
    }
}
