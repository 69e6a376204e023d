// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use burn::{
    nn::{Initializer, Linear, LinearConfig},
    prelude::Backend,
};

pub mod attention;
pub mod block;
pub mod model;
pub mod pwff;

/// Linear layer with weights drawn from `initializer` and a zeroed bias.
pub(crate) fn linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    bias: bool,
    initializer: &Initializer,
    device: &B::Device,
) -> Linear<B> {
    let mut linear = LinearConfig::new(d_input, d_output)
        .with_bias(bias)
        .with_initializer(initializer.clone())
        .init(device);
    if linear.bias.is_some() {
        linear.bias = Some(Initializer::Zeros.init([d_output], device));
    }
    linear
}
