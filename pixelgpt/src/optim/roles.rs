// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use burn::{
    module::{Param, ParamId},
    nn::{Embedding, LayerNorm, Linear},
    prelude::Backend,
    tensor::Tensor,
};

/// Structural role of a parameter, fixed when the owning module is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamRole {
    Bias,
    /// Weight of a linear projection.
    DecayWeight,
    /// Weight of a normalization or embedding layer, or the positional embedding.
    NoDecayWeight,
}

impl ParamRole {
    pub fn decays(self) -> bool {
        matches!(self, ParamRole::DecayWeight)
    }
}

#[derive(Clone, Debug)]
pub struct ParamEntry {
    pub id: ParamId,
    /// Dotted module path, only used in diagnostics.
    pub path: String,
    pub role: ParamRole,
    pub rank: usize,
    pub num_elements: usize,
}

/// Role tags of every parameter of a model, recorded as the model is built.
#[derive(Clone, Debug, Default)]
pub struct ParamRegistry {
    entries: Vec<ParamEntry>,
    scope: Vec<String>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|entry| entry.num_elements).sum()
    }

    pub fn get(&self, id: ParamId) -> Option<&ParamEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Registers everything `f` records under `name`.
    pub fn scoped(&mut self, name: impl Into<String>, f: impl FnOnce(&mut Self)) {
        self.scope.push(name.into());
        f(self);
        self.scope.pop();
    }

    pub fn register<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        param: &Param<Tensor<B, D>>,
        role: ParamRole,
    ) {
        let path =
            self.scope.iter().map(String::as_str).chain([name]).collect::<Vec<_>>().join(".");
        self.entries.push(ParamEntry {
            id: param.id,
            path,
            role,
            rank: D,
            num_elements: param.val().shape().num_elements(),
        });
    }

    pub fn register_linear<B: Backend>(&mut self, name: &str, linear: &Linear<B>) {
        self.scoped(name, |registry| {
            registry.register("weight", &linear.weight, ParamRole::DecayWeight);
            if let Some(bias) = &linear.bias {
                registry.register("bias", bias, ParamRole::Bias);
            }
        });
    }

    pub fn register_embedding<B: Backend>(&mut self, name: &str, embedding: &Embedding<B>) {
        self.scoped(name, |registry| {
            registry.register("weight", &embedding.weight, ParamRole::NoDecayWeight);
        });
    }

    pub fn register_layer_norm<B: Backend>(&mut self, name: &str, norm: &LayerNorm<B>) {
        self.scoped(name, |registry| {
            registry.register("gamma", &norm.gamma, ParamRole::NoDecayWeight);
            registry.register("beta", &norm.beta, ParamRole::Bias);
        });
    }
}
