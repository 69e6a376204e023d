// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use burn::{
    module::{AutodiffModule, Module, ParamId, list_param_ids},
    optim::{GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use tracing::debug;

use crate::{
    error::{ModelError, ModelResult},
    modules::model::PixelTransformer,
    optim::{
        grads::RankedGrad,
        roles::{ParamEntry, ParamRegistry},
    },
};

#[derive(Clone, Debug)]
pub struct ParamGroup {
    pub weight_decay: f32,
    pub entries: Vec<ParamEntry>,
}

impl ParamGroup {
    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|entry| entry.num_elements).sum()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }
}

/// Disjoint split of a model's parameters into a decayed and a non-decayed group.
#[derive(Clone, Debug)]
pub struct ParamGroups {
    pub decay: ParamGroup,
    pub no_decay: ParamGroup,
}

impl ParamGroups {
    pub fn from_model<B: burn::prelude::Backend>(
        model: &PixelTransformer<B>,
        weight_decay: f32,
    ) -> ModelResult<Self> {
        Self::partition(model, model.param_roles(), weight_decay)
    }

    /// Splits `registry` by role and checks that it covers all of `module`'s
    /// parameters exactly once, by id.
    pub fn partition<B, M>(
        module: &M,
        registry: &ParamRegistry,
        weight_decay: f32,
    ) -> ModelResult<Self>
    where
        B: burn::prelude::Backend,
        M: Module<B>,
    {
        let mut seen = HashSet::new();
        let overlapping: Vec<String> = registry
            .entries()
            .iter()
            .filter(|entry| !seen.insert(entry.id))
            .map(|entry| entry.path.clone())
            .collect();
        if !overlapping.is_empty() {
            return Err(ModelError::OverlappingParamGroups(overlapping));
        }

        if let Some(entry) = registry.entries().iter().find(|e| !(1..=3).contains(&e.rank)) {
            return Err(ModelError::InvalidConfig(format!(
                "parameter {} has unsupported rank {}",
                entry.path, entry.rank
            )));
        }

        let owned: HashSet<ParamId> = list_param_ids::<M, B>(module).into_iter().collect();
        let foreign: Vec<String> = registry
            .entries()
            .iter()
            .filter(|entry| !owned.contains(&entry.id))
            .map(|entry| entry.path.clone())
            .collect();
        if !foreign.is_empty() {
            return Err(ModelError::ForeignParams(foreign));
        }
        // Registered ids are distinct and owned here.
        if seen.len() != owned.len() {
            return Err(ModelError::IncompleteParamGroups {
                missing: owned.len() - seen.len(),
                total: owned.len(),
            });
        }

        let (decay, no_decay): (Vec<_>, Vec<_>) =
            registry.entries().iter().cloned().partition(|entry| entry.role.decays());
        debug!(
            decay_tensors = decay.len(),
            no_decay_tensors = no_decay.len(),
            weight_decay,
            "partitioned parameters"
        );

        Ok(Self {
            decay: ParamGroup { weight_decay, entries: decay },
            no_decay: ParamGroup { weight_decay: 0.0, entries: no_decay },
        })
    }
}

/// Two optimizer instances, one per parameter group, stepped together.
///
/// `decay` must have been built with the decayed group's weight decay and
/// `no_decay` with none.
pub struct GroupedOptimizer<O> {
    groups: ParamGroups,
    decay: O,
    no_decay: O,
}

impl<O> GroupedOptimizer<O> {
    pub fn new(groups: ParamGroups, decay: O, no_decay: O) -> Self {
        Self { groups, decay, no_decay }
    }

    pub fn groups(&self) -> &ParamGroups {
        &self.groups
    }

    /// Applies one update to `module` at learning rate `lr`.
    pub fn step<B, M>(&mut self, lr: f64, module: M, mut grads: GradientsParams) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let decay_grads = split::<B>(&mut grads, &self.groups.decay);
        let no_decay_grads = split::<B>(&mut grads, &self.groups.no_decay);

        let module = self.decay.step(lr, module, decay_grads);
        self.no_decay.step(lr, module, no_decay_grads)
    }
}

fn split<B: AutodiffBackend>(grads: &mut GradientsParams, group: &ParamGroup) -> GradientsParams {
    let mut selected = GradientsParams::new();
    for entry in &group.entries {
        if let Some(grad) = RankedGrad::<B::InnerBackend>::take(grads, entry) {
            grad.put(&mut selected, entry.id);
        }
    }
    selected
}
