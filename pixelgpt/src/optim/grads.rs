// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

//! Gradient bookkeeping that spans every parameter of a model.
//!
//! `GradientsParams` stores tensors by id and rank, so the registry entries of
//! a model are what lets these helpers visit all of them.

use burn::{
    module::ParamId,
    optim::GradientsParams,
    prelude::Backend,
    tensor::{ElementConversion, Tensor},
};

use crate::optim::roles::ParamEntry;

pub(crate) enum RankedGrad<B: Backend> {
    D1(Tensor<B, 1>),
    D2(Tensor<B, 2>),
    D3(Tensor<B, 3>),
}

impl<B: Backend> RankedGrad<B> {
    pub(crate) fn take(grads: &mut GradientsParams, entry: &ParamEntry) -> Option<Self> {
        match entry.rank {
            1 => grads.remove::<B, 1>(entry.id).map(Self::D1),
            2 => grads.remove::<B, 2>(entry.id).map(Self::D2),
            3 => grads.remove::<B, 3>(entry.id).map(Self::D3),
            _ => None,
        }
    }

    pub(crate) fn put(self, grads: &mut GradientsParams, id: ParamId) {
        match self {
            Self::D1(tensor) => grads.register(id, tensor),
            Self::D2(tensor) => grads.register(id, tensor),
            Self::D3(tensor) => grads.register(id, tensor),
        }
    }

    fn squared_norm(&self) -> f64 {
        let sum = match self {
            Self::D1(tensor) => tensor.clone().powi_scalar(2).sum(),
            Self::D2(tensor) => tensor.clone().powi_scalar(2).sum(),
            Self::D3(tensor) => tensor.clone().powi_scalar(2).sum(),
        };
        sum.into_scalar().elem::<f64>()
    }

    fn mul_scalar(self, factor: f64) -> Self {
        match self {
            Self::D1(tensor) => Self::D1(tensor.mul_scalar(factor)),
            Self::D2(tensor) => Self::D2(tensor.mul_scalar(factor)),
            Self::D3(tensor) => Self::D3(tensor.mul_scalar(factor)),
        }
    }

    fn to_device(self, device: &B::Device) -> Self {
        match self {
            Self::D1(tensor) => Self::D1(tensor.to_device(device)),
            Self::D2(tensor) => Self::D2(tensor.to_device(device)),
            Self::D3(tensor) => Self::D3(tensor.to_device(device)),
        }
    }

    fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::D1(a), Self::D1(b)) => Self::D1(a + b),
            (Self::D2(a), Self::D2(b)) => Self::D2(a + b),
            (Self::D3(a), Self::D3(b)) => Self::D3(a + b),
            // Ranks come from the same registry entry, so they always agree.
            (a, _) => a,
        }
    }
}

/// Scales all gradients together so their global L2 norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_global_norm<B: Backend>(
    grads: &mut GradientsParams,
    entries: &[ParamEntry],
    max_norm: f64,
) -> f64 {
    let taken: Vec<_> = entries
        .iter()
        .filter_map(|entry| RankedGrad::<B>::take(grads, entry).map(|grad| (entry.id, grad)))
        .collect();

    let total_norm = taken.iter().map(|(_, grad)| grad.squared_norm()).sum::<f64>().sqrt();
    let clip_coef = max_norm / (total_norm + 1e-6);

    for (id, grad) in taken {
        let grad = if clip_coef < 1.0 { grad.mul_scalar(clip_coef) } else { grad };
        grad.put(grads, id);
    }
    total_norm
}

/// Averages per-replica gradients onto `device`.
///
/// A parameter without a gradient on some replica contributes zero there.
pub fn average_replica_grads<B: Backend>(
    replicas: Vec<GradientsParams>,
    entries: &[ParamEntry],
    device: &B::Device,
) -> GradientsParams {
    let num_replicas = replicas.len();
    let mut replicas = replicas;
    let mut averaged = GradientsParams::new();
    if num_replicas == 0 {
        return averaged;
    }

    for entry in entries {
        let sum = replicas
            .iter_mut()
            .filter_map(|grads| RankedGrad::<B>::take(grads, entry))
            .map(|grad| grad.to_device(device))
            .reduce(RankedGrad::add);
        if let Some(sum) = sum {
            sum.mul_scalar(1.0 / num_replicas as f64).put(&mut averaged, entry.id);
        }
    }
    averaged
}
