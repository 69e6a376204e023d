// Copyright (c) Soma Contributors
// SPDX-License-Identifier: Apache-2.0

use burn::{
    module::Module,
    optim::GradientsParams,
    prelude::Backend,
    tensor::{ElementConversion, backend::AutodiffBackend},
};

use crate::{
    data::batcher::PixelSequenceBatch,
    error::{ModelError, TrainingError, TrainingResult},
    modules::model::PixelTransformer,
    optim::grads::average_replica_grads,
    running_mean::RunningMean,
};

/// Devices a training step runs on. The first device holds the primary copy of
/// the model and receives the averaged gradients.
#[derive(Clone, Debug)]
pub struct ExecutionContext<B: Backend> {
    // Never empty.
    devices: Vec<B::Device>,
}

/// Loss and gradients of one step, already averaged over replicas.
pub struct ReplicaStep {
    pub loss: f64,
    pub grads: GradientsParams,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn single(device: B::Device) -> Self {
        Self { devices: vec![device] }
    }

    pub fn replicated(devices: Vec<B::Device>) -> TrainingResult<Self> {
        if devices.is_empty() {
            return Err(TrainingError::InvalidConfig(
                "execution context needs at least one device".into(),
            ));
        }
        Ok(Self { devices })
    }

    pub fn primary(&self) -> &B::Device {
        &self.devices[0]
    }

    pub fn replica_count(&self) -> usize {
        self.devices.len()
    }

    /// Splits `batch` along the batch dimension, one shard per device.
    ///
    /// Batches smaller than the replica count use fewer replicas.
    pub fn shard(&self, batch: PixelSequenceBatch<B>) -> Vec<(B::Device, PixelSequenceBatch<B>)> {
        let [batch_size, _] = batch.inputs.dims();
        let replicas = self.devices.len().min(batch_size).max(1);
        if replicas == 1 {
            let device = self.primary().clone();
            let batch = PixelSequenceBatch {
                inputs: batch.inputs.to_device(&device),
                targets: batch.targets.to_device(&device),
            };
            return vec![(device, batch)];
        }

        let inputs = batch.inputs.chunk(replicas, 0);
        let targets = batch.targets.chunk(replicas, 0);
        self.devices
            .iter()
            .zip(inputs.into_iter().zip(targets))
            .map(|(device, (inputs, targets))| {
                let shard = PixelSequenceBatch {
                    inputs: inputs.to_device(device),
                    targets: targets.to_device(device),
                };
                (device.clone(), shard)
            })
            .collect()
    }
}

impl<B: AutodiffBackend> ExecutionContext<B> {
    /// Runs forward and backward for one batch on every replica.
    ///
    /// `model` must live on the primary device.
    pub fn forward_backward(
        &self,
        model: &PixelTransformer<B>,
        batch: PixelSequenceBatch<B>,
    ) -> TrainingResult<ReplicaStep> {
        let mut losses = RunningMean::new();
        let mut replica_grads = Vec::with_capacity(self.devices.len());

        for (idx, (device, shard)) in self.shard(batch).into_iter().enumerate() {
            let replica = if idx == 0 { model.clone() } else { model.clone().fork(&device) };
            let output = replica.forward(shard.inputs, Some(shard.targets))?;
            let loss = output
                .loss
                .ok_or_else(|| ModelError::InvalidConfig("forward pass returned no loss".into()))?;
            losses.add(loss.clone().into_scalar().elem::<f64>());
            replica_grads.push(GradientsParams::from_grads(loss.backward(), &replica));
        }

        let grads = if replica_grads.len() == 1 {
            replica_grads.pop().unwrap_or_else(GradientsParams::new)
        } else {
            average_replica_grads::<B::InnerBackend>(
                replica_grads,
                model.param_roles().entries(),
                self.primary(),
            )
        };
        let loss = losses.value().unwrap_or(f64::NAN);
        Ok(ReplicaStep { loss, grads })
    }
}
