use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Gelu, Initializer, Linear},
    tensor::{Tensor, backend::Backend},
};

use crate::{modules::linear, optim::roles::ParamRegistry};

#[derive(Config, Debug)]
pub struct FeedForwardConfig {
    /// The size of the input and output features.
    pub embedding_dim: usize,
    /// The size of the hidden inner features.
    pub hidden_dim: usize,
    /// The probability that dropout occurs
    #[config(default = 0.1)]
    pub dropout_rate: f64,
    /// The type of function used to initialize neural network parameters
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

/// Expand, GELU, project back, dropout. Always exactly these four steps.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub expand: Linear<B>,
    pub gelu: Gelu,
    pub project: Linear<B>,
    pub dropout: Dropout,
}

impl FeedForwardConfig {
    /// Initialize a new [feed-forward](FeedForward) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        FeedForward {
            expand: linear(self.embedding_dim, self.hidden_dim, true, &self.initializer, device),
            gelu: Gelu::new(),
            project: linear(self.hidden_dim, self.embedding_dim, true, &self.initializer, device),
            dropout: DropoutConfig::new(self.dropout_rate).init(),
        }
    }
}

impl<B: Backend> FeedForward<B> {
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.expand.forward(input);
        let x = self.gelu.forward(x);
        let x = self.project.forward(x);
        self.dropout.forward(x)
    }

    pub(crate) fn register_params(&self, registry: &mut ParamRegistry) {
        registry.register_linear("expand", &self.expand);
        registry.register_linear("project", &self.project);
    }
}
