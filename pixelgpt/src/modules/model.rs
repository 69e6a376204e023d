use burn::{
    config::Config,
    module::{Ignored, Module, Param},
    nn::{
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, Initializer, LayerNorm,
        LayerNormConfig, Linear, loss::CrossEntropyLossConfig,
    },
    tensor::{Int, Tensor, backend::Backend},
};
use tracing::info;

use crate::{
    error::{ModelError, ModelResult},
    modules::{block::Block, linear},
    optim::roles::{ParamRegistry, ParamRole},
};

#[derive(Config, Debug)]
pub struct PixelTransformerConfig {
    /// Number of codebook colors, i.e. the token vocabulary.
    pub vocab_size: usize,
    /// The longest sequence the model can attend over.
    pub block_size: usize,
    /// The size of the input and output features.
    #[config(default = 768)]
    pub embedding_dim: usize,
    /// The number of transformer layers.
    #[config(default = 12)]
    pub num_layers: usize,
    /// The number of transformer heads.
    #[config(default = 12)]
    pub num_heads: usize,
    /// Dropout applied to the summed token and position embeddings.
    #[config(default = 0.1)]
    pub embedding_dropout: f64,
    /// Dropout applied at the end of each residual branch.
    #[config(default = 0.1)]
    pub residual_dropout: f64,
    /// Dropout applied to attention weights.
    #[config(default = 0.1)]
    pub attention_dropout: f64,
    /// The type of function used to initialize linear and embedding weights
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

/// Output of a forward pass. `loss` is only present when targets were given.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// Shape `[batch_size, seq_length, vocab_size]`
    pub logits: Tensor<B, 3>,
    pub loss: Option<Tensor<B, 1>>,
}

#[derive(Module, Debug)]
pub struct PixelTransformer<B: Backend> {
    token_embedding: Embedding<B>,
    /// Shape `[1, block_size, embedding_dim]`
    position_embedding: Param<Tensor<B, 3>>,
    embedding_dropout: Dropout,
    blocks: Vec<Block<B>>,
    final_norm: LayerNorm<B>,
    head: Linear<B>,
    roles: Ignored<ParamRegistry>,
    block_size: usize,
}

impl PixelTransformerConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.num_heads == 0 || self.embedding_dim % self.num_heads != 0 {
            return Err(ModelError::HeadsDoNotDivideEmbedding {
                embedding_dim: self.embedding_dim,
                num_heads: self.num_heads,
            });
        }
        if self.vocab_size == 0 || self.block_size == 0 {
            return Err(ModelError::InvalidConfig(
                "vocab_size and block_size must be positive".into(),
            ));
        }
        for (name, rate) in [
            ("embedding_dropout", self.embedding_dropout),
            ("residual_dropout", self.residual_dropout),
            ("attention_dropout", self.attention_dropout),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::InvalidConfig(format!("{name} must be in [0, 1)")));
            }
        }
        Ok(())
    }

    /// Initialize a new model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelResult<PixelTransformer<B>> {
        self.validate()?;

        let blocks = (0..self.num_layers)
            .map(|_| Block::new(self, device))
            .collect::<ModelResult<Vec<_>>>()?;

        let mut model = PixelTransformer {
            token_embedding: EmbeddingConfig::new(self.vocab_size, self.embedding_dim)
                .with_initializer(self.initializer.clone())
                .init(device),
            position_embedding: Initializer::Zeros
                .init([1, self.block_size, self.embedding_dim], device),
            embedding_dropout: DropoutConfig::new(self.embedding_dropout).init(),
            blocks,
            final_norm: LayerNormConfig::new(self.embedding_dim).init(device),
            head: linear(self.embedding_dim, self.vocab_size, false, &self.initializer, device),
            roles: Ignored(ParamRegistry::new()),
            block_size: self.block_size,
        };
        model.roles = Ignored(model.collect_roles());

        info!(
            num_params = model.num_params(),
            num_layers = self.num_layers,
            block_size = self.block_size,
            "initialized pixel transformer"
        );
        Ok(model)
    }
}

impl<B: Backend> PixelTransformer<B> {
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn vocab_size(&self) -> usize {
        self.head.weight.val().dims()[1]
    }

    /// Role tags recorded for every parameter when the model was built.
    pub fn param_roles(&self) -> &ParamRegistry {
        &self.roles.0
    }

    fn collect_roles(&self) -> ParamRegistry {
        let mut registry = ParamRegistry::new();
        registry.register_embedding("token_embedding", &self.token_embedding);
        let role = ParamRole::NoDecayWeight;
        registry.register("position_embedding", &self.position_embedding, role);
        for (idx, block) in self.blocks.iter().enumerate() {
            registry.scoped(format!("blocks.{idx}"), |r| block.register_params(r));
        }
        registry.register_layer_norm("final_norm", &self.final_norm);
        registry.register_linear("head", &self.head);
        registry
    }

    /// Runs the model over `[batch_size, seq_length]` tokens.
    ///
    /// With `targets` of the same shape, the mean token cross-entropy is returned
    /// alongside the logits.
    pub fn forward(
        &self,
        inputs: Tensor<B, 2, Int>,
        targets: Option<Tensor<B, 2, Int>>,
    ) -> ModelResult<ModelOutput<B>> {
        let [batch_size, seq_length] = inputs.dims();
        if seq_length > self.block_size {
            return Err(ModelError::BlockSizeExceeded {
                seq_len: seq_length,
                block_size: self.block_size,
            });
        }

        let tokens = self.token_embedding.forward(inputs);
        let [_, _, embedding_dim] = tokens.dims();
        let positions =
            self.position_embedding.val().slice([0..1, 0..seq_length, 0..embedding_dim]);
        let mut x = self.embedding_dropout.forward(tokens + positions);
        for block in self.blocks.iter() {
            x = block.forward(x)?;
        }
        let logits = self.head.forward(self.final_norm.forward(x));

        let loss = match targets {
            Some(targets) => {
                if targets.dims() != [batch_size, seq_length] {
                    return Err(ModelError::InvalidConfig(format!(
                        "targets shape {:?} does not match inputs shape {:?}",
                        targets.dims(),
                        [batch_size, seq_length]
                    )));
                }
                let vocab_size = logits.dims()[2];
                let logits_flat = logits.clone().reshape([batch_size * seq_length, vocab_size]);
                let targets_flat = targets.reshape([batch_size * seq_length]);
                let cross_entropy = CrossEntropyLossConfig::new().init(&logits.device());
                Some(cross_entropy.forward(logits_flat, targets_flat))
            }
            None => None,
        };

        Ok(ModelOutput { logits, loss })
    }
}
