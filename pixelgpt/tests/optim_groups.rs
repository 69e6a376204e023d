#![allow(clippy::unwrap_used, clippy::expect_used)]

use burn::backend::NdArray;
use burn::module::Module;
use burn::nn::LinearConfig;
use pixelgpt::{
    error::ModelError,
    modules::model::{PixelTransformer, PixelTransformerConfig},
    optim::{
        groups::ParamGroups,
        roles::{ParamRegistry, ParamRole},
    },
};

type TestBackend = NdArray<f32>;

fn model() -> PixelTransformer<TestBackend> {
    PixelTransformerConfig::new(8, 6)
        .with_embedding_dim(16)
        .with_num_layers(2)
        .with_num_heads(2)
        .init(&Default::default())
        .unwrap()
}

#[test]
fn groups_partition_every_parameter() {
    let model = model();
    let groups = ParamGroups::from_model(&model, 0.1).unwrap();

    assert_eq!(groups.decay.num_elements() + groups.no_decay.num_elements(), model.num_params());
    assert_eq!(groups.decay.weight_decay, 0.1);
    assert_eq!(groups.no_decay.weight_decay, 0.0);
    for entry in &groups.decay.entries {
        assert!(!groups.no_decay.entries.iter().any(|other| other.id == entry.id));
    }
}

#[test]
fn only_linear_weights_decay() {
    let groups = ParamGroups::from_model(&model(), 0.1).unwrap();

    for path in [
        "blocks.0.attention.query.weight",
        "blocks.1.attention.output.weight",
        "blocks.1.pwff.expand.weight",
        "head.weight",
    ] {
        assert!(groups.decay.contains(path), "{path} should decay");
    }
    for path in [
        "token_embedding.weight",
        "position_embedding",
        "blocks.0.norm_1.gamma",
        "blocks.0.norm_1.beta",
        "blocks.0.attention.key.bias",
        "blocks.1.pwff.project.bias",
        "final_norm.gamma",
    ] {
        assert!(groups.no_decay.contains(path), "{path} should not decay");
    }
    assert_eq!(groups.decay.entries.len(), 2 * 6 + 1);
}

#[test]
fn duplicated_parameters_are_rejected() {
    let linear = LinearConfig::new(4, 4).init::<TestBackend>(&Default::default());
    let mut registry = ParamRegistry::new();
    registry.register_linear("first", &linear);
    registry.register_linear("second", &linear);

    let result = ParamGroups::partition(&linear, &registry, 0.1);
    assert_eq!(
        result.unwrap_err(),
        ModelError::OverlappingParamGroups(vec!["second.weight".into(), "second.bias".into()])
    );
}

#[test]
fn registry_of_an_identically_shaped_model_is_rejected() {
    let first = model();
    let twin = model();

    let paths = match ParamGroups::partition(&first, twin.param_roles(), 0.1) {
        Err(ModelError::ForeignParams(paths)) => paths,
        other => panic!("expected foreign parameters, got {other:?}"),
    };
    assert_eq!(paths.len(), twin.param_roles().len());
    assert!(paths.contains(&"head.weight".to_string()));
}

#[test]
fn unassigned_parameters_are_rejected() {
    let linear = LinearConfig::new(16, 8).init::<TestBackend>(&Default::default());
    let mut registry = ParamRegistry::new();
    registry.register("weight", &linear.weight, ParamRole::DecayWeight);

    let result = ParamGroups::partition(&linear, &registry, 0.1);
    assert_eq!(result.unwrap_err(), ModelError::IncompleteParamGroups { missing: 1, total: 2 });
}
