use std::path::PathBuf;
use std::sync::Arc;

use layergraph::model::{DataBuffer, DatasetMode, InMemoryDataset, ModelConfig, NeuralNetwork, Sample};
use layergraph::optimizer::Sgd;
use layergraph::tensor::{Tensor, TensorDim};

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("layergraph-{}-{name}", std::process::id()))
}

/// `y = x0 - x1` sampled on a small grid.
fn regression_set(count: usize) -> DataBuffer {
    let samples = (0..count)
        .map(|index| {
            let x0 = index as f32 / count as f32;
            let x1 = 1.0 - x0;
            Sample {
                inputs: vec![
                    Tensor::new(TensorDim::new(1, 1, 1, 2), vec![x0, x1]).expect("input"),
                ],
                labels: vec![Tensor::new(TensorDim::new(1, 1, 1, 1), vec![x0 - x1]).expect("label")],
            }
        })
        .collect();
    DataBuffer::new(Arc::new(InMemoryDataset::new(samples)))
}

fn model(properties: &[&str]) -> NeuralNetwork {
    let mut config = ModelConfig::default();
    config
        .set_properties(&["loss=mse", "batch_size=2"])
        .expect("defaults");
    config.set_properties(properties).expect("properties");
    let mut model = NeuralNetwork::new(config);
    let input = model
        .create_node("input", &["name=in", "input_shape=1:1:2"])
        .expect("input");
    let fc = model
        .create_node("fully_connected", &["name=fc", "unit=1"])
        .expect("fc");
    model.add_layer(input).expect("add input");
    model.add_layer(fc).expect("add fc");
    model.compile().expect("compile should pass");
    model.initialize().expect("initialize should pass");
    model.set_optimizer(Box::new(Sgd::new(0.1)));
    model
}

#[test]
fn continued_training_lowers_the_loss() {
    let mut model = model(&["epochs=1"]);
    model.set_dataset(DatasetMode::Train, regression_set(8));
    model.train().expect("first epoch");
    let first = model.training_stats().clone();
    assert_eq!(first.num_iterations, 4);
    assert_eq!(model.epoch_idx(), 1);
    assert_eq!(model.iteration(), 4);

    model
        .set_property(&["epochs=40", "continue_train=true"])
        .expect("properties");
    model.train().expect("continued training");
    assert_eq!(model.epoch_idx(), 40);
    assert_eq!(model.iteration(), 160);
    assert!(model.training_stats().loss < first.loss);
}

#[test]
fn restarting_without_continue_resets_counters() {
    let mut model = model(&["epochs=2"]);
    model.set_dataset(DatasetMode::Train, regression_set(4));
    model.train().expect("train");
    assert_eq!(model.iteration(), 4);
    model.train().expect("train again");
    assert_eq!(model.epoch_idx(), 2);
    assert_eq!(model.iteration(), 4);
}

#[test]
fn validation_and_test_sets_are_evaluated() {
    let best = scratch("best.bin");
    let _ = std::fs::remove_file(&best);
    let best_property = format!("save_best_path={}", best.display());

    let mut model = model(&["epochs=3", best_property.as_str()]);
    model.set_dataset(DatasetMode::Train, regression_set(6));
    model.set_dataset(DatasetMode::Valid, regression_set(4));
    model.set_dataset(DatasetMode::Test, regression_set(2));
    model.train().expect("train");

    // A single output unit always wins its own argmax.
    assert_eq!(model.validation_stats().num_iterations, 2);
    assert_eq!(model.validation_stats().accuracy, 100.0);
    assert_eq!(model.testing_stats().num_iterations, 1);
    assert_eq!(model.testing_stats().num_correct_predictions, 2);
    assert!(best.exists());
    let _ = std::fs::remove_file(&best);
}

#[test]
fn saved_counters_come_back_on_load() {
    let path = scratch("checkpoint.bin");
    let _ = std::fs::remove_file(&path);
    let save_property = format!("save_path={}", path.display());

    let mut trained = model(&["epochs=2", save_property.as_str()]);
    trained.set_dataset(DatasetMode::Train, regression_set(8));
    trained.train().expect("train");
    // Two weights and one bias, then epoch and iteration.
    let bytes = std::fs::read(&path).expect("checkpoint written");
    assert_eq!(bytes.len(), 3 * 4 + 2 * 4);

    let load_property = format!("load_path={}", path.display());
    let mut restored = model(&[load_property.as_str()]);
    assert_eq!(restored.epoch_idx(), 2);
    assert_eq!(restored.iteration(), 8);

    let probe = Tensor::new(TensorDim::new(1, 1, 1, 2), vec![0.3, 0.7]).expect("probe");
    let expected = trained.inference(&[probe.clone()], true).expect("inference");
    let actual = restored.inference(&[probe], true).expect("inference");
    assert_eq!(actual, expected);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn inference_resizes_to_the_input_batch() {
    let mut model = model(&[]);
    let inputs = Tensor::filled(TensorDim::new(3, 1, 1, 2), 0.5);
    let outputs = model.inference(&[inputs], false).expect("inference");
    assert_eq!(outputs[0].dim, TensorDim::new(3, 1, 1, 1));
    assert_eq!(model.graph().batch_size(), 3);
    assert!(model.graph().is_allocated());
}

#[test]
fn too_small_dataset_is_a_lifecycle_error() {
    let mut model = model(&["batch_size=4"]);
    model.set_dataset(DatasetMode::Train, regression_set(3));
    let err = model.train().expect_err("no full batch");
    assert!(err.is_lifecycle());
    assert!(!model.graph().is_allocated());
}
