use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::{info, instrument};

use crate::error::{GraphError, Result};
use crate::graph::{LayerNode, NetworkGraph};
use crate::model::{Batch, DataBuffer, ModelConfig};
use crate::optimizer::Optimizer;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetMode {
    Train,
    Valid,
    Test,
}

/// Running totals of one epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub loss: f32,
    pub num_iterations: usize,
    pub num_correct_predictions: usize,
    /// Percentage of correctly classified samples, for evaluation epochs.
    pub accuracy: f32,
}

/// Training and inference driver around a [`NetworkGraph`].
#[derive(Debug)]
pub struct NeuralNetwork {
    config: ModelConfig,
    graph: NetworkGraph,
    optimizer: Option<Box<dyn Optimizer>>,
    datasets: HashMap<DatasetMode, DataBuffer>,
    epoch_idx: u32,
    iter: u32,
    initialized: bool,
    training: RunStats,
    validation: RunStats,
    testing: RunStats,
    best: Option<RunStats>,
}

impl NeuralNetwork {
    #[must_use]
    pub fn new(config: ModelConfig) -> Self {
        Self::with_graph(config, NetworkGraph::new())
    }

    #[must_use]
    pub fn with_graph(config: ModelConfig, graph: NetworkGraph) -> Self {
        Self {
            config,
            graph,
            optimizer: None,
            datasets: HashMap::new(),
            epoch_idx: 0,
            iter: 0,
            initialized: false,
            training: RunStats::default(),
            validation: RunStats::default(),
            testing: RunStats::default(),
            best: None,
        }
    }

    pub fn set_property<S: AsRef<str>>(&mut self, properties: &[S]) -> Result<()> {
        self.config.set_properties(properties)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    pub fn epoch_idx(&self) -> u32 {
        self.epoch_idx
    }

    pub fn iteration(&self) -> u32 {
        self.iter
    }

    pub fn training_stats(&self) -> &RunStats {
        &self.training
    }

    pub fn validation_stats(&self) -> &RunStats {
        &self.validation
    }

    pub fn testing_stats(&self) -> &RunStats {
        &self.testing
    }

    pub fn create_node<S: AsRef<str>>(&self, layer_type: &str, properties: &[S]) -> Result<LayerNode> {
        self.graph.create_node(layer_type, properties)
    }

    pub fn add_layer(&mut self, node: LayerNode) -> Result<()> {
        self.graph.add_layer(node).map(|_| ())
    }

    pub fn extend_graph(&mut self, nodes: Vec<LayerNode>, prefix: &str) -> Result<()> {
        self.graph.extend_graph(nodes, prefix)
    }

    pub fn set_optimizer(&mut self, optimizer: Box<dyn Optimizer>) {
        self.optimizer = Some(optimizer);
    }

    pub fn set_dataset(&mut self, mode: DatasetMode, buffer: DataBuffer) {
        self.datasets.insert(mode, buffer);
    }

    pub fn compile(&mut self) -> Result<()> {
        let loss = self.config.loss.clone();
        self.graph.compile(&loss)
    }

    /// Binds storage at the configured batch size, allocates weights and
    /// loads them from `load_path` when one is set and exists.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(GraphError::lifecycle("Model is already initialized"));
        }
        self.graph.set_batch_size(self.config.batch_size)?;
        self.graph.initialize(&[], &[])?;
        self.graph.allocate_weights()?;
        self.initialized = true;
        if let Some(path) = self.config.load_path.clone()
            && path.exists()
        {
            self.load(&path)?;
        }
        Ok(())
    }

    pub fn loss(&self) -> f32 {
        self.graph.loss()
    }

    pub fn summary(&self) -> String {
        self.graph.summary()
    }

    /// Feeds one batch and runs forward.
    pub fn forwarding(
        &mut self,
        inputs: &[Tensor],
        labels: &[Tensor],
        training: bool,
    ) -> Result<Vec<Tensor>> {
        self.graph.set_inputs_labels(inputs, labels)?;
        self.graph.forward(training)
    }

    pub fn backwarding(&mut self, iteration: usize) -> Result<()> {
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| GraphError::lifecycle("Backwarding needs an optimizer"))?;
        let derivative_for_first = self.graph.flags().derivative_for_first;
        self.graph
            .backward(iteration, optimizer.as_mut(), derivative_for_first)
    }

    /// Runs the model on `inputs` at their batch size. With `free_mem` the
    /// run tensors are released afterwards.
    pub fn inference(&mut self, inputs: &[Tensor], free_mem: bool) -> Result<Vec<Tensor>> {
        if !self.initialized {
            return Err(GraphError::lifecycle("Inference needs an initialized model"));
        }
        let batch = inputs
            .first()
            .map(Tensor::batch)
            .ok_or_else(|| GraphError::structural("Inference needs at least one input"))?;
        self.graph.set_batch_size(batch)?;
        if !self.graph.is_allocated() {
            self.graph.allocate_tensors()?;
        }
        let outputs = self.forwarding(inputs, &[], false);
        if free_mem {
            self.graph.deallocate_tensors();
        }
        outputs
    }

    /// Runs the configured epochs over the training set, validating after
    /// each epoch and testing once at the end when those sets exist.
    #[instrument(skip_all)]
    pub fn train(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(GraphError::lifecycle("Training needs an initialized model"));
        }
        if self.optimizer.is_none() {
            return Err(GraphError::lifecycle("Training needs an optimizer"));
        }
        if !self.datasets.contains_key(&DatasetMode::Train) {
            return Err(GraphError::lifecycle("Training needs a training dataset"));
        }
        if !self.config.continue_train {
            self.epoch_idx = 0;
            self.iter = 0;
        }

        self.graph.set_batch_size(self.config.batch_size)?;
        self.graph.allocate_tensors()?;
        let result = self.run_training();
        self.graph.deallocate_tensors();
        result
    }

    fn run_training(&mut self) -> Result<()> {
        let epochs = u32::try_from(self.config.epochs)
            .map_err(|_| GraphError::configuration("Epoch count does not fit in u32"))?;
        for epoch in self.epoch_idx + 1..=epochs {
            self.epoch_idx = epoch;
            self.training = self.run_epoch(DatasetMode::Train, train_step, train_epoch_end)?;
            info!(
                epoch,
                loss = self.training.loss,
                iterations = self.training.num_iterations,
                "training epoch done"
            );
            if self.datasets.contains_key(&DatasetMode::Valid) {
                self.validation = self.run_epoch(DatasetMode::Valid, eval_step, valid_epoch_end)?;
                info!(
                    epoch,
                    loss = self.validation.loss,
                    accuracy = self.validation.accuracy,
                    "validation done"
                );
            }
        }
        if self.datasets.contains_key(&DatasetMode::Test) {
            self.testing = self.run_epoch(DatasetMode::Test, eval_step, eval_epoch_end)?;
            info!(
                loss = self.testing.loss,
                accuracy = self.testing.accuracy,
                "test done"
            );
        }
        Ok(())
    }

    /// Feeds every full batch of `mode` through `step`, then hands the
    /// totals to `epoch_end`. Trailing partial batches are skipped.
    fn run_epoch<S, E>(&mut self, mode: DatasetMode, step: S, epoch_end: E) -> Result<RunStats>
    where
        S: FnMut(&mut Self, &Batch, &mut RunStats) -> Result<()>,
        E: FnOnce(&mut Self, &mut RunStats) -> Result<()>,
    {
        let Some(mut buffer) = self.datasets.remove(&mode) else {
            return Err(GraphError::lifecycle(format!("No {mode:?} dataset is set")));
        };
        let result = self.drive_epoch(&mut buffer, step);
        self.datasets.insert(mode, buffer);
        let mut stats = result?;
        if stats.num_iterations == 0 {
            return Err(GraphError::lifecycle(format!(
                "{mode:?} dataset yielded no full batch of {}",
                self.config.batch_size
            )));
        }
        epoch_end(self, &mut stats)?;
        Ok(stats)
    }

    fn drive_epoch<S>(&mut self, buffer: &mut DataBuffer, mut step: S) -> Result<RunStats>
    where
        S: FnMut(&mut Self, &Batch, &mut RunStats) -> Result<()>,
    {
        let batch_size = self.config.batch_size;
        let mut stats = RunStats::default();
        buffer.start(batch_size)?;
        while let Some(batch) = buffer.fetch()? {
            if batch.size() < batch_size {
                continue;
            }
            self.graph.set_inputs_labels(&batch.inputs, &batch.labels)?;
            step(self, &batch, &mut stats)?;
            stats.num_iterations += 1;
        }
        Ok(stats)
    }

    /// Writes the weights followed by the epoch and iteration counters as
    /// little-endian `u32`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.graph.save(&mut writer)?;
        writer.write_all(&self.epoch_idx.to_le_bytes())?;
        writer.write_all(&self.iter.to_le_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Reads weights written by [`NeuralNetwork::save`]. Missing trailing
    /// counters leave the current ones in place.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        if !self.initialized {
            return Err(GraphError::lifecycle("Loading needs an initialized model"));
        }
        let mut reader = BufReader::new(File::open(path)?);
        self.graph.read(&mut reader)?;
        if let Some(epoch_idx) = read_counter(&mut reader)? {
            self.epoch_idx = epoch_idx;
        }
        if let Some(iter) = read_counter(&mut reader)? {
            self.iter = iter;
        }
        Ok(())
    }
}

fn read_counter(reader: &mut impl Read) -> Result<Option<u32>> {
    let mut bytes = [0u8; 4];
    match reader.read_exact(&mut bytes) {
        Ok(()) => Ok(Some(u32::from_le_bytes(bytes))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn train_step(model: &mut NeuralNetwork, _batch: &Batch, stats: &mut RunStats) -> Result<()> {
    model.graph.forward(true)?;
    let iteration = model.iter as usize;
    model.backwarding(iteration)?;
    model.iter += 1;
    stats.loss += model.graph.loss();
    Ok(())
}

fn train_epoch_end(model: &mut NeuralNetwork, stats: &mut RunStats) -> Result<()> {
    stats.loss /= stats.num_iterations as f32;
    if let Some(path) = model.config.save_path.clone() {
        model.save(&path)?;
    }
    Ok(())
}

fn eval_step(model: &mut NeuralNetwork, batch: &Batch, stats: &mut RunStats) -> Result<()> {
    let outputs = model.graph.forward(false)?;
    for (output, label) in outputs.iter().zip(&batch.labels) {
        stats.num_correct_predictions += output
            .argmax()
            .iter()
            .zip(label.argmax())
            .filter(|(predicted, expected)| **predicted == *expected)
            .count();
    }
    stats.loss += model.graph.loss();
    Ok(())
}

fn eval_epoch_end(model: &mut NeuralNetwork, stats: &mut RunStats) -> Result<()> {
    stats.loss /= stats.num_iterations as f32;
    let samples = stats.num_iterations * model.config.batch_size;
    stats.accuracy = stats.num_correct_predictions as f32 / samples as f32 * 100.0;
    Ok(())
}

fn valid_epoch_end(model: &mut NeuralNetwork, stats: &mut RunStats) -> Result<()> {
    eval_epoch_end(model, stats)?;
    let improved = model.best.as_ref().is_none_or(|best| {
        stats.accuracy > best.accuracy
            || (stats.accuracy == best.accuracy && stats.loss < best.loss)
    });
    if improved {
        model.best = Some(stats.clone());
        if let Some(path) = model.config.save_best_path.clone() {
            model.save(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::model::{ModelConfig, NeuralNetwork};
    use crate::optimizer::Sgd;

    fn model() -> NeuralNetwork {
        let mut config = ModelConfig::default();
        config
            .set_properties(&["loss=mse", "batch_size=2"])
            .expect("config");
        let mut model = NeuralNetwork::new(config);
        let input = model
            .create_node("input", &["name=in", "input_shape=1:1:2"])
            .expect("input");
        let fc = model
            .create_node("fully_connected", &["name=fc", "unit=1"])
            .expect("fc");
        model.add_layer(input).expect("add input");
        model.add_layer(fc).expect("add fc");
        model
    }

    #[test]
    fn train_needs_initialize_optimizer_and_data() {
        let mut model = model();
        assert!(model.train().expect_err("not initialized").is_lifecycle());
        model.compile().expect("compile should pass");
        model.initialize().expect("initialize should pass");
        assert!(model.train().expect_err("no optimizer").is_lifecycle());
        model.set_optimizer(Box::new(Sgd::new(0.1)));
        assert!(model.train().expect_err("no dataset").is_lifecycle());
    }

    #[test]
    fn inference_follows_input_batch() {
        let mut model = model();
        model.compile().expect("compile should pass");
        model.initialize().expect("initialize should pass");
        let input = crate::tensor::Tensor::filled(crate::tensor::TensorDim::new(3, 1, 1, 2), 1.0);
        let outputs = model.inference(&[input], true).expect("inference should pass");
        assert_eq!(outputs[0].dim, crate::tensor::TensorDim::new(3, 1, 1, 1));
        assert_eq!(model.graph().batch_size(), 3);
        assert!(!model.graph().is_allocated());
    }
}
