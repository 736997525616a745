mod config;
mod dataset;
mod neuralnet;

pub use config::ModelConfig;
pub use dataset::{Batch, BatchIterator, DataBuffer, Dataset, InMemoryDataset, Sample};
pub use neuralnet::{DatasetMode, NeuralNetwork, RunStats};
