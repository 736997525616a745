use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::{GraphError, Result};
use crate::tensor::Tensor;

/// One example: a tensor per model input and per label, each of batch 1.
#[derive(Debug, Clone)]
pub struct Sample {
    pub inputs: Vec<Tensor>,
    pub labels: Vec<Tensor>,
}

/// Samples stacked along the batch axis.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Vec<Tensor>,
    pub labels: Vec<Tensor>,
    size: usize,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.size
    }

    fn stack(samples: &[Sample]) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(GraphError::structural("Cannot build a batch from no samples"));
        };
        Ok(Self {
            inputs: stack_column(samples, first.inputs.len(), |sample, index| {
                sample.inputs.get(index)
            })?,
            labels: stack_column(samples, first.labels.len(), |sample, index| {
                sample.labels.get(index)
            })?,
            size: samples.len(),
        })
    }
}

fn stack_column(
    samples: &[Sample],
    count: usize,
    pick: impl Fn(&Sample, usize) -> Option<&Tensor>,
) -> Result<Vec<Tensor>> {
    (0..count)
        .map(|index| {
            let parts = samples
                .iter()
                .map(|sample| {
                    pick(sample, index).cloned().ok_or_else(|| {
                        GraphError::structural("Samples disagree on their tensor count")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::concat_batch(&parts)?)
        })
        .collect()
}

pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn sample(&self, index: usize) -> Result<Sample>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    #[must_use]
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            GraphError::structural(format!(
                "Sample {index} is out of range for {} samples",
                self.samples.len()
            ))
        })
    }
}

pub struct BatchIterator {
    indices: Vec<usize>,
    position: usize,
    batch_size: usize,
}

impl BatchIterator {
    #[must_use]
    pub fn new(size: usize, batch_size: usize, shuffle: Option<u64>) -> Self {
        let mut indices = (0..size).collect::<Vec<_>>();
        if let Some(seed) = shuffle {
            indices.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Self {
            indices,
            position: 0,
            batch_size: batch_size.max(1),
        }
    }
}

impl Iterator for BatchIterator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let batch = self.indices[self.position..end].to_vec();
        self.position = end;
        Some(batch)
    }
}

/// Hands batches of a dataset to the training loop. Each epoch runs a
/// producer thread that stacks samples and sends them over a bounded
/// channel; `fetch` returning `None` marks the end of the epoch.
pub struct DataBuffer {
    dataset: Arc<dyn Dataset>,
    shuffle_seed: Option<u64>,
    capacity: usize,
    epoch: u64,
    receiver: Option<Receiver<Result<Batch>>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer")
            .field("samples", &self.dataset.len())
            .field("shuffle_seed", &self.shuffle_seed)
            .field("epoch", &self.epoch)
            .field("running", &self.receiver.is_some())
            .finish()
    }
}

impl DataBuffer {
    #[must_use]
    pub fn new(dataset: Arc<dyn Dataset>) -> Self {
        Self {
            dataset,
            shuffle_seed: None,
            capacity: 4,
            epoch: 0,
            receiver: None,
            worker: None,
        }
    }

    /// Shuffles every epoch; the order depends on `seed` and the epoch count.
    #[must_use]
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Starts producing one epoch of batches. A previous epoch still in
    /// flight is abandoned.
    pub fn start(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(GraphError::configuration("Batch size must be positive"));
        }
        self.stop();
        let (sender, receiver) = sync_channel(self.capacity);
        let dataset = Arc::clone(&self.dataset);
        let shuffle = self.shuffle_seed.map(|seed| seed.wrapping_add(self.epoch));
        self.epoch += 1;
        let worker = std::thread::Builder::new()
            .name("layergraph-data".to_string())
            .spawn(move || produce(dataset.as_ref(), batch_size, shuffle, &sender))?;
        self.receiver = Some(receiver);
        self.worker = Some(worker);
        debug!(batch_size, epoch = self.epoch, "data producer started");
        Ok(())
    }

    /// Next batch of the running epoch, or `None` once it is exhausted.
    pub fn fetch(&mut self) -> Result<Option<Batch>> {
        let Some(receiver) = &self.receiver else {
            return Err(GraphError::lifecycle("Data buffer was not started"));
        };
        match receiver.recv() {
            Ok(batch) => batch.map(Some),
            Err(_) => {
                self.stop();
                Ok(None)
            }
        }
    }

    fn stop(&mut self) {
        self.receiver = None;
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("data producer panicked");
        }
    }
}

impl Drop for DataBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(
    dataset: &dyn Dataset,
    batch_size: usize,
    shuffle: Option<u64>,
    sender: &SyncSender<Result<Batch>>,
) {
    for indices in BatchIterator::new(dataset.len(), batch_size, shuffle) {
        let batch = indices
            .iter()
            .map(|index| dataset.sample(*index))
            .collect::<Result<Vec<_>>>()
            .and_then(|samples| Batch::stack(&samples));
        let failed = batch.is_err();
        if sender.send(batch).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::model::{BatchIterator, DataBuffer, InMemoryDataset, Sample};
    use crate::tensor::{Tensor, TensorDim};

    fn dataset(count: usize) -> Arc<InMemoryDataset> {
        let samples = (0..count)
            .map(|index| Sample {
                inputs: vec![Tensor::filled(TensorDim::vector(2), index as f32)],
                labels: vec![Tensor::filled(TensorDim::vector(1), 1.0)],
            })
            .collect();
        Arc::new(InMemoryDataset::new(samples))
    }

    #[test]
    fn seeded_shuffle_is_stable() {
        let first = BatchIterator::new(10, 3, Some(42)).collect::<Vec<_>>();
        let second = BatchIterator::new(10, 3, Some(42)).collect::<Vec<_>>();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn empty_fetch_marks_end_of_epoch() {
        let mut buffer = DataBuffer::new(dataset(5));
        buffer.start(2).expect("start should pass");
        let mut sizes = Vec::new();
        while let Some(batch) = buffer.fetch().expect("fetch should pass") {
            assert_eq!(batch.inputs[0].dim, TensorDim::new(batch.size(), 1, 1, 2));
            sizes.push(batch.size());
        }
        assert_eq!(sizes, vec![2, 2, 1]);

        buffer.start(5).expect("second epoch should start");
        let batch = buffer.fetch().expect("fetch").expect("one full batch");
        assert_eq!(batch.size(), 5);
        assert!(buffer.fetch().expect("fetch").is_none());
    }

    #[test]
    fn fetch_before_start_is_rejected() {
        let mut buffer = DataBuffer::new(dataset(1));
        assert!(buffer.fetch().expect_err("not started").is_lifecycle());
    }
}
