use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::tensor::{Tensor, TensorDim, TensorError};

/// Non-owning token for a slot owned by [`TensorManager`]. Two nodes that share
/// storage hold the same token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Input,
    Output,
    Weight,
    Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Zeros,
    Ones,
    Constant(f32),
    XavierUniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Regularizer {
    #[default]
    None,
    L2 {
        decay: f32,
    },
}

#[derive(Debug, Clone)]
pub struct WeightSpec {
    pub name: String,
    pub dim: TensorDim,
    pub initializer: Initializer,
    pub regularizer: Regularizer,
    pub need_gradient: bool,
}

#[derive(Debug, Clone)]
pub struct TensorSpec {
    pub name: String,
    pub dim: TensorDim,
    pub need_gradient: bool,
    pub batch_dependent: bool,
}

/// A value tensor paired with an optional gradient. The owning node is the
/// only writer of the value; consumers refer to the slot by handle.
#[derive(Debug, Clone)]
pub struct VarGrad {
    name: String,
    owner: String,
    kind: TensorKind,
    dim: TensorDim,
    need_gradient: bool,
    batch_dependent: bool,
    initializer: Initializer,
    regularizer: Regularizer,
    value: Tensor,
    gradient: Tensor,
}

impl VarGrad {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gradient_name(&self) -> String {
        format!("{}{GRADIENT_SUFFIX}", self.name)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    pub fn dim(&self) -> TensorDim {
        self.dim
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn has_gradient(&self) -> bool {
        self.need_gradient
    }

    pub fn gradient(&self) -> Option<&Tensor> {
        self.need_gradient.then_some(&self.gradient)
    }

    pub fn gradient_mut(&mut self) -> Option<&mut Tensor> {
        self.need_gradient.then_some(&mut self.gradient)
    }

    pub fn regularizer(&self) -> Regularizer {
        self.regularizer
    }

    /// Folds the regularization term into the gradient ahead of an update.
    pub fn calc_regularization_gradient(&mut self) -> Result<()> {
        if let Regularizer::L2 { decay } = self.regularizer
            && self.need_gradient
        {
            let value = self.value.clone();
            self.gradient.add_inplace_scaled(&value, decay)?;
        }
        Ok(())
    }

    /// Plain gradient step `w -= lr * g`.
    pub fn apply_gradient(&mut self, learning_rate: f32) -> Result<()> {
        if !self.need_gradient {
            return Ok(());
        }
        let gradient = self.gradient.clone();
        self.value.add_inplace_scaled(&gradient, -learning_rate)?;
        Ok(())
    }
}

const GRADIENT_SUFFIX: &str = ":grad";

/// Owns every tensor of a graph. Nodes request storage by name and receive
/// handles; requests naming an existing slot alias it instead of allocating.
#[derive(Debug, Clone, Default)]
pub struct TensorManager {
    slots: Vec<VarGrad>,
    by_name: HashMap<String, TensorHandle>,
    tensors_allocated: bool,
    weights_allocated: bool,
    in_place: bool,
    seed: u64,
}

impl TensorManager {
    pub fn new(in_place: bool) -> Self {
        Self {
            in_place,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_allocated(&self) -> bool {
        self.tensors_allocated
    }

    pub fn weights_allocated(&self) -> bool {
        self.weights_allocated
    }

    /// Input slots for `owner`. Graph inputs (no producer names) get fresh
    /// slots; every other input aliases the named producer output.
    pub fn request_inputs(
        &mut self,
        owner: &str,
        dims: &[TensorDim],
        producer_names: &[String],
    ) -> Result<Vec<TensorHandle>> {
        if producer_names.is_empty() {
            return dims
                .iter()
                .enumerate()
                .map(|(index, dim)| {
                    self.create_slot(VarGrad {
                        name: format!("{owner}:input{index}"),
                        owner: owner.to_string(),
                        kind: TensorKind::Input,
                        dim: *dim,
                        need_gradient: true,
                        batch_dependent: true,
                        initializer: Initializer::Zeros,
                        regularizer: Regularizer::None,
                        value: Tensor::empty(),
                        gradient: Tensor::empty(),
                    })
                })
                .collect();
        }

        if dims.len() != producer_names.len() {
            return Err(GraphError::structural(format!(
                "Node '{owner}' declares {} inputs but {} producers are connected",
                dims.len(),
                producer_names.len()
            )));
        }
        producer_names
            .iter()
            .zip(dims)
            .map(|(name, dim)| {
                let handle = self.find(name).ok_or_else(|| {
                    GraphError::structural(format!(
                        "Input '{name}' of node '{owner}' was never produced"
                    ))
                })?;
                let existing = self.slot(handle)?.dim;
                if existing != *dim {
                    return Err(GraphError::structural(format!(
                        "Input '{name}' of node '{owner}' has dim {existing}, expected {dim}"
                    )));
                }
                Ok(handle)
            })
            .collect()
    }

    /// Output slots for `owner`. When in-place aliasing is enabled and
    /// `alias_inputs` names an input of identical extent, the input slot is
    /// reused.
    pub fn request_outputs(
        &mut self,
        owner: &str,
        dims: &[TensorDim],
        alias_inputs: &[String],
    ) -> Result<Vec<TensorHandle>> {
        let mut handles = Vec::with_capacity(dims.len());
        for (index, dim) in dims.iter().enumerate() {
            if self.in_place
                && let Some(alias) = alias_inputs.get(index)
                && let Some(handle) = self.find(alias)
                && self.slot(handle)?.dim == *dim
            {
                debug!(owner, alias = alias.as_str(), "output aliased onto input");
                handles.push(handle);
                continue;
            }
            handles.push(self.create_slot(VarGrad {
                name: format!("{owner}:output{index}"),
                owner: owner.to_string(),
                kind: TensorKind::Output,
                dim: *dim,
                need_gradient: true,
                batch_dependent: true,
                initializer: Initializer::Zeros,
                regularizer: Regularizer::None,
                value: Tensor::empty(),
                gradient: Tensor::empty(),
            })?);
        }
        Ok(handles)
    }

    /// Weight slots for `owner`, or the slots named by `shared_names` when
    /// the node borrows another node's weights.
    pub fn request_weights(
        &mut self,
        owner: &str,
        specs: &[WeightSpec],
        trainable: bool,
        shared_names: &[String],
    ) -> Result<Vec<TensorHandle>> {
        if !shared_names.is_empty() {
            return self.resolve_shared(owner, "weights", &specs_dims(specs), shared_names);
        }
        specs
            .iter()
            .map(|spec| {
                self.create_slot(VarGrad {
                    name: format!("{owner}:{}", spec.name),
                    owner: owner.to_string(),
                    kind: TensorKind::Weight,
                    dim: spec.dim,
                    need_gradient: spec.need_gradient && trainable,
                    batch_dependent: false,
                    initializer: spec.initializer,
                    regularizer: spec.regularizer,
                    value: Tensor::empty(),
                    gradient: Tensor::empty(),
                })
            })
            .collect()
    }

    pub fn request_tensors(
        &mut self,
        owner: &str,
        specs: &[TensorSpec],
        shared_names: &[String],
    ) -> Result<Vec<TensorHandle>> {
        if !shared_names.is_empty() {
            let dims = specs.iter().map(|spec| spec.dim).collect::<Vec<_>>();
            return self.resolve_shared(owner, "tensors", &dims, shared_names);
        }
        specs
            .iter()
            .map(|spec| {
                self.create_slot(VarGrad {
                    name: format!("{owner}:{}", spec.name),
                    owner: owner.to_string(),
                    kind: TensorKind::Tensor,
                    dim: spec.dim,
                    need_gradient: spec.need_gradient,
                    batch_dependent: spec.batch_dependent,
                    initializer: Initializer::Zeros,
                    regularizer: Regularizer::None,
                    value: Tensor::empty(),
                    gradient: Tensor::empty(),
                })
            })
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<TensorHandle> {
        self.by_name.get(name).copied()
    }

    pub fn slot(&self, handle: TensorHandle) -> Result<&VarGrad> {
        self.slots.get(handle.0).ok_or_else(|| missing_handle(handle))
    }

    pub fn slot_mut(&mut self, handle: TensorHandle) -> Result<&mut VarGrad> {
        self.slots
            .get_mut(handle.0)
            .ok_or_else(|| missing_handle(handle))
    }

    pub fn value(&self, handle: TensorHandle) -> Result<&Tensor> {
        Ok(&self.slot(handle)?.value)
    }

    pub fn value_mut(&mut self, handle: TensorHandle) -> Result<&mut Tensor> {
        Ok(&mut self.slot_mut(handle)?.value)
    }

    pub fn gradient(&self, handle: TensorHandle) -> Result<Option<&Tensor>> {
        Ok(self.slot(handle)?.gradient())
    }

    pub fn gradient_mut(&mut self, handle: TensorHandle) -> Result<Option<&mut Tensor>> {
        Ok(self.slot_mut(handle)?.gradient_mut())
    }

    pub fn dim(&self, handle: TensorHandle) -> Result<TensorDim> {
        Ok(self.slot(handle)?.dim)
    }

    /// Resizes the batch axis of one slot. Weights and batch-independent
    /// scratch tensors are left alone.
    pub fn set_batch_size(&mut self, name: &str, batch: usize) -> Result<()> {
        if self.tensors_allocated {
            return Err(GraphError::lifecycle(format!(
                "Cannot resize '{name}' while tensors are allocated"
            )));
        }
        let handle = self
            .find(name)
            .ok_or_else(|| GraphError::structural(format!("Unknown tensor '{name}'")))?;
        let slot = self.slot_mut(handle)?;
        if slot.kind != TensorKind::Weight && slot.batch_dependent {
            slot.dim.set_batch(batch);
        }
        Ok(())
    }

    pub fn allocate_tensors(&mut self) {
        for slot in self
            .slots
            .iter_mut()
            .filter(|slot| slot.kind != TensorKind::Weight)
        {
            slot.value = Tensor::zeros(slot.dim);
            slot.gradient = if slot.need_gradient {
                Tensor::zeros(slot.dim)
            } else {
                Tensor::empty()
            };
        }
        self.tensors_allocated = true;
    }

    /// Releases every non-weight buffer; specs and handles stay valid.
    pub fn deallocate_tensors(&mut self) {
        for slot in self
            .slots
            .iter_mut()
            .filter(|slot| slot.kind != TensorKind::Weight)
        {
            slot.value = Tensor::empty();
            slot.gradient = Tensor::empty();
        }
        self.tensors_allocated = false;
    }

    pub fn allocate_weights(&mut self) {
        if self.weights_allocated {
            return;
        }
        let seed = self.seed;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.kind != TensorKind::Weight {
                continue;
            }
            slot.value = initialize(slot.dim, slot.initializer, seed.wrapping_add(index as u64));
            slot.gradient = if slot.need_gradient {
                Tensor::zeros(slot.dim)
            } else {
                Tensor::empty()
            };
        }
        self.weights_allocated = true;
    }

    pub fn deallocate_weights(&mut self) {
        for slot in self
            .slots
            .iter_mut()
            .filter(|slot| slot.kind == TensorKind::Weight)
        {
            slot.value = Tensor::empty();
            slot.gradient = Tensor::empty();
        }
        self.weights_allocated = false;
    }

    pub fn zero_weight_gradients(&mut self) {
        for slot in self
            .slots
            .iter_mut()
            .filter(|slot| slot.kind == TensorKind::Weight && slot.need_gradient)
        {
            slot.gradient.fill(0.0);
        }
    }

    /// Feeds (or, with an empty tensor, clears) an externally owned value.
    /// Names ending in `:grad` address the slot's gradient, which is where
    /// labels live.
    pub fn set_external_tensor(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        let (base, gradient) = match name.strip_suffix(GRADIENT_SUFFIX) {
            Some(base) => (base, true),
            None => (name, false),
        };
        let handle = self
            .find(base)
            .ok_or_else(|| GraphError::structural(format!("Unknown external tensor '{name}'")))?;
        let slot = self.slot_mut(handle)?;
        if !tensor.is_empty() && tensor.dim != slot.dim {
            return Err(TensorError {
                message: format!(
                    "External tensor '{name}' has dim {}, expected {}",
                    tensor.dim, slot.dim
                ),
            }
            .into());
        }
        if gradient {
            slot.gradient = tensor;
        } else {
            slot.value = tensor;
        }
        Ok(())
    }

    fn create_slot(&mut self, slot: VarGrad) -> Result<TensorHandle> {
        if self.by_name.contains_key(&slot.name) {
            return Err(GraphError::structural(format!(
                "Tensor '{}' is requested twice",
                slot.name
            )));
        }
        let handle = TensorHandle(self.slots.len());
        self.by_name.insert(slot.name.clone(), handle);
        self.slots.push(slot);
        Ok(handle)
    }

    fn resolve_shared(
        &self,
        owner: &str,
        what: &str,
        dims: &[TensorDim],
        shared_names: &[String],
    ) -> Result<Vec<TensorHandle>> {
        if dims.len() != shared_names.len() {
            return Err(GraphError::structural(format!(
                "Node '{owner}' needs {} {what} but its source shares {}",
                dims.len(),
                shared_names.len()
            )));
        }
        shared_names
            .iter()
            .zip(dims)
            .map(|(name, dim)| {
                let handle = self.find(name).ok_or_else(|| {
                    GraphError::structural(format!(
                        "Shared tensor '{name}' requested by '{owner}' does not exist"
                    ))
                })?;
                let existing = self.slot(handle)?.dim;
                if existing != *dim {
                    return Err(GraphError::structural(format!(
                        "Shared tensor '{name}' has dim {existing}, '{owner}' expects {dim}"
                    )));
                }
                Ok(handle)
            })
            .collect()
    }
}

fn specs_dims(specs: &[WeightSpec]) -> Vec<TensorDim> {
    specs.iter().map(|spec| spec.dim).collect()
}

fn missing_handle(handle: TensorHandle) -> GraphError {
    GraphError::structural(format!("Tensor handle {} is not registered", handle.0))
}

fn initialize(dim: TensorDim, initializer: Initializer, seed: u64) -> Tensor {
    match initializer {
        Initializer::Zeros => Tensor::zeros(dim),
        Initializer::Ones => Tensor::filled(dim, 1.0),
        Initializer::Constant(value) => Tensor::filled(dim, value),
        Initializer::XavierUniform => {
            let fan_in = dim.rows().max(1) as f32;
            let fan_out = dim.width().max(1) as f32;
            let limit = (6.0 / (fan_in + fan_out)).sqrt();
            let mut rng = StdRng::seed_from_u64(seed);
            Tensor {
                dim,
                data: (0..dim.data_len())
                    .map(|_| rng.gen_range(-limit..limit))
                    .collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::{
        Initializer, Regularizer, Tensor, TensorDim, TensorManager, TensorSpec, WeightSpec,
    };

    fn weight_spec(name: &str, width: usize) -> WeightSpec {
        WeightSpec {
            name: name.to_string(),
            dim: TensorDim::new(1, 1, 2, width),
            initializer: Initializer::Ones,
            regularizer: Regularizer::None,
            need_gradient: true,
        }
    }

    #[test]
    fn inputs_alias_named_producer_outputs() {
        let mut manager = TensorManager::new(false);
        let outputs = manager
            .request_outputs("fc", &[TensorDim::vector(3)], &[])
            .expect("outputs should be created");
        let inputs = manager
            .request_inputs("act", &[TensorDim::vector(3)], &["fc:output0".to_string()])
            .expect("inputs should alias");
        assert_eq!(outputs, inputs);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn unknown_producer_is_structural() {
        let mut manager = TensorManager::new(false);
        let err = manager
            .request_inputs("act", &[TensorDim::vector(3)], &["ghost:output0".to_string()])
            .expect_err("producer does not exist");
        assert!(err.is_structural());
    }

    #[test]
    fn shared_weights_reuse_the_same_handles() {
        let mut manager = TensorManager::new(false);
        let source = manager
            .request_weights("a", &[weight_spec("weight", 3)], true, &[])
            .expect("source weights");
        let shared = manager
            .request_weights(
                "b",
                &[weight_spec("weight", 3)],
                true,
                &["a:weight".to_string()],
            )
            .expect("shared weights");
        assert_eq!(source, shared);

        let err = manager
            .request_weights(
                "c",
                &[weight_spec("weight", 4)],
                true,
                &["a:weight".to_string()],
            )
            .expect_err("dims differ");
        assert!(err.is_structural());
    }

    #[test]
    fn deallocation_keeps_weights_and_specs() {
        let mut manager = TensorManager::new(false);
        let weights = manager
            .request_weights("a", &[weight_spec("weight", 2)], true, &[])
            .expect("weights");
        let outputs = manager
            .request_outputs("a", &[TensorDim::new(4, 1, 1, 2)], &[])
            .expect("outputs");
        manager.allocate_weights();
        manager.allocate_tensors();
        assert_eq!(manager.value(outputs[0]).expect("slot").len(), 8);

        manager.deallocate_tensors();
        assert!(manager.value(outputs[0]).expect("slot").is_empty());
        assert_eq!(manager.value(weights[0]).expect("slot").data, vec![1.0; 4]);
    }

    #[test]
    fn batch_resize_skips_weights_and_fixed_tensors() {
        let mut manager = TensorManager::new(false);
        manager
            .request_weights("a", &[weight_spec("weight", 2)], true, &[])
            .expect("weights");
        manager
            .request_tensors(
                "a",
                &[TensorSpec {
                    name: "scratch".to_string(),
                    dim: TensorDim::new(1, 1, 1, 2),
                    need_gradient: false,
                    batch_dependent: false,
                }],
                &[],
            )
            .expect("tensors");
        let out = manager
            .request_outputs("a", &[TensorDim::vector(2)], &[])
            .expect("outputs");

        for name in ["a:weight", "a:scratch", "a:output0"] {
            manager.set_batch_size(name, 5).expect("resize");
        }
        assert_eq!(manager.dim(out[0]).expect("dim").batch(), 5);
        let weight = manager.find("a:weight").expect("weight exists");
        assert_eq!(manager.dim(weight).expect("dim").batch(), 1);
        let scratch = manager.find("a:scratch").expect("scratch exists");
        assert_eq!(manager.dim(scratch).expect("dim").batch(), 1);
    }

    #[test]
    fn external_labels_land_in_the_gradient() {
        let mut manager = TensorManager::new(false);
        let out = manager
            .request_outputs("loss", &[TensorDim::vector(2)], &[])
            .expect("outputs");
        manager.allocate_tensors();
        let label = Tensor::new(TensorDim::vector(2), vec![0.0, 1.0]).expect("label");
        manager
            .set_external_tensor("loss:output0:grad", label.clone())
            .expect("label should be accepted");
        assert_eq!(
            manager.gradient(out[0]).expect("slot"),
            Some(&label)
        );

        let wrong = Tensor::zeros(TensorDim::vector(3));
        let err = manager
            .set_external_tensor("loss:output0:grad", wrong)
            .expect_err("dims differ");
        assert!(matches!(err, crate::error::GraphError::Computation(_)));
    }

    #[test]
    fn l2_regularization_adds_decayed_weights() {
        let mut manager = TensorManager::new(false);
        let mut spec = weight_spec("weight", 1);
        spec.regularizer = Regularizer::L2 { decay: 0.5 };
        let handles = manager
            .request_weights("a", &[spec], true, &[])
            .expect("weights");
        manager.allocate_weights();

        let slot = manager.slot_mut(handles[0]).expect("slot");
        slot.calc_regularization_gradient()
            .expect("regularization should pass");
        assert_eq!(slot.gradient().expect("trainable").data, vec![0.5, 0.5]);
        slot.apply_gradient(1.0).expect("update should pass");
        assert_eq!(slot.value().data, vec![0.5, 0.5]);
    }

    #[test]
    fn frozen_weights_carry_no_gradient() {
        let mut manager = TensorManager::new(false);
        let handles = manager
            .request_weights("a", &[weight_spec("weight", 2)], false, &[])
            .expect("weights");
        manager.allocate_weights();
        assert!(manager.gradient(handles[0]).expect("slot").is_none());
    }
}
