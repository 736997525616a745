use crate::error::{GraphError, Result};
use crate::graph::ExecutionOrder;
use crate::tensor::{Tensor, TensorDim, TensorHandle, TensorManager, TensorSpec, WeightSpec};

/// Shape-inference context handed to [`crate::layers::Layer::finalize`].
#[derive(Debug, Clone)]
pub struct InitContext {
    name: String,
    input_dims: Vec<TensorDim>,
    num_requested_outputs: usize,
    trainable: bool,
    output_dims: Vec<TensorDim>,
    weights: Vec<WeightSpec>,
    tensors: Vec<TensorSpec>,
}

impl InitContext {
    #[must_use]
    pub fn new(
        name: &str,
        input_dims: Vec<TensorDim>,
        num_requested_outputs: usize,
        trainable: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            input_dims,
            num_requested_outputs: num_requested_outputs.max(1),
            trainable,
            output_dims: Vec::new(),
            weights: Vec::new(),
            tensors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_dims(&self) -> &[TensorDim] {
        &self.input_dims
    }

    pub fn num_inputs(&self) -> usize {
        self.input_dims.len()
    }

    /// Number of consumers wired to this node; at least one.
    pub fn num_requested_outputs(&self) -> usize {
        self.num_requested_outputs
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    /// Fails with a structural error unless exactly `expected` inputs are bound.
    pub fn expect_inputs(&self, layer_type: &str, expected: usize) -> Result<()> {
        if self.input_dims.len() != expected {
            return Err(GraphError::structural(format!(
                "Layer '{}' of type '{layer_type}' expects {expected} input(s), got {}",
                self.name,
                self.input_dims.len()
            )));
        }
        Ok(())
    }

    pub fn set_output_dims(&mut self, dims: Vec<TensorDim>) {
        self.output_dims = dims;
    }

    pub fn request_weight(&mut self, spec: WeightSpec) -> usize {
        self.weights.push(spec);
        self.weights.len() - 1
    }

    pub fn request_tensor(&mut self, spec: TensorSpec) -> usize {
        self.tensors.push(spec);
        self.tensors.len() - 1
    }

    pub fn output_dims(&self) -> &[TensorDim] {
        &self.output_dims
    }

    pub fn weight_specs(&self) -> &[WeightSpec] {
        &self.weights
    }

    pub fn tensor_specs(&self) -> &[TensorSpec] {
        &self.tensors
    }
}

/// Handles bound to one node at finalize time. Storage stays with the
/// [`TensorManager`]; this only records which slots the node reads and writes.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub weights: Vec<TensorHandle>,
    /// `true` where the weight aliases a slot owned by an earlier node.
    pub weight_dependent: Vec<bool>,
    pub inputs: Vec<TensorHandle>,
    pub outputs: Vec<TensorHandle>,
    pub tensors: Vec<TensorHandle>,
    pub exec_order: ExecutionOrder,
    pub loss: f32,
}

impl RunContext {
    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    pub fn is_weight_dependent(&self, index: usize) -> bool {
        self.weight_dependent.get(index).copied().unwrap_or(false)
    }
}

/// Borrowed view a layer computes through during forward and backward.
pub struct RunLayerContext<'a> {
    name: &'a str,
    trainable: bool,
    context: &'a mut RunContext,
    manager: &'a mut TensorManager,
}

impl<'a> RunLayerContext<'a> {
    pub fn new(
        name: &'a str,
        trainable: bool,
        context: &'a mut RunContext,
        manager: &'a mut TensorManager,
    ) -> Self {
        Self {
            name,
            trainable,
            context,
            manager,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn num_inputs(&self) -> usize {
        self.context.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.context.outputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&Tensor> {
        let handle = pick(&self.context.inputs, index, self.name, "input")?;
        self.manager.value(handle)
    }

    pub fn output(&self, index: usize) -> Result<&Tensor> {
        let handle = pick(&self.context.outputs, index, self.name, "output")?;
        self.manager.value(handle)
    }

    pub fn output_dim(&self, index: usize) -> Result<TensorDim> {
        let handle = pick(&self.context.outputs, index, self.name, "output")?;
        self.manager.dim(handle)
    }

    /// Gradient flowing back into output `index`. For label-consuming nodes
    /// this slot carries the label instead; it is empty when none was fed.
    pub fn output_gradient(&self, index: usize) -> Result<&Tensor> {
        let handle = pick(&self.context.outputs, index, self.name, "output")?;
        self.manager.gradient(handle)?.ok_or_else(|| {
            GraphError::lifecycle(format!(
                "Output {index} of '{}' carries no gradient",
                self.name
            ))
        })
    }

    pub fn weight(&self, index: usize) -> Result<&Tensor> {
        let handle = pick(&self.context.weights, index, self.name, "weight")?;
        self.manager.value(handle)
    }

    pub fn weight_has_gradient(&self, index: usize) -> Result<bool> {
        let handle = pick(&self.context.weights, index, self.name, "weight")?;
        Ok(self.manager.slot(handle)?.has_gradient())
    }

    pub fn set_output(&mut self, index: usize, tensor: Tensor) -> Result<()> {
        let handle = pick(&self.context.outputs, index, self.name, "output")?;
        let dim = self.manager.dim(handle)?;
        store(self.manager.value_mut(handle)?, tensor, dim)
    }

    /// Writes the derivative with respect to input `index`. Inputs alias the
    /// producer's output, so this lands in the producer's output gradient.
    pub fn set_input_gradient(&mut self, index: usize, tensor: Tensor) -> Result<()> {
        let handle = pick(&self.context.inputs, index, self.name, "input")?;
        let dim = self.manager.dim(handle)?;
        match self.manager.gradient_mut(handle)? {
            Some(gradient) => store(gradient, tensor, dim),
            None => Ok(()),
        }
    }

    /// Accumulates into weight gradient `index`; a no-op for frozen weights.
    pub fn add_weight_gradient(&mut self, index: usize, delta: &Tensor) -> Result<()> {
        let handle = pick(&self.context.weights, index, self.name, "weight")?;
        if let Some(gradient) = self.manager.gradient_mut(handle)? {
            gradient.add_inplace_scaled(delta, 1.0)?;
        }
        Ok(())
    }

    pub fn set_loss(&mut self, loss: f32) {
        self.context.loss = loss;
    }
}

fn pick(handles: &[TensorHandle], index: usize, name: &str, what: &str) -> Result<TensorHandle> {
    handles.get(index).copied().ok_or_else(|| {
        GraphError::structural(format!("Layer '{name}' has no {what} at index {index}"))
    })
}

fn store(slot: &mut Tensor, tensor: Tensor, dim: TensorDim) -> Result<()> {
    if tensor.dim != dim {
        return Err(crate::tensor::TensorError {
            message: format!("Expected tensor of dim {dim}, got {}", tensor.dim),
        }
        .into());
    }
    *slot = tensor;
    Ok(())
}
