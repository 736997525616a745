use std::io::{Read, Write};

use crate::error::{GraphError, Result};
use crate::graph::ExecutionOrder;
use crate::layers::{
    ActivationLayer, ActivationType, InitContext, Layer, RunContext, RunLayerContext, parse_bool,
};
use crate::tensor::{TensorDim, TensorManager};

/// Stable handle to a node slot in a [`crate::graph::GraphStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// One input edge. Authored edges are names; realization binds them to
/// handles before any rewrite touches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Named(String),
    Bound(NodeId),
}

impl Connection {
    pub fn bound(&self) -> Option<NodeId> {
        match self {
            Self::Bound(id) => Some(*id),
            Self::Named(_) => None,
        }
    }
}

/// A graph vertex: one layer plus its wiring, realization markers and, once
/// finalized, the handles of its bound storage.
#[derive(Debug)]
pub struct LayerNode {
    name: String,
    layer: Box<dyn Layer>,
    inputs: Vec<Connection>,
    outputs: Vec<NodeId>,
    activation_to_realize: ActivationType,
    input_shape: Option<TensorDim>,
    trainable: bool,
    distribute: bool,
    shared_from: Option<String>,
    exec_order: Option<ExecutionOrder>,
    input_dims: Vec<TensorDim>,
    output_dims: Vec<TensorDim>,
    run_context: Option<RunContext>,
}

impl LayerNode {
    #[must_use]
    pub fn new(layer: Box<dyn Layer>) -> Self {
        Self {
            name: String::new(),
            layer,
            inputs: Vec::new(),
            outputs: Vec::new(),
            activation_to_realize: ActivationType::None,
            input_shape: None,
            trainable: true,
            distribute: false,
            shared_from: None,
            exec_order: None,
            input_dims: Vec::new(),
            output_dims: Vec::new(),
            run_context: None,
        }
    }

    pub fn with_properties<S: AsRef<str>>(layer: Box<dyn Layer>, properties: &[S]) -> Result<Self> {
        let mut node = Self::new(layer);
        node.set_properties(properties)?;
        Ok(node)
    }

    pub fn set_properties<S: AsRef<str>>(&mut self, properties: &[S]) -> Result<()> {
        for entry in properties {
            self.set_property(entry.as_ref())?;
        }
        Ok(())
    }

    /// Applies one `key=value` entry. Node-level keys are consumed here; the
    /// rest go to the layer.
    pub fn set_property(&mut self, entry: &str) -> Result<()> {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(GraphError::configuration(format!(
                "Property '{entry}' is not of the form key=value"
            )));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "name" => self.name = value.to_string(),
            "input_layers" => {
                self.inputs = value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| Connection::Named(name.to_string()))
                    .collect();
            }
            "input_shape" => {
                self.input_shape = Some(value.parse::<TensorDim>().map_err(|err| {
                    GraphError::configuration(format!("Bad input_shape '{value}': {err}"))
                })?);
            }
            "activation" if self.layer.layer_type() == ActivationLayer::TYPE => {
                self.layer.set_property(&key, value)?;
            }
            "activation" => {
                let Ok(activation) = value.parse::<ActivationType>();
                self.activation_to_realize = activation;
            }
            "trainable" => self.trainable = parse_bool(&key, value)?,
            "distribute" => self.distribute = parse_bool(&key, value)?,
            "shared_from" => {
                self.shared_from = (!value.is_empty()).then(|| value.to_string());
            }
            _ => self.layer.set_property(&key, value)?,
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn layer_type(&self) -> &'static str {
        self.layer.layer_type()
    }

    pub fn layer(&self) -> &dyn Layer {
        self.layer.as_ref()
    }

    pub fn inputs(&self) -> &[Connection] {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut Vec<Connection> {
        &mut self.inputs
    }

    pub fn set_inputs(&mut self, inputs: Vec<Connection>) {
        self.inputs = inputs;
    }

    pub fn num_input_connections(&self) -> usize {
        self.inputs.len()
    }

    /// Input edges that are already bound, in declaration order.
    pub fn bound_inputs(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs.iter().filter_map(Connection::bound)
    }

    /// Repoints every bound edge from `from` to `to`. Returns whether any
    /// edge changed.
    pub fn repoint_input(&mut self, from: NodeId, to: NodeId) -> bool {
        let mut changed = false;
        for connection in &mut self.inputs {
            if *connection == Connection::Bound(from) {
                *connection = Connection::Bound(to);
                changed = true;
            }
        }
        changed
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn add_output(&mut self, id: NodeId) {
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
    }

    pub fn activation_to_realize(&self) -> ActivationType {
        self.activation_to_realize
    }

    pub fn set_activation_to_realize(&mut self, activation: ActivationType) {
        self.activation_to_realize = activation;
    }

    pub fn activation_type(&self) -> Option<ActivationType> {
        self.layer.activation_type()
    }

    pub fn input_shape(&self) -> Option<TensorDim> {
        self.input_shape
    }

    pub fn has_input_shape(&self) -> bool {
        self.input_shape.is_some()
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn distribute(&self) -> bool {
        self.distribute
    }

    pub fn set_distribute(&mut self, distribute: bool) {
        self.distribute = distribute;
    }

    pub fn shared_from(&self) -> Option<&str> {
        self.shared_from.as_deref()
    }

    pub fn requires_label(&self) -> bool {
        self.layer.requires_label()
    }

    pub fn supports_backwarding(&self) -> bool {
        self.layer.supports_backwarding()
    }

    pub fn exec_order(&self) -> Option<ExecutionOrder> {
        self.exec_order
    }

    pub fn set_exec_order(&mut self, order: ExecutionOrder) -> Result<()> {
        if self.exec_order.is_some() {
            return Err(GraphError::lifecycle(format!(
                "Execution order of '{}' is already assigned",
                self.name
            )));
        }
        self.exec_order = Some(order);
        Ok(())
    }

    pub fn input_dims(&self) -> &[TensorDim] {
        &self.input_dims
    }

    pub fn output_dims(&self) -> &[TensorDim] {
        &self.output_dims
    }

    pub fn is_finalized(&self) -> bool {
        self.run_context.is_some()
    }

    pub fn run_context(&self) -> Option<&RunContext> {
        self.run_context.as_ref()
    }

    pub fn loss(&self) -> f32 {
        self.run_context
            .as_ref()
            .map_or(0.0, |context| context.loss)
    }

    /// Runs shape inference for the given input dims.
    pub fn finalize(
        &mut self,
        input_dims: Vec<TensorDim>,
        num_requested_outputs: usize,
    ) -> Result<InitContext> {
        if self.is_finalized() {
            return Err(GraphError::lifecycle(format!(
                "Node '{}' is already finalized",
                self.name
            )));
        }
        let mut context = InitContext::new(
            &self.name,
            input_dims,
            num_requested_outputs,
            self.trainable,
        );
        self.layer.finalize(&mut context)?;
        if context.output_dims().is_empty() {
            return Err(GraphError::structural(format!(
                "Layer '{}' declared no outputs",
                self.name
            )));
        }
        self.input_dims = context.input_dims().to_vec();
        self.output_dims = context.output_dims().to_vec();
        Ok(context)
    }

    pub fn configure_run_context(&mut self, mut context: RunContext) {
        if let Some(order) = self.exec_order {
            context.exec_order = order;
        }
        self.run_context = Some(context);
    }

    pub fn set_batch(&mut self, batch: usize) {
        for dim in self.input_dims.iter_mut().chain(self.output_dims.iter_mut()) {
            dim.set_batch(batch);
        }
    }

    pub fn forward(&mut self, manager: &mut TensorManager, training: bool) -> Result<()> {
        let context = bound_context(&self.name, &mut self.run_context)?;
        let mut run = RunLayerContext::new(&self.name, self.trainable, context, manager);
        self.layer.forward(&mut run, training)
    }

    pub fn calc_gradient(&mut self, manager: &mut TensorManager) -> Result<()> {
        let context = bound_context(&self.name, &mut self.run_context)?;
        let mut run = RunLayerContext::new(&self.name, self.trainable, context, manager);
        self.layer.calc_gradient(&mut run)
    }

    pub fn calc_derivative(&mut self, manager: &mut TensorManager) -> Result<()> {
        let context = bound_context(&self.name, &mut self.run_context)?;
        let mut run = RunLayerContext::new(&self.name, self.trainable, context, manager);
        self.layer.calc_derivative(&mut run)
    }

    /// Writes the raw little-endian values of every weight, in order.
    pub fn save(&self, manager: &TensorManager, writer: &mut impl Write) -> Result<()> {
        if let Some(context) = &self.run_context {
            for handle in &context.weights {
                manager.value(*handle)?.write_to(writer)?;
            }
        }
        Ok(())
    }

    pub fn read(&self, manager: &mut TensorManager, reader: &mut impl Read) -> Result<()> {
        if let Some(context) = &self.run_context {
            for handle in &context.weights {
                manager.value_mut(*handle)?.read_from(reader)?;
            }
        }
        Ok(())
    }
}

fn bound_context<'a>(name: &str, context: &'a mut Option<RunContext>) -> Result<&'a mut RunContext> {
    context
        .as_mut()
        .ok_or_else(|| GraphError::lifecycle(format!("Node '{name}' is not finalized")))
}
