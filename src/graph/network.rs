use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use tracing::{debug, info, instrument};

use crate::error::{GraphError, Result};
use crate::flags::GraphFlags;
use crate::graph::{
    Connection, GraphStore, LayerNode, NodeId, assign_execution_order, finalize_context,
    print_graph, realize, verify_with_policy,
};
use crate::layers::LayerRegistry;
use crate::optimizer::Optimizer;
use crate::tensor::{Tensor, TensorDim, TensorHandle, TensorManager};

/// Owns a layer graph and drives it through build, compile, initialize and
/// run. Structural mutation is only possible before `compile`; forward and
/// backward need `initialize` plus allocated tensors.
#[derive(Debug)]
pub struct NetworkGraph {
    store: GraphStore,
    registry: LayerRegistry,
    manager: TensorManager,
    flags: GraphFlags,
    compiled: bool,
    initialized: bool,
    batch_size: usize,
    skip_non_trainable: usize,
    sub_in_out: HashMap<String, String>,
    input_list: Vec<String>,
    label_list: Vec<String>,
    output_list: Vec<String>,
    input_dims: Vec<TensorDim>,
    label_dims: Vec<TensorDim>,
}

impl Default for NetworkGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(LayerRegistry::with_defaults())
    }

    #[must_use]
    pub fn with_registry(registry: LayerRegistry) -> Self {
        let flags = GraphFlags::from_env();
        Self {
            store: GraphStore::new(),
            registry,
            manager: TensorManager::new(flags.in_place),
            flags,
            compiled: false,
            initialized: false,
            batch_size: 1,
            skip_non_trainable: 0,
            sub_in_out: HashMap::new(),
            input_list: Vec::new(),
            label_list: Vec::new(),
            output_list: Vec::new(),
            input_dims: Vec::new(),
            label_dims: Vec::new(),
        }
    }

    /// Replaces the runtime flags. Only meaningful before `initialize`, since
    /// the storage manager is rebuilt with the new in-place policy.
    #[must_use]
    pub fn with_flags(mut self, flags: GraphFlags) -> Self {
        self.flags = flags;
        self.manager = TensorManager::new(flags.in_place);
        self
    }

    /// Seeds weight initialization.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.manager = self.manager.with_seed(seed);
        self
    }

    /// Builds a node from the registry and applies `key=value` properties.
    pub fn create_node<S: AsRef<str>>(&self, layer_type: &str, properties: &[S]) -> Result<LayerNode> {
        LayerNode::with_properties(self.registry.create_layer(layer_type)?, properties)
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn flags(&self) -> &GraphFlags {
        &self.flags
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn manager(&self) -> &TensorManager {
        &self.manager
    }

    pub fn size(&self) -> usize {
        self.store.size()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Position of the first node that both trains and backpropagates.
    pub fn skip_non_trainable(&self) -> usize {
        self.skip_non_trainable
    }

    pub fn get_layer_node(&self, name: &str) -> Result<&LayerNode> {
        self.store.get_node(name)
    }

    pub fn sorted_node(&self, position: usize) -> Result<&LayerNode> {
        self.store.sorted(position)
    }

    pub fn input_dimensions(&self) -> &[TensorDim] {
        &self.input_dims
    }

    /// Dims of the label-consuming outputs, in label order.
    pub fn output_dimensions(&self) -> &[TensorDim] {
        &self.label_dims
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_list
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_list
    }

    pub fn summary(&self) -> String {
        print_graph(&self.store)
    }

    pub fn add_layer(&mut self, node: LayerNode) -> Result<NodeId> {
        self.ensure_building("add a layer")?;
        self.store.add_node(node, true)
    }

    /// Appends a sub-graph under `prefix`. Names inside the sub-graph are
    /// prefixed and their connections follow the renames; the first node may
    /// also reach nodes already in the graph, or a previously extended
    /// sub-graph by its prefix.
    pub fn extend_graph(&mut self, nodes: Vec<LayerNode>, prefix: &str) -> Result<()> {
        self.ensure_building("extend the graph")?;
        let Some(first) = nodes.first() else {
            return Err(GraphError::structural(format!(
                "Cannot extend the graph with an empty sub-graph under '{prefix}'"
            )));
        };
        let mut entry_inputs = Vec::with_capacity(first.num_input_connections());
        for connection in first.inputs() {
            entry_inputs.push(match connection {
                Connection::Named(name) => match self.sub_in_out.get(&name.to_ascii_lowercase()) {
                    Some(renamed) => Connection::Named(renamed.clone()),
                    None if self.store.verify_node(name) => connection.clone(),
                    None => {
                        return Err(GraphError::structural(format!(
                            "Sub-graph input '{name}' does not exist in the graph"
                        )));
                    }
                },
                Connection::Bound(_) => connection.clone(),
            });
        }

        let mut last_name = String::new();
        for (index, mut node) in nodes.into_iter().enumerate() {
            if index == 0 {
                node.set_inputs(std::mem::take(&mut entry_inputs));
            }
            let original = format!("{prefix}{}", node.name());
            self.store.ensure_name(&mut node, prefix, "", true);
            self.sub_in_out
                .insert(original.to_ascii_lowercase(), node.name().to_string());

            let node_name = node.name().to_string();
            for connection in node.inputs_mut() {
                let Connection::Named(name) = connection else {
                    continue;
                };
                let scoped = format!("{prefix}{name}").to_ascii_lowercase();
                if let Some(renamed) = self.sub_in_out.get(&scoped) {
                    *name = renamed.clone();
                } else if !self.store.verify_node(name) {
                    return Err(GraphError::structural(format!(
                        "Input '{name}' of sub-graph node '{node_name}' does not exist"
                    )));
                }
            }
            debug!(prefix, node = node.name(), "sub-graph node added");
            last_name = node.name().to_string();
            self.store.add_node(node, false)?;
        }
        self.sub_in_out.insert(prefix.to_ascii_lowercase(), last_name);
        Ok(())
    }

    /// Realizes, sorts and schedules the graph. A failed compile leaves the
    /// graph partially rewritten; discard it.
    #[instrument(skip_all, fields(loss = loss_type))]
    pub fn compile(&mut self, loss_type: &str) -> Result<()> {
        if self.compiled {
            return Err(GraphError::lifecycle("Graph is already compiled"));
        }
        if self.store.is_empty() {
            return Err(GraphError::structural("Cannot compile an empty graph"));
        }

        realize(&mut self.store, &self.registry, loss_type)?;
        self.store.topological_sort()?;

        let count = self.store.size();
        self.skip_non_trainable = self
            .store
            .iter()
            .position(|node| node.trainable() && node.supports_backwarding())
            .unwrap_or(count);

        for (position, order) in assign_execution_order(count).into_iter().enumerate() {
            self.store.sorted_mut(position)?.set_exec_order(order)?;
        }

        if let Some(node) = self
            .store
            .iter()
            .find(|node| node.num_input_connections() == 0 && !node.has_input_shape())
        {
            return Err(GraphError::structural(format!(
                "Input node '{}' has no static input shape",
                node.name()
            )));
        }
        verify_with_policy(&self.store, &self.flags)?;

        self.compiled = true;
        info!(
            nodes = count,
            skip_non_trainable = self.skip_non_trainable,
            "graph compiled"
        );
        Ok(())
    }

    /// Binds storage for every node in sorted order and records the model's
    /// inputs and labels. Non-empty name lists must name exactly the
    /// discovered input and label nodes.
    #[instrument(skip_all)]
    pub fn initialize(&mut self, input_names: &[&str], label_names: &[&str]) -> Result<()> {
        if !self.compiled {
            return Err(GraphError::lifecycle("Graph must be compiled before initialize"));
        }
        if self.initialized {
            return Err(GraphError::lifecycle("Graph is already initialized"));
        }

        let mut input_map: HashMap<NodeId, Vec<Option<TensorHandle>>> = HashMap::new();
        for position in 0..self.store.size() {
            let id = self
                .store
                .id_at(position)
                .ok_or_else(|| GraphError::structural(format!("No node at position {position}")))?;
            let node = self.store.node(id)?;
            let inputs = if node.num_input_connections() == 0 {
                Vec::new()
            } else {
                let slots = input_map.remove(&id).ok_or_else(|| {
                    GraphError::structural(format!("No input was produced for '{}'", node.name()))
                })?;
                slots
                    .into_iter()
                    .enumerate()
                    .map(|(index, slot)| {
                        slot.ok_or_else(|| {
                            GraphError::structural(format!(
                                "Input {index} of '{}' was never produced",
                                node.name()
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            };

            let outputs =
                finalize_context(&mut self.store, &mut self.manager, id, &inputs, self.batch_size)?;

            let node = self.store.node(id)?;
            if outputs.len() < node.outputs().len() {
                return Err(GraphError::structural(format!(
                    "Node '{}' feeds {} consumers but produces {} outputs",
                    node.name(),
                    node.outputs().len(),
                    outputs.len()
                )));
            }
            for (output, consumer) in outputs.iter().zip(node.outputs()) {
                let consumer_node = self.store.node(*consumer)?;
                let slot = consumer_node
                    .inputs()
                    .iter()
                    .position(|connection| *connection == Connection::Bound(id))
                    .ok_or_else(|| {
                        GraphError::structural(format!(
                            "Node '{}' does not read from '{}'",
                            consumer_node.name(),
                            node.name()
                        ))
                    })?;
                input_map
                    .entry(*consumer)
                    .or_insert_with(|| vec![None; consumer_node.num_input_connections()])[slot] =
                    Some(*output);
            }
        }

        self.identify_inputs(input_names)?;
        self.identify_labels(label_names)?;
        self.check_initialized_graph()?;
        self.initialized = true;
        info!(
            inputs = self.input_list.len(),
            labels = self.label_list.len(),
            tensors = self.manager.len(),
            "graph initialized"
        );
        Ok(())
    }

    fn identify_inputs(&mut self, names: &[&str]) -> Result<()> {
        let discovered = self
            .store
            .iter()
            .filter(|node| node.num_input_connections() == 0)
            .map(|node| node.name().to_string())
            .collect::<Vec<_>>();
        let chosen = self.choose(names, &discovered, "input", |node| {
            node.num_input_connections() == 0
        })?;
        for name in chosen {
            let node = self.store.get_node(&name)?;
            let context = node.run_context().ok_or_else(|| unbound(&name))?;
            let [handle] = context.inputs.as_slice() else {
                return Err(GraphError::structural(format!(
                    "Input node '{name}' must expose exactly one input"
                )));
            };
            let slot = self.manager.slot(*handle)?;
            self.input_list.push(slot.name().to_string());
            self.input_dims.push(slot.dim());
        }
        Ok(())
    }

    fn identify_labels(&mut self, names: &[&str]) -> Result<()> {
        let discovered = self
            .store
            .iter()
            .filter(|node| node.requires_label())
            .map(|node| node.name().to_string())
            .collect::<Vec<_>>();
        let chosen = self.choose(names, &discovered, "label", LayerNode::requires_label)?;
        for name in chosen {
            let node = self.store.get_node(&name)?;
            if !node.outputs().is_empty() {
                return Err(GraphError::structural(format!(
                    "Label node '{name}' must be a leaf of the graph"
                )));
            }
            let context = node.run_context().ok_or_else(|| unbound(&name))?;
            let [handle] = context.outputs.as_slice() else {
                return Err(GraphError::structural(format!(
                    "Label node '{name}' must expose exactly one output"
                )));
            };
            let slot = self.manager.slot(*handle)?;
            self.output_list.push(slot.name().to_string());
            self.label_list.push(slot.gradient_name());
            self.label_dims.push(slot.dim());
        }
        Ok(())
    }

    /// Names to use for one role: `requested` when given, else `discovered`.
    fn choose(
        &self,
        requested: &[&str],
        discovered: &[String],
        role: &str,
        accepts: impl Fn(&LayerNode) -> bool,
    ) -> Result<Vec<String>> {
        if requested.is_empty() {
            return Ok(discovered.to_vec());
        }
        for name in requested {
            let node = self.store.get_node(name)?;
            if !accepts(node) {
                return Err(GraphError::structural(format!(
                    "Node '{name}' cannot be used as a {role} node"
                )));
            }
        }
        let distinct = requested
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect::<HashSet<_>>();
        if distinct.len() != requested.len() || requested.len() != discovered.len() {
            return Err(GraphError::structural(format!(
                "Given {} {role} names but the graph has {} {role} nodes",
                requested.len(),
                discovered.len()
            )));
        }
        Ok(requested
            .iter()
            .map(|name| {
                self.store
                    .get_node(name)
                    .map_or_else(|_| (*name).to_string(), |node| node.name().to_string())
            })
            .collect())
    }

    /// Every node downstream of a trainable node must backpropagate, or its
    /// gradient would never reach the weights.
    pub fn check_initialized_graph(&self) -> Result<()> {
        let mut must_support = HashSet::new();
        for id in self.store.ids() {
            let node = self.store.node(*id)?;
            if node.trainable() || must_support.contains(id) {
                must_support.extend(node.outputs().iter().copied());
            }
        }
        for id in self.store.ids() {
            let node = self.store.node(*id)?;
            if must_support.contains(id) && !node.supports_backwarding() {
                return Err(GraphError::structural(format!(
                    "Node '{}' is on a gradient path but does not support backwarding",
                    node.name()
                )));
            }
        }
        Ok(())
    }

    pub fn allocate_weights(&mut self) -> Result<()> {
        self.ensure_initialized("allocate weights")?;
        self.manager.allocate_weights();
        Ok(())
    }

    pub fn allocate_tensors(&mut self) -> Result<()> {
        self.ensure_initialized("allocate tensors")?;
        self.manager.allocate_tensors();
        debug!(batch = self.batch_size, "tensors allocated");
        Ok(())
    }

    pub fn deallocate_tensors(&mut self) {
        self.manager.deallocate_tensors();
    }

    pub fn is_allocated(&self) -> bool {
        self.manager.is_allocated()
    }

    /// Resizes every batch-dependent slot. Allocated storage is released and
    /// reacquired around the change.
    pub fn set_batch_size(&mut self, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(GraphError::configuration("Batch size must be positive"));
        }
        if batch == self.batch_size {
            return Ok(());
        }
        self.batch_size = batch;
        if self
            .input_dims
            .first()
            .is_some_and(|dim| dim.batch() == batch)
        {
            return Ok(());
        }

        let allocated = self.manager.is_allocated();
        if allocated {
            self.manager.deallocate_tensors();
        }
        for position in 0..self.store.size() {
            let node = self.store.sorted_mut(position)?;
            let Some(context) = node.run_context() else {
                continue;
            };
            let handles = context
                .inputs
                .iter()
                .chain(&context.outputs)
                .chain(&context.tensors)
                .copied()
                .collect::<Vec<_>>();
            node.set_batch(batch);
            for handle in handles {
                let name = self.manager.slot(handle)?.name().to_string();
                self.manager.set_batch_size(&name, batch)?;
            }
        }
        if allocated {
            self.manager.allocate_tensors();
        }

        self.input_dims = self.dims_of(&self.input_list)?;
        self.label_dims = self.dims_of(&self.output_list)?;
        debug!(batch, "batch size changed");
        Ok(())
    }

    fn dims_of(&self, names: &[String]) -> Result<Vec<TensorDim>> {
        names
            .iter()
            .map(|name| {
                let handle = self
                    .manager
                    .find(name)
                    .ok_or_else(|| GraphError::structural(format!("Unknown tensor '{name}'")))?;
                self.manager.dim(handle)
            })
            .collect()
    }

    /// Feeds model inputs and labels by position. One tensor is broadcast to
    /// every name; an empty list clears what was fed before.
    pub fn set_inputs_labels(&mut self, inputs: &[Tensor], labels: &[Tensor]) -> Result<()> {
        self.ensure_initialized("feed inputs")?;
        feed(&mut self.manager, &self.input_list, inputs, "inputs")?;
        feed(&mut self.manager, &self.label_list, labels, "labels")
    }

    /// Runs every node forward in sorted order and returns the value of each
    /// designated output node.
    pub fn forward(&mut self, training: bool) -> Result<Vec<Tensor>> {
        self.ensure_runnable("forward")?;
        for position in 0..self.store.size() {
            self.store
                .sorted_mut(position)?
                .forward(&mut self.manager, training)?;
        }
        self.output_tensors()
    }

    /// Values of the designated output nodes' first outputs.
    pub fn output_tensors(&self) -> Result<Vec<Tensor>> {
        self.store
            .designated_outputs()
            .iter()
            .map(|id| {
                let node = self.store.node(*id)?;
                let context = node.run_context().ok_or_else(|| unbound(node.name()))?;
                let handle = context.outputs.first().ok_or_else(|| {
                    GraphError::structural(format!("Output node '{}' has no output", node.name()))
                })?;
                Ok(self.manager.value(*handle)?.clone())
            })
            .collect()
    }

    /// Walks the trainable suffix in reverse. Each node computes its weight
    /// gradients, then its input derivative (skipped for the first node of
    /// the suffix unless `derivative_for_first`), then applies updates to
    /// the weights it owns.
    pub fn backward(
        &mut self,
        iteration: usize,
        optimizer: &mut dyn Optimizer,
        derivative_for_first: bool,
    ) -> Result<()> {
        self.ensure_runnable("backward")?;
        let count = self.store.size();
        if self.skip_non_trainable >= count {
            return Ok(());
        }
        let terminal = self.store.sorted(count - 1)?;
        if !terminal.requires_label() {
            return Err(GraphError::lifecycle(format!(
                "Backward needs a label-consuming terminal node, but '{}' is a {}",
                terminal.name(),
                terminal.layer_type()
            )));
        }

        self.manager.zero_weight_gradients();
        for position in (self.skip_non_trainable..count).rev() {
            let node = self.store.sorted_mut(position)?;
            node.calc_gradient(&mut self.manager)?;
            if position != self.skip_non_trainable || derivative_for_first {
                node.calc_derivative(&mut self.manager)?;
            }
            if !node.trainable() {
                continue;
            }
            let Some(context) = node.run_context() else {
                continue;
            };
            for (index, handle) in context.weights.iter().enumerate() {
                let weight = self.manager.slot_mut(*handle)?;
                if context.is_weight_dependent(index) || !weight.has_gradient() {
                    continue;
                }
                weight.calc_regularization_gradient()?;
                optimizer.apply_gradient(weight, iteration)?;
            }
        }
        Ok(())
    }

    /// Sum of the losses reported by every node.
    pub fn loss(&self) -> f32 {
        self.store.iter().map(LayerNode::loss).sum()
    }

    /// Writes every node's weights in sorted order, without header.
    pub fn save(&self, writer: &mut impl Write) -> Result<()> {
        self.ensure_weights("save")?;
        for node in self.store.iter() {
            node.save(&self.manager, writer)?;
        }
        Ok(())
    }

    /// Reads weights written by [`NetworkGraph::save`] for an identical graph.
    pub fn read(&mut self, reader: &mut impl Read) -> Result<()> {
        self.ensure_weights("read")?;
        for node in self.store.iter() {
            node.read(&mut self.manager, reader)?;
        }
        Ok(())
    }

    fn ensure_building(&self, action: &str) -> Result<()> {
        if self.compiled {
            return Err(GraphError::lifecycle(format!(
                "Cannot {action} after the graph is compiled"
            )));
        }
        Ok(())
    }

    fn ensure_initialized(&self, action: &str) -> Result<()> {
        if !self.initialized {
            return Err(GraphError::lifecycle(format!(
                "Cannot {action} before the graph is initialized"
            )));
        }
        Ok(())
    }

    fn ensure_runnable(&self, action: &str) -> Result<()> {
        self.ensure_initialized(action)?;
        if !self.manager.is_allocated() {
            return Err(GraphError::lifecycle(format!(
                "Cannot run {action} before tensors are allocated"
            )));
        }
        if !self.manager.weights_allocated() {
            return Err(GraphError::lifecycle(format!(
                "Cannot run {action} before weights are allocated"
            )));
        }
        Ok(())
    }

    fn ensure_weights(&self, action: &str) -> Result<()> {
        self.ensure_initialized(action)?;
        if !self.manager.weights_allocated() {
            return Err(GraphError::lifecycle(format!(
                "Cannot {action} weights before they are allocated"
            )));
        }
        Ok(())
    }
}

fn feed(manager: &mut TensorManager, names: &[String], tensors: &[Tensor], what: &str) -> Result<()> {
    if tensors.len() > 1 && tensors.len() != names.len() {
        return Err(GraphError::structural(format!(
            "Got {} {what} for {} slots",
            tensors.len(),
            names.len()
        )));
    }
    for (index, name) in names.iter().enumerate() {
        let tensor = match tensors {
            [] => Tensor::empty(),
            [single] => single.clone(),
            many => many[index].clone(),
        };
        manager.set_external_tensor(name, tensor)?;
    }
    Ok(())
}

fn unbound(name: &str) -> GraphError {
    GraphError::lifecycle(format!("Node '{name}' is not finalized"))
}
