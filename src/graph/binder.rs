use tracing::debug;

use crate::error::{GraphError, Result};
use crate::graph::{GraphStore, NodeId};
use crate::layers::{FlattenLayer, InputLayer, RunContext};
use crate::tensor::{TensorHandle, TensorManager};

/// Finalizes one node against the storage manager and binds the resulting
/// handles into its run context. `inputs` are the producer outputs already
/// resolved for the node, empty for graph inputs. Returns the node's output
/// handles so consumers can be seeded with them.
pub fn finalize_context(
    store: &mut GraphStore,
    manager: &mut TensorManager,
    id: NodeId,
    inputs: &[TensorHandle],
    batch_size: usize,
) -> Result<Vec<TensorHandle>> {
    let node = store.node(id)?;
    let name = node.name().to_string();

    let input_dims = if inputs.is_empty() {
        let shape = node.input_shape().ok_or_else(|| {
            GraphError::structural(format!(
                "Node '{name}' has no input connection and no input_shape"
            ))
        })?;
        vec![shape.with_batch(batch_size)]
    } else {
        inputs
            .iter()
            .map(|handle| manager.dim(*handle))
            .collect::<Result<Vec<_>>>()?
    };
    let producer_names = inputs
        .iter()
        .map(|handle| Ok(manager.slot(*handle)?.name().to_string()))
        .collect::<Result<Vec<_>>>()?;
    let num_requested_outputs = node.outputs().len();
    let in_place_kind = matches!(node.layer_type(), FlattenLayer::TYPE | InputLayer::TYPE);
    let trainable = node.trainable();

    let (shared_weights, shared_tensors) = match node.shared_from() {
        Some(source) => shared_names(store, manager, &name, source)?,
        None => (Vec::new(), Vec::new()),
    };

    let init = store
        .node_mut(id)?
        .finalize(input_dims, num_requested_outputs)?;

    let inputs = manager.request_inputs(&name, init.input_dims(), &producer_names)?;

    let alias_names = if in_place_kind {
        inputs
            .iter()
            .map(|handle| Ok(manager.slot(*handle)?.name().to_string()))
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };
    let outputs = manager.request_outputs(&name, init.output_dims(), &alias_names)?;

    let weights = manager.request_weights(&name, init.weight_specs(), trainable, &shared_weights)?;
    let tensors = manager.request_tensors(&name, init.tensor_specs(), &shared_tensors)?;
    debug!(
        node = name.as_str(),
        inputs = inputs.len(),
        outputs = outputs.len(),
        weights = weights.len(),
        shared = !shared_weights.is_empty(),
        "context finalized"
    );

    store.node_mut(id)?.configure_run_context(RunContext {
        weight_dependent: vec![!shared_weights.is_empty(); weights.len()],
        weights,
        inputs,
        outputs: outputs.clone(),
        tensors,
        ..RunContext::default()
    });
    Ok(outputs)
}

/// Slot names of the weights and tensors `name` borrows from `source`.
fn shared_names(
    store: &GraphStore,
    manager: &TensorManager,
    name: &str,
    source: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let dependent = store.get_node(name)?;
    let shared = store.get_node(source).map_err(|_| {
        GraphError::structural(format!(
            "Node '{name}' shares from '{source}', which is not in the graph"
        ))
    })?;
    if shared.layer_type() != dependent.layer_type() {
        return Err(GraphError::structural(format!(
            "Node '{name}' of type '{}' cannot share from '{source}' of type '{}'",
            dependent.layer_type(),
            shared.layer_type()
        )));
    }
    let Some(context) = shared.run_context() else {
        return Err(GraphError::structural(format!(
            "Node '{source}' must be finalized before '{name}' can share from it"
        )));
    };
    let slot_names = |handles: &[TensorHandle]| {
        handles
            .iter()
            .map(|handle| Ok(manager.slot(*handle)?.name().to_string()))
            .collect::<Result<Vec<_>>>()
    };
    Ok((slot_names(&context.weights)?, slot_names(&context.tensors)?))
}

#[cfg(test)]
mod tests {
    use crate::graph::binder::finalize_context;
    use crate::graph::{Connection, GraphStore, LayerNode};
    use crate::layers::LayerRegistry;
    use crate::tensor::{TensorDim, TensorManager};

    fn store_with(nodes: &[(&str, &[&str])]) -> GraphStore {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        for (layer_type, properties) in nodes {
            let layer = registry.create_layer(layer_type).expect("layer type");
            let node = LayerNode::with_properties(layer, properties).expect("properties");
            store.add_node(node, false).expect("add should pass");
        }
        store
    }

    #[test]
    fn graph_inputs_take_their_static_shape_at_the_current_batch() {
        let mut store = store_with(&[("input", &["name=in", "input_shape=1:1:4"])]);
        let mut manager = TensorManager::new(false);
        let id = store.id_of("in").expect("in");
        let outputs =
            finalize_context(&mut store, &mut manager, id, &[], 8).expect("finalize should pass");
        assert_eq!(
            manager.dim(outputs[0]).expect("dim"),
            TensorDim::new(8, 1, 1, 4)
        );
        assert!(store.node(id).expect("node").is_finalized());
    }

    #[test]
    fn consumers_alias_producer_outputs() {
        let mut store = store_with(&[
            ("input", &["name=in", "input_shape=4"]),
            ("fully_connected", &["name=fc", "unit=2"]),
        ]);
        let input = store.id_of("in").expect("in");
        let fc = store.id_of("fc").expect("fc");
        store
            .node_mut(fc)
            .expect("fc")
            .set_inputs(vec![Connection::Bound(input)]);
        let mut manager = TensorManager::new(false);
        let produced = finalize_context(&mut store, &mut manager, input, &[], 1).expect("in");
        finalize_context(&mut store, &mut manager, fc, &produced, 1).expect("fc");
        let context = store.node(fc).expect("fc").run_context().expect("bound");
        assert_eq!(context.inputs, produced);
        assert_eq!(context.weights.len(), 2);
        assert_eq!(context.weight_dependent, vec![false, false]);
    }

    #[test]
    fn shared_from_validates_source() {
        let mut store = store_with(&[
            ("input", &["name=in", "input_shape=4"]),
            ("fully_connected", &["name=a", "unit=4"]),
            ("fully_connected", &["name=b", "unit=4", "shared_from=a"]),
            ("flatten", &["name=c", "shared_from=a"]),
            ("fully_connected", &["name=d", "unit=4", "shared_from=ghost"]),
        ]);
        let mut manager = TensorManager::new(false);
        let input = store.id_of("in").expect("in");
        let produced = finalize_context(&mut store, &mut manager, input, &[], 1).expect("in");

        let b = store.id_of("b").expect("b");
        let err = finalize_context(&mut store, &mut manager, b, &produced, 1)
            .expect_err("source not finalized yet");
        assert!(err.is_structural());

        let a = store.id_of("a").expect("a");
        finalize_context(&mut store, &mut manager, a, &produced, 1).expect("a");
        finalize_context(&mut store, &mut manager, b, &produced, 1).expect("b");
        let a_weights = store.node(a).expect("a").run_context().expect("a").weights.clone();
        let b_context = store.node(b).expect("b").run_context().expect("b");
        assert_eq!(b_context.weights, a_weights);
        assert_eq!(b_context.weight_dependent, vec![true, true]);

        let c = store.id_of("c").expect("c");
        let err = finalize_context(&mut store, &mut manager, c, &produced, 1)
            .expect_err("type mismatch");
        assert!(err.is_structural());

        let d = store.id_of("d").expect("d");
        let err = finalize_context(&mut store, &mut manager, d, &produced, 1)
            .expect_err("missing source");
        assert!(err.is_structural());
    }
}
