//! Structural rewrite passes run once at compile time.
//!
//! Passes may append nodes to the store, so every loop re-reads the store
//! size instead of capturing it up front.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{GraphError, Result};
use crate::graph::{Connection, GraphStore, LayerNode, NodeId};
use crate::layers::{ActivationLayer, ActivationType, LayerRegistry, LossLayer, MultiOutLayer};

/// Loss name that selects the activation-fused cross entropy variants.
pub const CROSS_ENTROPY: &str = "cross";

pub trait RealizePass {
    fn name(&self) -> &'static str;
    fn run(&mut self, store: &mut GraphStore, registry: &LayerRegistry) -> Result<()>;
}

/// Links every unconnected node without a static shape to its predecessor.
#[derive(Debug, Default)]
pub struct DefaultInputPass;

impl RealizePass for DefaultInputPass {
    fn name(&self) -> &'static str {
        "default_input"
    }

    fn run(&mut self, store: &mut GraphStore, _registry: &LayerRegistry) -> Result<()> {
        for position in 1..store.size() {
            let previous = id_at(store, position - 1)?;
            let node = store.sorted_mut(position)?;
            if node.num_input_connections() == 0 && !node.has_input_shape() {
                debug!(node = node.name(), "default input added");
                node.set_inputs(vec![Connection::Bound(previous)]);
            }
        }
        Ok(())
    }
}

/// Resolves every named edge to a node handle.
#[derive(Debug, Default)]
pub struct BindConnectionsPass;

impl RealizePass for BindConnectionsPass {
    fn name(&self) -> &'static str {
        "bind_connections"
    }

    fn run(&mut self, store: &mut GraphStore, _registry: &LayerRegistry) -> Result<()> {
        for position in 0..store.size() {
            let id = id_at(store, position)?;
            let node = store.node(id)?;
            if node.num_input_connections() == 0 && !node.has_input_shape() {
                return Err(GraphError::structural(format!(
                    "Node '{}' has no input connection and needs an input_shape",
                    node.name()
                )));
            }

            let mut bound = Vec::with_capacity(node.num_input_connections());
            let mut seen = HashSet::new();
            for connection in node.inputs() {
                let producer = match connection {
                    Connection::Bound(producer) => *producer,
                    Connection::Named(name) => store.id_of(name).ok_or_else(|| {
                        GraphError::structural(format!(
                            "Input '{name}' of node '{}' does not exist",
                            node.name()
                        ))
                    })?,
                };
                if !seen.insert(producer) {
                    return Err(GraphError::structural(format!(
                        "Node '{}' lists input '{}' more than once",
                        node.name(),
                        store.node(producer)?.name()
                    )));
                }
                bound.push(Connection::Bound(producer));
            }
            store.node_mut(id)?.set_inputs(bound);
        }
        Ok(())
    }
}

/// Splits `activation=<kind>` markers into standalone activation nodes.
#[derive(Debug, Default)]
pub struct ActivationRealizePass;

impl RealizePass for ActivationRealizePass {
    fn name(&self) -> &'static str {
        "activation_realize"
    }

    fn run(&mut self, store: &mut GraphStore, registry: &LayerRegistry) -> Result<()> {
        let mut position = 0;
        while position < store.size() {
            let source = id_at(store, position)?;
            position += 1;

            let node = store.node(source)?;
            let activation = node.activation_to_realize();
            if activation == ActivationType::None {
                continue;
            }
            if activation == ActivationType::Unknown {
                return Err(GraphError::configuration(format!(
                    "Cannot realize unknown activation on node '{}'",
                    node.name()
                )));
            }
            if node.layer_type() == ActivationLayer::TYPE {
                return Err(GraphError::configuration(format!(
                    "Activation node '{}' cannot realize another activation",
                    node.name()
                )));
            }
            let source_name = node.name().to_string();
            let distribute = node.distribute();

            let mut realized = LayerNode::new(registry.create_layer(ActivationLayer::TYPE)?);
            realized.set_property(&format!("activation={activation}"))?;
            store.ensure_name(&mut realized, &format!("{source_name}/"), "", false);
            realized.set_distribute(distribute);

            store
                .node_mut(source)?
                .set_activation_to_realize(ActivationType::None);
            // Edges are moved before the realized node joins the store.
            let target = store.next_id();
            store.update_connection(source, target);
            realized.set_inputs(vec![Connection::Bound(source)]);
            debug!(
                source = source_name.as_str(),
                node = realized.name(),
                "activation realized"
            );
            let added = store.add_node(realized, false)?;
            debug_assert_eq!(added, target);
        }
        Ok(())
    }
}

/// Derives every node's output list from the input lists.
#[derive(Debug, Default)]
pub struct OutputConnectionPass;

impl RealizePass for OutputConnectionPass {
    fn name(&self) -> &'static str {
        "output_connection"
    }

    fn run(&mut self, store: &mut GraphStore, _registry: &LayerRegistry) -> Result<()> {
        let ids = store.ids().to_vec();
        for consumer in ids {
            let producers = store.node(consumer)?.bound_inputs().collect::<Vec<_>>();
            for producer in producers {
                if producer != consumer {
                    store.node_mut(producer)?.add_output(consumer);
                }
            }
        }
        Ok(())
    }
}

/// Inserts a broadcast node behind every node feeding more than one consumer.
#[derive(Debug, Default)]
pub struct MultiOutRealizePass;

impl RealizePass for MultiOutRealizePass {
    fn name(&self) -> &'static str {
        "multiout_realize"
    }

    fn run(&mut self, store: &mut GraphStore, registry: &LayerRegistry) -> Result<()> {
        let mut position = 0;
        while position < store.size() {
            let source = id_at(store, position)?;
            position += 1;

            let node = store.node(source)?;
            if node.layer_type() == MultiOutLayer::TYPE || node.outputs().len() <= 1 {
                continue;
            }
            let source_name = node.name().to_string();
            let consumers = node.outputs().to_vec();

            let mut broadcast = LayerNode::new(registry.create_layer(MultiOutLayer::TYPE)?);
            store.ensure_name(&mut broadcast, &format!("{source_name}/"), "", false);
            broadcast.set_inputs(vec![Connection::Bound(source)]);
            broadcast.set_outputs(consumers);

            let target = store.next_id();
            store.node_mut(source)?.set_outputs(vec![target]);
            store.update_connection(source, target);
            debug!(
                source = source_name.as_str(),
                node = broadcast.name(),
                "multi-output realized"
            );
            let added = store.add_node(broadcast, false)?;
            debug_assert_eq!(added, target);
        }
        Ok(())
    }
}

/// Attaches the requested loss to every designated output that does not
/// already consume a label.
#[derive(Debug)]
pub struct LossRealizePass {
    pub loss_type: String,
}

impl LossRealizePass {
    pub fn new(loss_type: &str) -> Self {
        Self {
            loss_type: loss_type.trim().to_ascii_lowercase(),
        }
    }
}

impl RealizePass for LossRealizePass {
    fn name(&self) -> &'static str {
        "loss_realize"
    }

    fn run(&mut self, store: &mut GraphStore, registry: &LayerRegistry) -> Result<()> {
        if self.loss_type.is_empty() {
            return Ok(());
        }
        let fused = self.loss_type == CROSS_ENTROPY;

        for index in 0..store.designated_outputs().len() {
            let output = store.designated_outputs()[index];
            let node = store.node(output)?;
            if node.requires_label() {
                continue;
            }

            let (loss_type, predecessor) = if fused {
                if node.layer_type() != ActivationLayer::TYPE {
                    return Err(GraphError::configuration(format!(
                        "Cross entropy needs node '{}' to be a sigmoid or softmax activation",
                        node.name()
                    )));
                }
                let loss_type = match node.activation_type() {
                    Some(ActivationType::Sigmoid) => LossLayer::CROSS_SIGMOID,
                    Some(ActivationType::Softmax) => LossLayer::CROSS_SOFTMAX,
                    _ => {
                        return Err(GraphError::configuration(format!(
                            "Cross entropy is not supported after activation of node '{}'",
                            node.name()
                        )));
                    }
                };
                let predecessor = node.bound_inputs().next().ok_or_else(|| {
                    GraphError::structural(format!(
                        "Activation node '{}' has no bound input",
                        node.name()
                    ))
                })?;
                (loss_type, predecessor)
            } else {
                (self.loss_type.as_str(), output)
            };
            let output_name = node.name().to_string();

            let layer = registry.create_layer(loss_type)?;
            if !layer.requires_label() {
                return Err(GraphError::configuration(format!(
                    "Layer type '{loss_type}' is not a loss"
                )));
            }
            let mut loss = LayerNode::new(layer);
            store.ensure_name(&mut loss, "", "", false);
            loss.set_distribute(store.node(predecessor)?.distribute());
            loss.set_inputs(vec![Connection::Bound(predecessor)]);

            let loss_id = if fused {
                debug!(
                    replaced = output_name.as_str(),
                    node = loss.name(),
                    "fused loss realized"
                );
                store.replace_node(&output_name, loss)?
            } else {
                debug!(after = output_name.as_str(), node = loss.name(), "loss realized");
                store.add_node(loss, false)?
            };
            store.node_mut(predecessor)?.set_outputs(vec![loss_id]);
            store.replace_output_node(index, loss_id)?;
        }
        Ok(())
    }
}

/// Runs every rewrite pass in order and records the input/output roles.
pub fn realize(store: &mut GraphStore, registry: &LayerRegistry, loss_type: &str) -> Result<()> {
    let mut structural: [Box<dyn RealizePass>; 5] = [
        Box::new(DefaultInputPass),
        Box::new(BindConnectionsPass),
        Box::new(ActivationRealizePass),
        Box::new(OutputConnectionPass),
        Box::new(MultiOutRealizePass),
    ];
    for pass in &mut structural {
        debug!(pass = pass.name(), nodes = store.size(), "running realize pass");
        pass.run(store, registry)?;
    }
    store.realize_input_output_nodes();
    LossRealizePass::new(loss_type).run(store, registry)
}

fn id_at(store: &GraphStore, position: usize) -> Result<NodeId> {
    store
        .id_at(position)
        .ok_or_else(|| GraphError::structural(format!("No node at position {position}")))
}

#[cfg(test)]
mod tests {
    use crate::graph::realizer::{
        ActivationRealizePass, BindConnectionsPass, DefaultInputPass, MultiOutRealizePass,
        OutputConnectionPass, RealizePass, realize,
    };
    use crate::graph::{Connection, GraphStore, LayerNode};
    use crate::layers::{ActivationType, LayerRegistry};

    fn add(store: &mut GraphStore, registry: &LayerRegistry, layer_type: &str, props: &[&str]) {
        let layer = registry.create_layer(layer_type).expect("layer type");
        let node = LayerNode::with_properties(layer, props).expect("properties");
        store.add_node(node, true).expect("add should pass");
    }

    #[test]
    fn default_inputs_chain_unconnected_nodes() {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        add(&mut store, &registry, "input", &["name=in", "input_shape=1:1:4"]);
        add(&mut store, &registry, "fully_connected", &["name=fc", "unit=2"]);
        DefaultInputPass.run(&mut store, &registry).expect("pass");
        let input = store.id_of("in").expect("in");
        assert_eq!(
            store.get_node("fc").expect("fc").inputs(),
            &[Connection::Bound(input)]
        );
    }

    #[test]
    fn binding_rejects_missing_shape_unknown_names_and_duplicates() {
        let registry = LayerRegistry::with_defaults();

        let mut shapeless = GraphStore::new();
        add(&mut shapeless, &registry, "input", &["name=in"]);
        let err = BindConnectionsPass
            .run(&mut shapeless, &registry)
            .expect_err("no input_shape");
        assert!(err.is_structural());

        let mut dangling = GraphStore::new();
        add(&mut dangling, &registry, "input", &["name=in", "input_shape=4"]);
        add(&mut dangling, &registry, "flatten", &["name=f", "input_layers=ghost"]);
        assert!(
            BindConnectionsPass
                .run(&mut dangling, &registry)
                .expect_err("ghost")
                .is_structural()
        );

        let mut doubled = GraphStore::new();
        add(&mut doubled, &registry, "input", &["name=in", "input_shape=4"]);
        add(&mut doubled, &registry, "addition", &["name=sum", "input_layers=in,IN"]);
        assert!(
            BindConnectionsPass
                .run(&mut doubled, &registry)
                .expect_err("duplicate edge")
                .is_structural()
        );
    }

    #[test]
    fn activation_is_extracted_and_consumers_repointed() {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        add(&mut store, &registry, "input", &["name=in", "input_shape=4"]);
        add(
            &mut store,
            &registry,
            "fully_connected",
            &["name=fc", "unit=3", "activation=relu", "distribute=true"],
        );
        add(&mut store, &registry, "fully_connected", &["name=out", "unit=2", "input_layers=fc"]);
        DefaultInputPass.run(&mut store, &registry).expect("default inputs");
        BindConnectionsPass.run(&mut store, &registry).expect("binding");
        ActivationRealizePass
            .run(&mut store, &registry)
            .expect("activation realization");

        assert_eq!(store.size(), 4);
        let act = store.get_node("fc/activation").expect("realized node");
        assert_eq!(act.activation_type(), Some(ActivationType::Relu));
        assert!(act.distribute());
        let fc = store.id_of("fc").expect("fc");
        let act_id = store.id_of("fc/activation").expect("act");
        assert_eq!(act.inputs(), &[Connection::Bound(fc)]);
        assert_eq!(
            store.get_node("out").expect("out").inputs(),
            &[Connection::Bound(act_id)]
        );
        assert_eq!(
            store.get_node("fc").expect("fc").activation_to_realize(),
            ActivationType::None
        );
    }

    #[test]
    fn unknown_or_nested_activation_markers_fail() {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        add(&mut store, &registry, "input", &["name=in", "input_shape=4"]);
        add(&mut store, &registry, "fully_connected", &["name=fc", "unit=3", "activation=swishy"]);
        DefaultInputPass.run(&mut store, &registry).expect("default inputs");
        let err = ActivationRealizePass
            .run(&mut store, &registry)
            .expect_err("unknown activation");
        assert!(err.is_configuration());

        let mut nested = GraphStore::new();
        add(&mut nested, &registry, "activation", &["name=act", "activation=relu", "input_shape=4"]);
        nested
            .get_node_mut("act")
            .expect("act")
            .set_activation_to_realize(ActivationType::Sigmoid);
        let err = ActivationRealizePass
            .run(&mut nested, &registry)
            .expect_err("activation on activation");
        assert!(err.is_configuration());
    }

    #[test]
    fn fan_out_gets_one_broadcast_node() {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        add(&mut store, &registry, "input", &["name=in", "input_shape=4"]);
        add(&mut store, &registry, "flatten", &["name=a", "input_layers=in"]);
        add(&mut store, &registry, "flatten", &["name=b", "input_layers=in"]);
        add(&mut store, &registry, "addition", &["name=sum", "input_layers=a,b"]);
        DefaultInputPass.run(&mut store, &registry).expect("default inputs");
        BindConnectionsPass.run(&mut store, &registry).expect("binding");
        OutputConnectionPass.run(&mut store, &registry).expect("outputs");
        MultiOutRealizePass
            .run(&mut store, &registry)
            .expect("multi-output realization");

        assert_eq!(store.size(), 5);
        let broadcast = store.id_of("in/multiout").expect("broadcast node");
        let a = store.id_of("a").expect("a");
        let b = store.id_of("b").expect("b");
        assert_eq!(store.get_node("in").expect("in").outputs(), &[broadcast]);
        assert_eq!(store.node(broadcast).expect("node").outputs(), &[a, b]);
        assert_eq!(
            store.get_node("a").expect("a").inputs(),
            &[Connection::Bound(broadcast)]
        );
    }

    #[test]
    fn cross_entropy_needs_a_sigmoid_or_softmax_tail() {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        add(&mut store, &registry, "input", &["name=in", "input_shape=4"]);
        add(&mut store, &registry, "fully_connected", &["name=fc", "unit=3"]);
        let err = realize(&mut store, &registry, "cross").expect_err("no activation tail");
        assert!(err.is_configuration());

        let mut relu = GraphStore::new();
        add(&mut relu, &registry, "input", &["name=in", "input_shape=4"]);
        add(&mut relu, &registry, "fully_connected", &["name=fc", "unit=3", "activation=relu"]);
        let err = realize(&mut relu, &registry, "cross").expect_err("relu tail");
        assert!(err.is_configuration());
    }

    #[test]
    fn plain_losses_are_appended_and_unknown_losses_fail() {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        add(&mut store, &registry, "input", &["name=in", "input_shape=4"]);
        add(&mut store, &registry, "fully_connected", &["name=fc", "unit=3"]);
        realize(&mut store, &registry, "mse").expect("mse should realize");
        let loss = store.id_of("mse").expect("loss node");
        assert_eq!(store.position(loss), Some(2));
        assert_eq!(store.get_node("fc").expect("fc").outputs(), &[loss]);
        assert_eq!(store.designated_outputs(), &[loss]);

        let mut unknown = GraphStore::new();
        add(&mut unknown, &registry, "input", &["name=in", "input_shape=4"]);
        let err = realize(&mut unknown, &registry, "hinge").expect_err("unknown loss");
        assert!(err.is_configuration());

        let mut not_a_loss = GraphStore::new();
        add(&mut not_a_loss, &registry, "input", &["name=in", "input_shape=4"]);
        let err = realize(&mut not_a_loss, &registry, "flatten").expect_err("not a loss");
        assert!(err.is_configuration());
    }
}
