use itertools::Itertools;

use crate::graph::{GraphStore, LayerNode, NodeId};

/// One line per node in sequence order:
/// `name (type) <- inputs -> outputs [dims]`.
pub fn print_graph(store: &GraphStore) -> String {
    store
        .iter()
        .map(|node| format_node(store, node))
        .join("\n")
}

fn format_node(store: &GraphStore, node: &LayerNode) -> String {
    let inputs = join_names(store, node.bound_inputs());
    let outputs = join_names(store, node.outputs().iter().copied());
    let mut line = format!("{} ({})", node.name(), node.layer_type());
    if !inputs.is_empty() {
        line.push_str(&format!(" <- {inputs}"));
    }
    if !outputs.is_empty() {
        line.push_str(&format!(" -> {outputs}"));
    }
    if !node.output_dims().is_empty() {
        line.push_str(&format!(" [{}]", node.output_dims().iter().join(", ")));
    }
    line
}

fn join_names(store: &GraphStore, ids: impl Iterator<Item = NodeId>) -> String {
    ids.filter_map(|id| store.node(id).ok())
        .map(LayerNode::name)
        .join(", ")
}

#[cfg(test)]
mod tests {
    use crate::graph::{Connection, GraphStore, LayerNode, print_graph};
    use crate::layers::LayerRegistry;

    #[test]
    fn prints_wiring_per_node() {
        let registry = LayerRegistry::with_defaults();
        let mut store = GraphStore::new();
        let mut input = LayerNode::new(registry.create_layer("input").expect("input"));
        input.set_name("in");
        let input = store.add_node(input, false).expect("in");
        let mut flatten = LayerNode::new(registry.create_layer("flatten").expect("flatten"));
        flatten.set_name("flat");
        flatten.set_inputs(vec![Connection::Bound(input)]);
        let flat = store.add_node(flatten, false).expect("flat");
        store.node_mut(input).expect("in").add_output(flat);

        assert_eq!(
            print_graph(&store),
            "in (input) -> flat\nflat (flatten) <- in"
        );
    }
}
