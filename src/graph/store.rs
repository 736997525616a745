use std::collections::{BTreeSet, HashMap};

use crate::error::{GraphError, Result};
use crate::graph::{Connection, LayerNode, NodeId};

/// Ordered node container. Nodes live in an arena indexed by [`NodeId`] and
/// are never removed; `order` is the current sequence over that arena.
#[derive(Debug, Default)]
pub struct GraphStore {
    nodes: Vec<LayerNode>,
    order: Vec<NodeId>,
    positions: Vec<usize>,
    names: HashMap<String, NodeId>,
    input_nodes: Vec<NodeId>,
    output_nodes: Vec<NodeId>,
    sorted: bool,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl GraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Handle the next appended node will receive.
    pub fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len())
    }

    /// Appends `node`. With `resolve_name` a clashing name is disambiguated;
    /// without it the name must already be unique. Unnamed nodes are always
    /// given a generated name.
    pub fn add_node(&mut self, mut node: LayerNode, resolve_name: bool) -> Result<NodeId> {
        if resolve_name || node.name().is_empty() {
            self.ensure_name(&mut node, "", "", false);
        }
        if self.verify_node(node.name()) {
            return Err(GraphError::structural(format!(
                "Node name '{}' is already in use",
                node.name()
            )));
        }
        let id = NodeId(self.nodes.len());
        self.names.insert(key(node.name()), id);
        self.nodes.push(node);
        self.positions.push(self.order.len());
        self.order.push(id);
        self.sorted = false;
        Ok(id)
    }

    /// Gives `node` a name unique within the store. Unnamed nodes become
    /// `<prefix><layer type><postfix>`; named nodes keep their name unless it
    /// clashes or `force_rename` is set, in which case the prefix and postfix
    /// are applied. A `_<k>` suffix with the smallest free `k` breaks any
    /// remaining clash.
    pub fn ensure_name(
        &self,
        node: &mut LayerNode,
        prefix: &str,
        postfix: &str,
        force_rename: bool,
    ) {
        let original = node.name().to_string();
        if !original.is_empty() && !force_rename && !self.verify_node(&original) {
            return;
        }
        let base = if original.is_empty() {
            format!("{prefix}{}{postfix}", node.layer_type())
        } else {
            format!("{prefix}{original}{postfix}")
        };
        if !self.verify_node(&base) {
            node.set_name(base);
            return;
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{base}_{suffix}");
            if !self.verify_node(&candidate) {
                node.set_name(candidate);
                return;
            }
            suffix += 1;
        }
    }

    /// Swaps the node named `old_name` for `node`, keeping its slot and
    /// sequence position.
    pub fn replace_node(&mut self, old_name: &str, node: LayerNode) -> Result<NodeId> {
        let id = self.id_of(old_name).ok_or_else(|| {
            GraphError::structural(format!("Cannot replace missing node '{old_name}'"))
        })?;
        if !node.name().eq_ignore_ascii_case(old_name) && self.verify_node(node.name()) {
            return Err(GraphError::structural(format!(
                "Node name '{}' is already in use",
                node.name()
            )));
        }
        self.names.remove(&key(old_name));
        self.names.insert(key(node.name()), id);
        self.nodes[id.0] = node;
        Ok(id)
    }

    /// Case-insensitive existence check.
    pub fn verify_node(&self, name: &str) -> bool {
        self.names.contains_key(&key(name))
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.names.get(&key(name)).copied()
    }

    pub fn get_node(&self, name: &str) -> Result<&LayerNode> {
        let id = self.id_of(name).ok_or_else(|| missing(name))?;
        Ok(&self.nodes[id.0])
    }

    pub fn get_node_mut(&mut self, name: &str) -> Result<&mut LayerNode> {
        let id = self.id_of(name).ok_or_else(|| missing(name))?;
        Ok(&mut self.nodes[id.0])
    }

    pub fn node(&self, id: NodeId) -> Result<&LayerNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| GraphError::structural(format!("Node handle {} is not registered", id.0)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut LayerNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| GraphError::structural(format!("Node handle {} is not registered", id.0)))
    }

    /// Sequence position of `id`.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.positions.get(id.0).copied()
    }

    pub fn id_at(&self, position: usize) -> Option<NodeId> {
        self.order.get(position).copied()
    }

    pub fn sorted(&self, position: usize) -> Result<&LayerNode> {
        let id = self.id_at(position).ok_or_else(|| {
            GraphError::structural(format!("No node at sorted position {position}"))
        })?;
        self.node(id)
    }

    pub fn sorted_mut(&mut self, position: usize) -> Result<&mut LayerNode> {
        let id = self.id_at(position).ok_or_else(|| {
            GraphError::structural(format!("No node at sorted position {position}"))
        })?;
        self.node_mut(id)
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LayerNode> + '_ {
        self.order.iter().map(|id| &self.nodes[id.0])
    }

    /// Repoints every bound edge from `from` to `to`, skipping `to` itself.
    pub fn update_connection(&mut self, from: NodeId, to: NodeId) {
        for id in &self.order {
            if *id != to {
                self.nodes[id.0].repoint_input(from, to);
            }
        }
    }

    /// Nodes with no input connection at call time.
    pub fn input_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.nodes[id.0].num_input_connections() == 0)
            .collect()
    }

    /// Nodes with no output connection at call time.
    pub fn output_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.nodes[id.0].outputs().is_empty())
            .collect()
    }

    /// Records the current input and output roles.
    pub fn realize_input_output_nodes(&mut self) {
        self.input_nodes = self.input_nodes();
        self.output_nodes = self.output_nodes();
    }

    pub fn designated_inputs(&self) -> &[NodeId] {
        &self.input_nodes
    }

    pub fn designated_outputs(&self) -> &[NodeId] {
        &self.output_nodes
    }

    pub fn replace_output_node(&mut self, index: usize, id: NodeId) -> Result<()> {
        let slot = self.output_nodes.get_mut(index).ok_or_else(|| {
            GraphError::structural(format!("No designated output node at index {index}"))
        })?;
        *slot = id;
        Ok(())
    }

    /// Kahn sort over bound input edges. Among ready nodes the one earliest
    /// in the current sequence is placed first, so independent nodes keep
    /// their insertion order.
    pub fn topological_sort(&mut self) -> Result<()> {
        let count = self.order.len();
        let mut indegree = vec![0usize; count];
        let mut successors = vec![Vec::<usize>::new(); count];

        for (position, id) in self.order.iter().enumerate() {
            let node = &self.nodes[id.0];
            for connection in node.inputs() {
                let producer = match connection {
                    Connection::Bound(producer) => *producer,
                    Connection::Named(name) => {
                        return Err(GraphError::structural(format!(
                            "Cannot sort: input '{name}' of node '{}' is unresolved",
                            node.name()
                        )));
                    }
                };
                let Some(producer_position) = self.position(producer) else {
                    return Err(GraphError::structural(format!(
                        "Cannot sort: node '{}' depends on unknown handle {}",
                        node.name(),
                        producer.0
                    )));
                };
                successors[producer_position].push(position);
                indegree[position] += 1;
            }
        }

        let mut ready = (0..count)
            .filter(|position| indegree[*position] == 0)
            .collect::<BTreeSet<_>>();
        let mut ordered = Vec::with_capacity(count);
        while let Some(position) = ready.pop_first() {
            ordered.push(self.order[position]);
            for next in &successors[position] {
                indegree[*next] -= 1;
                if indegree[*next] == 0 {
                    ready.insert(*next);
                }
            }
        }

        if ordered.len() != count {
            let unplaced = (0..count)
                .filter(|position| indegree[*position] > 0)
                .map(|position| self.nodes[self.order[position].0].name().to_string())
                .collect::<Vec<_>>();
            return Err(GraphError::structural(format!(
                "Graph contains a cycle through: {}",
                unplaced.join(", ")
            )));
        }

        self.order = ordered;
        for (position, id) in self.order.iter().enumerate() {
            self.positions[id.0] = position;
        }
        self.sorted = true;
        Ok(())
    }
}

fn missing(name: &str) -> GraphError {
    GraphError::structural(format!("Node '{name}' does not exist"))
}

#[cfg(test)]
mod tests {
    use crate::graph::{Connection, GraphStore, LayerNode, NodeId};
    use crate::layers::LayerRegistry;

    fn node(layer_type: &str, name: &str) -> LayerNode {
        let layer = LayerRegistry::with_defaults()
            .create_layer(layer_type)
            .expect("layer type should exist");
        let mut node = LayerNode::new(layer);
        node.set_name(name);
        node
    }

    #[test]
    fn resolves_clashing_names_with_suffixes() {
        let mut store = GraphStore::new();
        store.add_node(node("input", "in"), true).expect("first node");
        let second = store.add_node(node("input", "IN"), true).expect("second node");
        assert_eq!(store.node(second).expect("node").name(), "IN_1");
        let unnamed = store.add_node(node("flatten", ""), false).expect("unnamed");
        assert_eq!(store.node(unnamed).expect("node").name(), "flatten");

        let err = store
            .add_node(node("input", "in"), false)
            .expect_err("duplicate without resolution");
        assert!(err.is_structural());
    }

    #[test]
    fn ensure_name_applies_prefix_on_force() {
        let mut store = GraphStore::new();
        store.add_node(node("input", "x"), false).expect("node");
        let mut fresh = node("input", "x");
        store.ensure_name(&mut fresh, "backbone/", "", true);
        assert_eq!(fresh.name(), "backbone/x");
        let mut synthesized = node("activation", "");
        store.ensure_name(&mut synthesized, "x/", "", false);
        assert_eq!(synthesized.name(), "x/activation");
    }

    #[test]
    fn replace_keeps_slot_and_position() {
        let mut store = GraphStore::new();
        store.add_node(node("input", "a"), false).expect("a");
        let b = store.add_node(node("flatten", "b"), false).expect("b");
        let replaced = store
            .replace_node("b", node("activation", "c"))
            .expect("replace should pass");
        assert_eq!(replaced, b);
        assert_eq!(store.position(replaced), Some(1));
        assert!(!store.verify_node("b"));
        assert_eq!(store.get_node("C").expect("c").layer_type(), "activation");
    }

    #[test]
    fn sort_places_producers_first_and_keeps_ties_stable() {
        let mut store = GraphStore::new();
        let tail = store.add_node(node("flatten", "tail"), false).expect("tail");
        let head = store.add_node(node("input", "head"), false).expect("head");
        let side = store.add_node(node("input", "side"), false).expect("side");
        store
            .node_mut(tail)
            .expect("tail")
            .set_inputs(vec![Connection::Bound(head)]);

        store.topological_sort().expect("sort should pass");
        assert_eq!(store.ids(), &[head, side, tail]);
        assert_eq!(store.position(tail), Some(2));
    }

    #[test]
    fn sort_reports_cycles_and_unbound_edges() {
        let mut store = GraphStore::new();
        let a = store.add_node(node("flatten", "a"), false).expect("a");
        let b = store.add_node(node("flatten", "b"), false).expect("b");
        store
            .node_mut(a)
            .expect("a")
            .set_inputs(vec![Connection::Bound(b)]);
        store
            .node_mut(b)
            .expect("b")
            .set_inputs(vec![Connection::Bound(a)]);
        let err = store.topological_sort().expect_err("cycle");
        assert!(err.to_string().contains("a, b"));

        let mut unbound = GraphStore::new();
        let c = unbound.add_node(node("flatten", "c"), false).expect("c");
        unbound
            .node_mut(c)
            .expect("c")
            .set_inputs(vec![Connection::Named("ghost".to_string())]);
        assert!(unbound.topological_sort().expect_err("unbound").is_structural());
        assert_eq!(c, NodeId(0));
    }
}
