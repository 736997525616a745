use itertools::Itertools;

use crate::error::{GraphError, Result};
use crate::flags::GraphFlags;
use crate::graph::{Connection, GraphStore, execution_order};

/// Structural checks on a sorted graph: unique names, every edge bound to an
/// earlier position, input and output lists mirroring each other, and
/// execution keys matching the sorted positions.
pub fn verify_graph(store: &GraphStore) -> Result<()> {
    if !store.is_sorted() {
        return Err(err("Graph must be sorted before verification"));
    }

    if let Some(duplicate) = store
        .iter()
        .map(|node| node.name().to_ascii_lowercase())
        .duplicates()
        .next()
    {
        return Err(err(format!("Node name '{duplicate}' appears more than once")));
    }

    let count = store.size();
    for (position, id) in store.ids().iter().enumerate() {
        let node = store.node(*id)?;
        if node.num_input_connections() == 0 && !node.has_input_shape() {
            return Err(err(format!(
                "Input node '{}' has no static input shape",
                node.name()
            )));
        }

        for connection in node.inputs() {
            let Connection::Bound(producer) = connection else {
                return Err(err(format!(
                    "Node '{}' still has an unresolved input",
                    node.name()
                )));
            };
            let producer_position = store.position(*producer).unwrap_or(usize::MAX);
            if producer_position >= position {
                return Err(err(format!(
                    "Node '{}' at position {position} reads from a node placed at or after it",
                    node.name()
                )));
            }
            if !store.node(*producer)?.outputs().contains(id) {
                return Err(err(format!(
                    "Node '{}' reads from '{}', which does not list it as an output",
                    node.name(),
                    store.node(*producer)?.name()
                )));
            }
        }

        for consumer in node.outputs() {
            let reads_back = store.node(*consumer)?.bound_inputs().contains(id);
            if !reads_back {
                return Err(err(format!(
                    "Node '{}' lists '{}' as an output, which does not read from it",
                    node.name(),
                    store.node(*consumer)?.name()
                )));
            }
        }

        if node.exec_order() != Some(execution_order(position, count)) {
            return Err(err(format!(
                "Node '{}' carries execution keys that do not match position {position}",
                node.name()
            )));
        }
    }
    Ok(())
}

/// Runs [`verify_graph`] when the strict flag is on.
pub fn verify_with_policy(store: &GraphStore, flags: &GraphFlags) -> Result<()> {
    if !flags.strict {
        return Ok(());
    }
    verify_graph(store)
}

fn err(message: impl Into<String>) -> GraphError {
    GraphError::structural(message)
}
