use assert_matches::assert_matches;
use layergraph::GraphError;
use layergraph::graph::{ExecutionOrder, NetworkGraph, execution_order};

fn compiled(nodes: &[(&str, &[&str])], loss: &str) -> NetworkGraph {
    let mut graph = NetworkGraph::new();
    for (layer_type, properties) in nodes {
        let node = graph
            .create_node(layer_type, properties)
            .expect("node should build");
        graph.add_layer(node).expect("add should pass");
    }
    graph.compile(loss).expect("compile should pass");
    graph
}

#[test]
fn compiled_nodes_carry_their_positional_keys() {
    let graph = compiled(
        &[
            ("input", &["name=in", "input_shape=1:1:6"]),
            ("fully_connected", &["name=a", "unit=4", "activation=relu"]),
            ("fully_connected", &["name=b", "unit=2", "activation=softmax"]),
        ],
        "cross",
    );

    // in, a, a/activation, b, cross_softmax
    let count = graph.size();
    assert_eq!(count, 5);
    for position in 0..count {
        let node = graph.sorted_node(position).expect("sorted node");
        assert_eq!(node.exec_order(), Some(execution_order(position, count)));
    }
    assert_eq!(
        graph.sorted_node(0).expect("first").exec_order(),
        Some(ExecutionOrder {
            forward: 0,
            gradient: 13,
            derivative: 14,
        })
    );
    assert_eq!(
        graph.sorted_node(4).expect("last").exec_order(),
        Some(ExecutionOrder {
            forward: 4,
            gradient: 5,
            derivative: 6,
        })
    );
}

#[test]
fn backward_keys_follow_every_forward_key() {
    let graph = compiled(
        &[
            ("input", &["name=in", "input_shape=4"]),
            ("fully_connected", &["name=a", "unit=4", "input_layers=in"]),
            ("fully_connected", &["name=b", "unit=4", "input_layers=in"]),
            ("addition", &["name=sum", "input_layers=a,b"]),
        ],
        "mse",
    );
    let last_forward = graph.size() - 1;
    for node in graph.store().iter() {
        let order = node.exec_order().expect("scheduled");
        assert!(order.gradient > last_forward);
        assert_eq!(order.derivative, order.gradient + 1);
    }
}

#[test]
fn independent_branches_keep_declaration_order() {
    let graph = compiled(
        &[
            ("input", &["name=left", "input_shape=2"]),
            ("input", &["name=right", "input_shape=2"]),
            ("addition", &["name=sum", "input_layers=right,left"]),
        ],
        "",
    );
    let names = graph
        .store()
        .iter()
        .map(|node| node.name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["left", "right", "sum"]);
}

#[test]
fn cycles_are_reported_with_their_members() {
    let mut graph = NetworkGraph::new();
    for (layer_type, properties) in [
        ("input", &["name=in", "input_shape=4"][..]),
        ("addition", &["name=a", "input_layers=in,b"][..]),
        ("flatten", &["name=b", "input_layers=a"][..]),
    ] {
        let node = graph
            .create_node(layer_type, properties)
            .expect("node should build");
        graph.add_layer(node).expect("add should pass");
    }
    let err = graph.compile("").expect_err("a and b form a cycle");
    assert_matches!(
        err,
        GraphError::Structural(message) if message.contains("cycle") && message.ends_with("a, b")
    );
    assert!(!graph.is_compiled());
}
