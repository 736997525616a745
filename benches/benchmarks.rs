//! Benchmarks for the layergraph pipeline.
//!
//! Run with:
//! ```sh
//! cargo bench
//! ```
//!
//! Each benchmark covers one phase so that regressions can be attributed to
//! a specific component (realization and sort, binding, or execution).

use layergraph::graph::NetworkGraph;
use layergraph::optimizer::Sgd;
use layergraph::tensor::{Tensor, TensorDim};

const WIDTH: usize = 32;
const DEPTH: usize = 8;
const BATCH: usize = 16;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn declare() -> NetworkGraph {
    let mut graph = NetworkGraph::new().with_seed(1);
    let input = graph
        .create_node("input", &["name=in".to_string(), format!("input_shape=1:1:{WIDTH}")])
        .expect("input node");
    graph.add_layer(input).expect("add input");
    for depth in 0..DEPTH {
        let activation = if depth + 1 == DEPTH { "softmax" } else { "relu" };
        let dense = graph
            .create_node(
                "fully_connected",
                &[format!("unit={WIDTH}"), format!("activation={activation}")],
            )
            .expect("dense node");
        graph.add_layer(dense).expect("add dense");
    }
    graph
}

fn compiled() -> NetworkGraph {
    let mut graph = declare();
    graph.compile("cross").expect("compile failed");
    graph
}

fn ready() -> NetworkGraph {
    let mut graph = compiled();
    graph.set_batch_size(BATCH).expect("batch");
    graph.initialize(&[], &[]).expect("initialize failed");
    graph.allocate_weights().expect("weights");
    graph.allocate_tensors().expect("tensors");
    let input = Tensor::filled(TensorDim::new(BATCH, 1, 1, WIDTH), 0.5);
    let label = Tensor::filled(TensorDim::new(BATCH, 1, 1, WIDTH), 1.0 / WIDTH as f32);
    graph.set_inputs_labels(&[input], &[label]).expect("feed");
    graph
}

fn time_bench(label: &str, iters: u32, mut f: impl FnMut()) {
    let start = std::time::Instant::now();
    for _ in 0..iters {
        f();
    }
    println!("{} ×{}: {:?} avg", label, iters, start.elapsed() / iters);
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() {
    time_bench("compile (dense x8)", 1_000, || {
        let _ = compiled();
    });

    time_bench("initialize (dense x8)", 1_000, || {
        let mut graph = compiled();
        graph.initialize(&[], &[]).expect("initialize failed");
    });

    let mut graph = ready();
    time_bench("forward (batch 16)", 1_000, || {
        graph.forward(true).expect("forward failed");
    });

    let mut optimizer = Sgd::new(0.01);
    let mut iteration = 0;
    time_bench("forward+backward (batch 16)", 1_000, || {
        graph.forward(true).expect("forward failed");
        graph
            .backward(iteration, &mut optimizer, false)
            .expect("backward failed");
        iteration += 1;
    });
}
