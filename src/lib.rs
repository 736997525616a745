//! # layergraph
//!
//! Compiles a loosely declared layer graph into a resolved, ordered and
//! scheduled computation graph, then drives forward and backward passes
//! against storage owned by a tensor manager.
//!
//! ## Pipeline
//!
//! ```text
//! LayerNode declarations (key=value properties)
//!    │
//!    ▼  graph::realizer::realize
//! Default edges, bound connections, activations, fan-out, loss
//!    │
//!    ▼  graph::GraphStore::topological_sort
//! Sorted sequence + execution keys + verification
//!    │
//!    ▼  graph::finalize_context (per node, in order)
//! Run contexts bound to tensor handles
//!    │
//!    ▼  graph::NetworkGraph::{forward, backward}
//! Outputs, gradients, optimizer updates
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use layergraph::graph::NetworkGraph;
//!
//! let mut graph = NetworkGraph::new();
//! let input = graph.create_node("input", &["name=in", "input_shape=1:1:4"]).unwrap();
//! let dense = graph
//!     .create_node("fully_connected", &["unit=3", "activation=softmax"])
//!     .unwrap();
//! graph.add_layer(input).unwrap();
//! graph.add_layer(dense).unwrap();
//! graph.compile("cross").unwrap();
//! graph.initialize(&[], &[]).unwrap();
//! println!("{}", graph.summary());
//! ```

#![allow(
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc,
    clippy::float_cmp,
    clippy::doc_markdown
)]

pub mod error;
pub mod flags;
pub mod graph;
pub mod layers;
pub mod model;
pub mod optimizer;
pub mod tensor;

pub use error::{GraphError, Result};
pub use flags::GraphFlags;
pub use graph::{GraphStore, LayerNode, NetworkGraph, NodeId};
pub use model::{ModelConfig, NeuralNetwork};
