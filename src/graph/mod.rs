pub mod binder;
pub mod exec_order;
pub mod network;
pub mod node;
pub mod printer;
pub mod realizer;
pub mod store;
pub mod verifier;

pub use binder::finalize_context;
pub use exec_order::{ExecutionOrder, assign_execution_order, execution_order};
pub use network::NetworkGraph;
pub use node::{Connection, LayerNode, NodeId};
pub use printer::print_graph;
pub use realizer::{CROSS_ENTROPY, RealizePass, realize};
pub use store::GraphStore;
pub use verifier::{verify_graph, verify_with_policy};
