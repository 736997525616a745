//! Layer capability: the per-kind math a graph node delegates to.

mod activation;
mod addition;
mod context;
mod flatten;
mod fully_connected;
mod input;
mod loss;
mod multiout;
mod registry;

use std::fmt;

pub use activation::{ActivationLayer, ActivationType};
pub use addition::AdditionLayer;
pub use context::{InitContext, RunContext, RunLayerContext};
pub use flatten::FlattenLayer;
pub use fully_connected::FullyConnectedLayer;
pub use input::InputLayer;
pub use loss::{LossKind, LossLayer};
pub use multiout::MultiOutLayer;
pub use registry::{LayerFactory, LayerRegistry};

use crate::error::{GraphError, Result};

pub trait Layer: fmt::Debug {
    fn layer_type(&self) -> &'static str;

    /// Applies one `key=value` property the owning node did not consume.
    fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        let _ = value;
        Err(GraphError::configuration(format!(
            "Unknown property '{key}' for layer type '{}'",
            self.layer_type()
        )))
    }

    /// Declares output dims, weights and scratch tensors for the bound inputs.
    fn finalize(&mut self, context: &mut InitContext) -> Result<()>;

    fn forward(&mut self, context: &mut RunLayerContext<'_>, training: bool) -> Result<()>;

    /// Accumulates weight gradients. Layers without weights keep the default.
    fn calc_gradient(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let _ = context;
        Ok(())
    }

    /// Writes the derivative with respect to every input.
    fn calc_derivative(&mut self, context: &mut RunLayerContext<'_>) -> Result<()>;

    fn requires_label(&self) -> bool {
        false
    }

    fn supports_backwarding(&self) -> bool {
        true
    }

    /// The configured function of activation-kind layers.
    fn activation_type(&self) -> Option<ActivationType> {
        None
    }
}

pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(GraphError::configuration(format!(
            "Property '{key}' expects a boolean, got '{other}'"
        ))),
    }
}

pub(crate) fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|err| {
        GraphError::configuration(format!(
            "Property '{key}' expects an unsigned integer, got '{value}': {err}"
        ))
    })
}
