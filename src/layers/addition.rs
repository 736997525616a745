use crate::error::{GraphError, Result};
use crate::layers::{InitContext, Layer, RunLayerContext};

/// Element-wise sum of any number of equally shaped inputs.
#[derive(Debug, Clone, Default)]
pub struct AdditionLayer;

impl AdditionLayer {
    pub const TYPE: &'static str = "addition";
}

impl Layer for AdditionLayer {
    fn layer_type(&self) -> &'static str {
        Self::TYPE
    }

    fn finalize(&mut self, context: &mut InitContext) -> Result<()> {
        let Some(first) = context.input_dims().first().copied() else {
            return Err(GraphError::structural(format!(
                "Layer '{}' of type '{}' needs at least one input",
                context.name(),
                Self::TYPE
            )));
        };
        if let Some(other) = context.input_dims().iter().find(|dim| **dim != first) {
            return Err(GraphError::structural(format!(
                "Layer '{}' adds inputs of different dims: {first} vs {other}",
                context.name()
            )));
        }
        context.set_output_dims(vec![first]);
        Ok(())
    }

    fn forward(&mut self, context: &mut RunLayerContext<'_>, _training: bool) -> Result<()> {
        let mut total = context.input(0)?.clone();
        for index in 1..context.num_inputs() {
            total = total.add(context.input(index)?)?;
        }
        context.set_output(0, total)
    }

    fn calc_derivative(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let incoming = context.output_gradient(0)?.clone();
        for index in 0..context.num_inputs() {
            context.set_input_gradient(index, incoming.clone())?;
        }
        Ok(())
    }
}
