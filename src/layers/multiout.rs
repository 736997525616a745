use crate::error::Result;
use crate::layers::{InitContext, Layer, RunLayerContext};

/// Broadcasts one input to one output per consumer and sums the gradients
/// coming back.
#[derive(Debug, Clone, Default)]
pub struct MultiOutLayer;

impl MultiOutLayer {
    pub const TYPE: &'static str = "multiout";
}

impl Layer for MultiOutLayer {
    fn layer_type(&self) -> &'static str {
        Self::TYPE
    }

    fn finalize(&mut self, context: &mut InitContext) -> Result<()> {
        context.expect_inputs(Self::TYPE, 1)?;
        let dim = context.input_dims()[0];
        let count = context.num_requested_outputs();
        context.set_output_dims(vec![dim; count]);
        Ok(())
    }

    fn forward(&mut self, context: &mut RunLayerContext<'_>, _training: bool) -> Result<()> {
        let input = context.input(0)?.clone();
        for index in 0..context.num_outputs() {
            context.set_output(index, input.clone())?;
        }
        Ok(())
    }

    fn calc_derivative(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let mut total = context.output_gradient(0)?.clone();
        for index in 1..context.num_outputs() {
            total = total.add(context.output_gradient(index)?)?;
        }
        context.set_input_gradient(0, total)
    }
}
