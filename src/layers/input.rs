use crate::error::Result;
use crate::layers::{InitContext, Layer, RunLayerContext};

/// Entry point of externally fed data. Passes its input through unchanged.
#[derive(Debug, Clone, Default)]
pub struct InputLayer;

impl InputLayer {
    pub const TYPE: &'static str = "input";
}

impl Layer for InputLayer {
    fn layer_type(&self) -> &'static str {
        Self::TYPE
    }

    fn finalize(&mut self, context: &mut InitContext) -> Result<()> {
        context.expect_inputs(Self::TYPE, 1)?;
        let dims = context.input_dims().to_vec();
        context.set_output_dims(dims);
        Ok(())
    }

    fn forward(&mut self, context: &mut RunLayerContext<'_>, _training: bool) -> Result<()> {
        let input = context.input(0)?.clone();
        context.set_output(0, input)
    }

    fn calc_derivative(&mut self, _context: &mut RunLayerContext<'_>) -> Result<()> {
        Ok(())
    }

    fn supports_backwarding(&self) -> bool {
        false
    }
}
