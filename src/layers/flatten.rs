use tracing::warn;

use crate::error::Result;
use crate::layers::{InitContext, Layer, RunLayerContext};
use crate::tensor::TensorDim;

#[derive(Debug, Clone, Default)]
pub struct FlattenLayer;

impl FlattenLayer {
    pub const TYPE: &'static str = "flatten";
}

impl Layer for FlattenLayer {
    fn layer_type(&self) -> &'static str {
        Self::TYPE
    }

    fn finalize(&mut self, context: &mut InitContext) -> Result<()> {
        context.expect_inputs(Self::TYPE, 1)?;
        let input = context.input_dims()[0];
        if input.channel() == 1 && input.height() == 1 {
            warn!(layer = context.name(), "flatten layer is redundant");
        }
        context.set_output_dims(vec![TensorDim::new(
            input.batch(),
            1,
            1,
            input.feature_len(),
        )]);
        Ok(())
    }

    fn forward(&mut self, context: &mut RunLayerContext<'_>, _training: bool) -> Result<()> {
        let dim = context.output_dim(0)?;
        let output = context.input(0)?.reshape(dim)?;
        context.set_output(0, output)
    }

    fn calc_derivative(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let dim = context.input(0)?.dim;
        let derivative = context.output_gradient(0)?.reshape(dim)?;
        context.set_input_gradient(0, derivative)
    }
}

#[cfg(test)]
mod tests {
    use crate::layers::{FlattenLayer, InitContext, Layer};
    use crate::tensor::TensorDim;

    #[test]
    fn collapses_feature_axes_into_width() {
        let mut layer = FlattenLayer;
        let mut context = InitContext::new("flat", vec![TensorDim::new(2, 3, 4, 5)], 1, true);
        layer.finalize(&mut context).expect("finalize should pass");
        assert_eq!(context.output_dims(), &[TensorDim::new(2, 1, 1, 60)]);
    }
}
