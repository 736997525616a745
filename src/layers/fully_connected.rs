use crate::error::{GraphError, Result};
use crate::layers::{InitContext, Layer, RunLayerContext, parse_bool, parse_usize};
use crate::tensor::{Initializer, Regularizer, Tensor, TensorDim, WeightSpec};

const WEIGHT_IDX: usize = 0;
const BIAS_IDX: usize = 1;

/// Dense layer over the width axis: `y = x W + b`.
#[derive(Debug, Clone)]
pub struct FullyConnectedLayer {
    unit: usize,
    disable_bias: bool,
    initializer: Initializer,
    regularizer: Regularizer,
}

impl Default for FullyConnectedLayer {
    fn default() -> Self {
        Self {
            unit: 0,
            disable_bias: false,
            initializer: Initializer::XavierUniform,
            regularizer: Regularizer::None,
        }
    }
}

impl FullyConnectedLayer {
    pub const TYPE: &'static str = "fully_connected";

    #[must_use]
    pub fn new(unit: usize) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }
}

impl Layer for FullyConnectedLayer {
    fn layer_type(&self) -> &'static str {
        Self::TYPE
    }

    fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "unit" => self.unit = parse_usize(key, value)?,
            "disable_bias" => self.disable_bias = parse_bool(key, value)?,
            "weight_initializer" => {
                self.initializer = match value.trim().to_ascii_lowercase().as_str() {
                    "zeros" => Initializer::Zeros,
                    "ones" => Initializer::Ones,
                    "xavier_uniform" => Initializer::XavierUniform,
                    other => {
                        return Err(GraphError::configuration(format!(
                            "Unknown weight initializer '{other}'"
                        )));
                    }
                }
            }
            "weight_regularizer" => {
                self.regularizer = match value.trim().to_ascii_lowercase().as_str() {
                    "none" => Regularizer::None,
                    "l2norm" | "l2" => Regularizer::L2 { decay: 0.0 },
                    other => {
                        return Err(GraphError::configuration(format!(
                            "Unknown weight regularizer '{other}'"
                        )));
                    }
                }
            }
            "weight_regularizer_constant" => {
                let decay = value.trim().parse::<f32>().map_err(|err| {
                    GraphError::configuration(format!(
                        "Property '{key}' expects a float, got '{value}': {err}"
                    ))
                })?;
                self.regularizer = Regularizer::L2 { decay };
            }
            _ => {
                return Err(GraphError::configuration(format!(
                    "Unknown property '{key}' for layer type '{}'",
                    Self::TYPE
                )));
            }
        }
        Ok(())
    }

    fn finalize(&mut self, context: &mut InitContext) -> Result<()> {
        context.expect_inputs(Self::TYPE, 1)?;
        if self.unit == 0 {
            return Err(GraphError::configuration(format!(
                "Layer '{}' needs a positive 'unit' property",
                context.name()
            )));
        }
        let input = context.input_dims()[0];
        context.set_output_dims(vec![TensorDim::new(
            input.batch(),
            input.channel(),
            input.height(),
            self.unit,
        )]);
        context.request_weight(WeightSpec {
            name: "weight".to_string(),
            dim: TensorDim::new(1, 1, input.width(), self.unit),
            initializer: self.initializer,
            regularizer: self.regularizer,
            need_gradient: true,
        });
        if !self.disable_bias {
            context.request_weight(WeightSpec {
                name: "bias".to_string(),
                dim: TensorDim::vector(self.unit),
                initializer: Initializer::Zeros,
                regularizer: Regularizer::None,
                need_gradient: true,
            });
        }
        Ok(())
    }

    fn forward(&mut self, context: &mut RunLayerContext<'_>, _training: bool) -> Result<()> {
        let dim = context.output_dim(0)?;
        let mut output = context
            .input(0)?
            .dot(context.weight(WEIGHT_IDX)?, false, false)?
            .reshape(dim)?;
        if !self.disable_bias {
            let bias = context.weight(BIAS_IDX)?;
            for row in output.data.chunks_mut(self.unit) {
                for (value, b) in row.iter_mut().zip(&bias.data) {
                    *value += *b;
                }
            }
        }
        context.set_output(0, output)
    }

    fn calc_gradient(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let incoming = context.output_gradient(0)?;
        let weight_delta = context.input(0)?.dot(incoming, true, false)?;
        let bias_delta = (!self.disable_bias).then(|| incoming.sum_rows());
        context.add_weight_gradient(WEIGHT_IDX, &weight_delta)?;
        if let Some(bias_delta) = bias_delta {
            context.add_weight_gradient(BIAS_IDX, &bias_delta)?;
        }
        Ok(())
    }

    fn calc_derivative(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let dim = context.input(0)?.dim;
        let derivative = context
            .output_gradient(0)?
            .dot(context.weight(WEIGHT_IDX)?, false, true)?
            .reshape(dim)?;
        context.set_input_gradient(0, derivative)
    }
}
