use std::fmt;
use std::str::FromStr;

use crate::error::{GraphError, Result};
use crate::layers::{InitContext, Layer, RunLayerContext};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActivationType {
    #[default]
    None,
    Tanh,
    Sigmoid,
    Softmax,
    Relu,
    Unknown,
}

impl ActivationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
            Self::Softmax => "softmax",
            Self::Relu => "relu",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActivationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised names parse to [`ActivationType::Unknown`]; rejecting them is
/// left to whoever has to realize the activation.
impl FromStr for ActivationType {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Self::None,
            "tanh" => Self::Tanh,
            "sigmoid" => Self::Sigmoid,
            "softmax" => Self::Softmax,
            "relu" => Self::Relu,
            _ => Self::Unknown,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivationLayer {
    activation: ActivationType,
}

impl ActivationLayer {
    pub const TYPE: &'static str = "activation";

    #[must_use]
    pub fn new(activation: ActivationType) -> Self {
        Self { activation }
    }
}

impl Layer for ActivationLayer {
    fn layer_type(&self) -> &'static str {
        Self::TYPE
    }

    fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        if key != "activation" {
            return Err(GraphError::configuration(format!(
                "Unknown property '{key}' for layer type '{}'",
                Self::TYPE
            )));
        }
        let Ok(activation) = value.parse::<ActivationType>();
        if activation == ActivationType::Unknown {
            return Err(GraphError::configuration(format!(
                "Unsupported activation '{value}'"
            )));
        }
        self.activation = activation;
        Ok(())
    }

    fn finalize(&mut self, context: &mut InitContext) -> Result<()> {
        context.expect_inputs(Self::TYPE, 1)?;
        let dims = context.input_dims().to_vec();
        context.set_output_dims(dims);
        Ok(())
    }

    fn forward(&mut self, context: &mut RunLayerContext<'_>, _training: bool) -> Result<()> {
        let input = context.input(0)?;
        let output = match self.activation {
            ActivationType::None => input.clone(),
            ActivationType::Tanh => input.tanh(),
            ActivationType::Sigmoid => input.sigmoid(),
            ActivationType::Softmax => input.softmax(),
            ActivationType::Relu => input.relu(),
            ActivationType::Unknown => {
                return Err(GraphError::configuration(format!(
                    "Activation of '{}' is unknown",
                    context.name()
                )));
            }
        };
        context.set_output(0, output)
    }

    fn calc_derivative(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let output = context.output(0)?;
        let incoming = context.output_gradient(0)?;
        let derivative = match self.activation {
            ActivationType::None => incoming.clone(),
            ActivationType::Tanh => {
                incoming.multiply(&output.apply(|value| 1.0 - value * value))?
            }
            ActivationType::Sigmoid => {
                incoming.multiply(&output.apply(|value| value * (1.0 - value)))?
            }
            ActivationType::Relu => {
                incoming.multiply(&output.apply(|value| if value > 0.0 { 1.0 } else { 0.0 }))?
            }
            ActivationType::Softmax => softmax_derivative(output, incoming)?,
            ActivationType::Unknown => {
                return Err(GraphError::configuration(format!(
                    "Activation of '{}' is unknown",
                    context.name()
                )));
            }
        };
        context.set_input_gradient(0, derivative)
    }

    fn activation_type(&self) -> Option<ActivationType> {
        Some(self.activation)
    }
}

/// `dx_i = y_i * (dy_i - sum_j dy_j * y_j)` per row.
fn softmax_derivative(output: &Tensor, incoming: &Tensor) -> Result<Tensor> {
    let weighted = incoming.multiply(output)?;
    let width = output.dim.width().max(1);
    let mut data = Vec::with_capacity(output.len());
    for ((y, dy), yd) in output
        .data
        .chunks(width)
        .zip(incoming.data.chunks(width))
        .zip(weighted.data.chunks(width))
    {
        let dot: f32 = yd.iter().sum();
        data.extend(y.iter().zip(dy).map(|(y, dy)| y * (dy - dot)));
    }
    Ok(Tensor::new(output.dim, data)?)
}

#[cfg(test)]
mod tests {
    use crate::layers::{ActivationLayer, ActivationType, Layer};

    #[test]
    fn parses_known_and_unknown_names() {
        let parse = |value: &str| value.parse::<ActivationType>().ok();
        assert_eq!(parse("Softmax"), Some(ActivationType::Softmax));
        assert_eq!(parse("none"), Some(ActivationType::None));
        assert_eq!(parse("swishy"), Some(ActivationType::Unknown));
        assert_eq!(ActivationType::Relu.to_string(), "relu");
    }

    #[test]
    fn layer_rejects_unknown_activation_property() {
        let mut layer = ActivationLayer::default();
        layer
            .set_property("activation", "sigmoid")
            .expect("sigmoid should be accepted");
        assert_eq!(layer.activation_type(), Some(ActivationType::Sigmoid));
        let err = layer
            .set_property("activation", "swishy")
            .expect_err("unknown activation");
        assert!(err.is_configuration());
    }
}
