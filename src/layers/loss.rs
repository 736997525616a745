use crate::error::{GraphError, Result};
use crate::layers::{InitContext, Layer, RunLayerContext};
use crate::tensor::Tensor;

const EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    MeanSquaredError,
    /// Sigmoid fused with binary cross entropy.
    CrossSigmoid,
    /// Softmax fused with categorical cross entropy.
    CrossSoftmax,
}

/// Terminal label-consuming layer. The label is fed into the gradient slot of
/// its output, so the output gradient doubles as the target.
#[derive(Debug, Clone)]
pub struct LossLayer {
    kind: LossKind,
}

impl LossLayer {
    pub const MSE: &'static str = "mse";
    pub const CROSS_SIGMOID: &'static str = "cross_sigmoid";
    pub const CROSS_SOFTMAX: &'static str = "cross_softmax";

    #[must_use]
    pub fn new(kind: LossKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    fn activate(&self, input: &Tensor) -> Tensor {
        match self.kind {
            LossKind::MeanSquaredError => input.clone(),
            LossKind::CrossSigmoid => input.sigmoid(),
            LossKind::CrossSoftmax => input.softmax(),
        }
    }

    fn loss(&self, output: &Tensor, label: &Tensor) -> Result<f32> {
        if output.dim != label.dim {
            return Err(crate::tensor::TensorError {
                message: format!(
                    "Label dim {} does not match output dim {}",
                    label.dim, output.dim
                ),
            }
            .into());
        }
        let value = match self.kind {
            LossKind::MeanSquaredError => output.sub(label)?.apply(|diff| diff * diff).mean()?,
            LossKind::CrossSigmoid => {
                let total: f32 = output
                    .data
                    .iter()
                    .zip(&label.data)
                    .map(|(y, l)| {
                        -(l * (y + EPSILON).ln() + (1.0 - l) * (1.0 - y + EPSILON).ln())
                    })
                    .sum();
                total / output.len().max(1) as f32
            }
            LossKind::CrossSoftmax => {
                let total: f32 = output
                    .data
                    .iter()
                    .zip(&label.data)
                    .map(|(y, l)| -l * (y + EPSILON).ln())
                    .sum();
                total / output.batch().max(1) as f32
            }
        };
        Ok(value)
    }
}

impl Layer for LossLayer {
    fn layer_type(&self) -> &'static str {
        match self.kind {
            LossKind::MeanSquaredError => Self::MSE,
            LossKind::CrossSigmoid => Self::CROSS_SIGMOID,
            LossKind::CrossSoftmax => Self::CROSS_SOFTMAX,
        }
    }

    fn finalize(&mut self, context: &mut InitContext) -> Result<()> {
        context.expect_inputs(self.layer_type(), 1)?;
        let dims = context.input_dims().to_vec();
        context.set_output_dims(dims);
        Ok(())
    }

    fn forward(&mut self, context: &mut RunLayerContext<'_>, _training: bool) -> Result<()> {
        let output = self.activate(context.input(0)?);
        let label = context.output_gradient(0)?;
        let loss = if label.is_empty() {
            0.0
        } else {
            self.loss(&output, label)?
        };
        context.set_output(0, output)?;
        context.set_loss(loss);
        Ok(())
    }

    fn calc_derivative(&mut self, context: &mut RunLayerContext<'_>) -> Result<()> {
        let output = context.output(0)?;
        let label = context.output_gradient(0)?;
        if label.is_empty() {
            return Err(GraphError::lifecycle(format!(
                "Loss layer '{}' has no label to differentiate against",
                context.name()
            )));
        }
        let scale = match self.kind {
            LossKind::MeanSquaredError => 2.0 / output.len().max(1) as f32,
            LossKind::CrossSigmoid => 1.0 / output.len().max(1) as f32,
            LossKind::CrossSoftmax => 1.0 / output.batch().max(1) as f32,
        };
        let derivative = output.sub(label)?.scale(scale);
        context.set_input_gradient(0, derivative)
    }

    fn requires_label(&self) -> bool {
        true
    }
}
