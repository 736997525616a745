use std::collections::HashMap;
use std::fmt;

use crate::error::{GraphError, Result};
use crate::tensor::{Tensor, VarGrad};

/// Update rule applied to one weight once its gradient is final.
pub trait Optimizer: fmt::Debug {
    fn optimizer_type(&self) -> &'static str;

    fn learning_rate(&self) -> f32;

    fn apply_gradient(&mut self, weight: &mut VarGrad, iteration: usize) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    #[must_use]
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn optimizer_type(&self) -> &'static str {
        "sgd"
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn apply_gradient(&mut self, weight: &mut VarGrad, _iteration: usize) -> Result<()> {
        weight.apply_gradient(self.learning_rate)
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    moments: HashMap<String, (Tensor, Tensor)>,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.001)
    }
}

impl Adam {
    #[must_use]
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1.0e-7,
            moments: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn optimizer_type(&self) -> &'static str {
        "adam"
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn apply_gradient(&mut self, weight: &mut VarGrad, iteration: usize) -> Result<()> {
        let Some(gradient) = weight.gradient().cloned() else {
            return Ok(());
        };
        let step = i32::try_from(iteration.saturating_add(1)).map_err(|_| {
            GraphError::lifecycle("Optimizer step overflow for Adam bias correction")
        })?;

        let (m, v) = self
            .moments
            .entry(weight.name().to_string())
            .or_insert_with(|| (Tensor::zeros(gradient.dim), Tensor::zeros(gradient.dim)));
        if m.len() != gradient.len() {
            return Err(crate::tensor::TensorError {
                message: format!(
                    "Shape mismatch in Adam for '{}': {} vs {}",
                    weight.name(),
                    m.dim,
                    gradient.dim
                ),
            }
            .into());
        }

        let one_minus_beta1 = 1.0_f32 - self.beta1;
        let one_minus_beta2 = 1.0_f32 - self.beta2;
        let bias1 = 1.0_f32 - self.beta1.powi(step);
        let bias2 = 1.0_f32 - self.beta2.powi(step);

        for ((p, g), (m_i, v_i)) in weight
            .value_mut()
            .data
            .iter_mut()
            .zip(gradient.data.iter())
            .zip(m.data.iter_mut().zip(v.data.iter_mut()))
        {
            *m_i = self.beta1 * *m_i + one_minus_beta1 * *g;
            *v_i = self.beta2 * *v_i + one_minus_beta2 * (*g * *g);

            let m_hat = *m_i / bias1;
            let v_hat = *v_i / bias2;
            *p -= self.learning_rate * (m_hat / (v_hat.sqrt() + self.epsilon));
        }
        Ok(())
    }
}
