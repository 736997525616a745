//! Dense tensors and the storage manager that owns them.

mod dim;
mod manager;
#[allow(clippy::module_inception)]
mod tensor;

pub use dim::TensorDim;
pub use manager::{
    Initializer, Regularizer, TensorHandle, TensorKind, TensorManager, TensorSpec, VarGrad,
    WeightSpec,
};
pub use tensor::{Tensor, TensorError};
