use crate::tensor::TensorError;

/// Failure taxonomy shared by every stage of the graph pipeline.
///
/// None of these are recovered locally: the failing operation aborts and the
/// caller decides what to do with the graph. A graph whose `compile()` failed
/// is left partially realized and must not be reused.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Unknown activation, layer type or loss type, or a malformed property.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Unresolved connection, duplicate name, missing static shape, label/leaf
    /// role violation, bad shared-from target or an unsortable graph.
    #[error("structural error: {0}")]
    Structural(String),
    /// An operation was invoked in the wrong phase of build → compile →
    /// initialize → run.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
    #[error("computation error: {0}")]
    Computation(#[from] TensorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural(message.into())
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }

    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }

    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::GraphError;
    use crate::tensor::TensorError;

    #[test]
    fn messages_carry_the_category() {
        let err = GraphError::structural("node 'fc' has no input");
        assert_eq!(err.to_string(), "structural error: node 'fc' has no input");
        assert!(err.is_structural());
    }

    #[test]
    fn tensor_errors_convert_into_computation_errors() {
        let err: GraphError = TensorError {
            message: "shape mismatch".to_string(),
        }
        .into();
        assert!(matches!(err, GraphError::Computation(_)));
        assert!(err.to_string().contains("shape mismatch"));
    }
}
