use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::layers::{
    ActivationLayer, AdditionLayer, FlattenLayer, FullyConnectedLayer, InputLayer, Layer,
    LossKind, LossLayer, MultiOutLayer,
};

pub type LayerFactory = Arc<dyn Fn() -> Box<dyn Layer> + Send + Sync>;

/// Layer constructors keyed by lowercase type name.
#[derive(Clone, Default)]
pub struct LayerRegistry {
    factories: HashMap<String, LayerFactory>,
}

impl fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("types", &self.layer_types())
            .finish()
    }
}

impl LayerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in layer kind.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(InputLayer::TYPE, || Box::new(InputLayer));
        registry.register(FullyConnectedLayer::TYPE, || {
            Box::new(FullyConnectedLayer::default())
        });
        registry.register(ActivationLayer::TYPE, || Box::new(ActivationLayer::default()));
        registry.register(FlattenLayer::TYPE, || Box::new(FlattenLayer));
        registry.register(MultiOutLayer::TYPE, || Box::new(MultiOutLayer));
        registry.register(AdditionLayer::TYPE, || Box::new(AdditionLayer));
        registry.register(LossLayer::MSE, || {
            Box::new(LossLayer::new(LossKind::MeanSquaredError))
        });
        registry.register(LossLayer::CROSS_SIGMOID, || {
            Box::new(LossLayer::new(LossKind::CrossSigmoid))
        });
        registry.register(LossLayer::CROSS_SOFTMAX, || {
            Box::new(LossLayer::new(LossKind::CrossSoftmax))
        });
        registry
    }

    /// Adds or replaces the constructor for `layer_type`.
    pub fn register<F>(&mut self, layer_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn Layer> + Send + Sync + 'static,
    {
        self.factories
            .insert(layer_type.to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn contains(&self, layer_type: &str) -> bool {
        self.factories
            .contains_key(&layer_type.to_ascii_lowercase())
    }

    pub fn create_layer(&self, layer_type: &str) -> Result<Box<dyn Layer>> {
        let factory = self
            .factories
            .get(&layer_type.to_ascii_lowercase())
            .ok_or_else(|| {
                GraphError::configuration(format!("Unknown layer type '{layer_type}'"))
            })?;
        Ok(factory())
    }

    pub fn layer_types(&self) -> Vec<&str> {
        let mut types = self.factories.keys().map(String::as_str).collect::<Vec<_>>();
        types.sort_unstable();
        types
    }
}
