use std::path::PathBuf;

use crate::error::{GraphError, Result};
use crate::layers::{parse_bool, parse_usize};

/// Model-level properties, set from `key=value` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Loss attached at compile time; empty for none.
    pub loss: String,
    pub epochs: usize,
    pub batch_size: usize,
    /// Weights are written here after every training epoch.
    pub save_path: Option<PathBuf>,
    /// Weights are written here whenever validation improves.
    pub save_best_path: Option<PathBuf>,
    /// Weights are read from here at initialize.
    pub load_path: Option<PathBuf>,
    /// Resume from the stored epoch and iteration counters instead of zero.
    pub continue_train: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            loss: String::new(),
            epochs: 1,
            batch_size: 1,
            save_path: None,
            save_best_path: None,
            load_path: None,
            continue_train: false,
        }
    }
}

impl ModelConfig {
    pub fn set_properties<S: AsRef<str>>(&mut self, properties: &[S]) -> Result<()> {
        for entry in properties {
            self.set_property(entry.as_ref())?;
        }
        Ok(())
    }

    pub fn set_property(&mut self, entry: &str) -> Result<()> {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(GraphError::configuration(format!(
                "Model property '{entry}' is not of the form key=value"
            )));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "loss" => self.loss = value.to_ascii_lowercase(),
            "epochs" => self.epochs = parse_usize(&key, value)?,
            "batch_size" => {
                let batch_size = parse_usize(&key, value)?;
                if batch_size == 0 {
                    return Err(GraphError::configuration("batch_size must be positive"));
                }
                self.batch_size = batch_size;
            }
            "save_path" => self.save_path = path(value),
            "save_best_path" => self.save_best_path = path(value),
            "load_path" => self.load_path = path(value),
            "continue_train" => self.continue_train = parse_bool(&key, value)?,
            _ => {
                return Err(GraphError::configuration(format!(
                    "Unknown model property '{key}'"
                )));
            }
        }
        Ok(())
    }
}

fn path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}
