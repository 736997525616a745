use std::fmt;
use std::str::FromStr;

use crate::tensor::TensorError;

/// Four-axis tensor extent in `batch:channel:height:width` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorDim {
    dims: [usize; 4],
}

impl Default for TensorDim {
    fn default() -> Self {
        Self { dims: [1, 1, 1, 1] }
    }
}

impl TensorDim {
    #[must_use]
    pub const fn new(batch: usize, channel: usize, height: usize, width: usize) -> Self {
        Self {
            dims: [batch, channel, height, width],
        }
    }

    /// A single-sample `1:1:1:width` extent.
    #[must_use]
    pub const fn vector(width: usize) -> Self {
        Self::new(1, 1, 1, width)
    }

    pub fn batch(&self) -> usize {
        self.dims[0]
    }

    pub fn channel(&self) -> usize {
        self.dims[1]
    }

    pub fn height(&self) -> usize {
        self.dims[2]
    }

    pub fn width(&self) -> usize {
        self.dims[3]
    }

    pub fn set_batch(&mut self, batch: usize) {
        self.dims[0] = batch;
    }

    #[must_use]
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.set_batch(batch);
        self
    }

    /// Elements in one sample.
    pub fn feature_len(&self) -> usize {
        self.dims[1] * self.dims[2] * self.dims[3]
    }

    pub fn data_len(&self) -> usize {
        self.dims[0] * self.feature_len()
    }

    /// Rows of the `(batch * channel * height) x width` matrix view.
    pub fn rows(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn as_array(&self) -> [usize; 4] {
        self.dims
    }
}

impl fmt::Display for TensorDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [b, c, h, w] = self.dims;
        write!(f, "{b}:{c}:{h}:{w}")
    }
}

/// Parses `w`, `h:w`, `c:h:w` or `b:c:h:w`; missing leading axes are 1.
impl FromStr for TensorDim {
    type Err = TensorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(':')
            .map(|part| {
                part.trim().parse::<usize>().map_err(|err| TensorError {
                    message: format!("Invalid dimension '{part}' in '{value}': {err}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if parts.is_empty() || parts.len() > 4 {
            return Err(TensorError {
                message: format!("Dimension '{value}' must have between 1 and 4 axes"),
            });
        }
        if parts.contains(&0) {
            return Err(TensorError {
                message: format!("Dimension '{value}' has a zero-sized axis"),
            });
        }
        let mut dims = [1usize; 4];
        let offset = 4 - parts.len();
        dims[offset..].copy_from_slice(&parts);
        Ok(Self { dims })
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::TensorDim;

    #[test]
    fn parses_partial_dimensions_right_aligned() {
        let dim: TensorDim = "1:1:4".parse().expect("dimension should parse");
        assert_eq!(dim, TensorDim::new(1, 1, 1, 4));
        let full: TensorDim = "3:2:5:7".parse().expect("dimension should parse");
        assert_eq!(full.batch(), 3);
        assert_eq!(full.feature_len(), 70);
        assert_eq!(full.data_len(), 210);
    }

    #[test]
    fn rejects_zero_and_garbage_axes() {
        assert!("0:4".parse::<TensorDim>().is_err());
        assert!("a:4".parse::<TensorDim>().is_err());
        assert!("1:2:3:4:5".parse::<TensorDim>().is_err());
    }

    #[test]
    fn batch_updates_do_not_touch_features() {
        let dim = TensorDim::new(1, 2, 3, 4).with_batch(8);
        assert_eq!(dim.batch(), 8);
        assert_eq!(dim.feature_len(), 24);
        assert_eq!(dim.to_string(), "8:2:3:4");
    }
}
