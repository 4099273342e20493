use crate::dtype::DType;
use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};

/// Layout of one tensor inside a GGUF data section.
///
/// `shape[0]` is the innermost (contiguous) dimension, as in ggml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub offset: u64,
    pub size_bytes: u64,
}

impl TensorInfo {
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Elements per row (innermost dimension).
    pub fn row_len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0) as usize
    }

    /// Number of rows: product of the outer dimensions.
    pub fn n_rows(&self) -> usize {
        self.shape.iter().skip(1).product::<u64>() as usize
    }

    pub fn row_bytes(&self) -> usize {
        self.dtype.storage_bytes(self.row_len() as u64) as usize
    }

    pub fn validate(&self, file_size: u64) -> Result<()> {
        if self.shape.is_empty() {
            return Err(EmberError::InvalidTensorShape {
                name: self.name.clone(),
                reason: "empty shape".into(),
            });
        }

        let mut elements: u64 = 1;
        for &dim in &self.shape {
            elements = elements
                .checked_mul(dim)
                .ok_or_else(|| EmberError::InvalidTensorShape {
                    name: self.name.clone(),
                    reason: format!("shape overflow: dimension {dim} causes overflow"),
                })?;
        }

        if self.dtype.is_quantized() && self.row_len() % self.dtype.block_size() != 0 {
            return Err(EmberError::InvalidTensorShape {
                name: self.name.clone(),
                reason: format!(
                    "row length {} is not a multiple of the {} block size",
                    self.row_len(),
                    self.dtype.name()
                ),
            });
        }

        let end = self
            .offset
            .checked_add(self.size_bytes)
            .ok_or_else(|| EmberError::TensorOutOfBounds {
                name: self.name.clone(),
                offset: self.offset,
                file_size,
            })?;
        if end > file_size {
            return Err(EmberError::TensorOutOfBounds {
                name: self.name.clone(),
                offset: self.offset,
                file_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(dtype: DType, shape: Vec<u64>) -> TensorInfo {
        let size_bytes = dtype.storage_bytes(shape.iter().product());
        TensorInfo {
            name: "t".into(),
            dtype,
            shape,
            offset: 0,
            size_bytes,
        }
    }

    #[test]
    fn rows_and_row_bytes() {
        let t = info(DType::F32, vec![8, 3]);
        assert_eq!(t.row_len(), 8);
        assert_eq!(t.n_rows(), 3);
        assert_eq!(t.row_bytes(), 32);
        assert!(t.validate(96).is_ok());
        assert!(t.validate(95).is_err());
    }

    #[test]
    fn quantized_rows_must_fill_blocks() {
        let t = info(DType::Q8_0, vec![48, 2]);
        assert!(matches!(
            t.validate(1 << 20),
            Err(EmberError::InvalidTensorShape { .. })
        ));
    }
}
