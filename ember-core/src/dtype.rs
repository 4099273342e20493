use serde::{Deserialize, Serialize};

/// Tensor element types the engine can read out of a GGUF file.
///
/// Discriminants are the ggml type ids. Basic quant blocks hold 32 weights,
/// K-quant super-blocks hold 256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum DType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2, // f16 d + 16 nibble bytes
    Q4_1 = 3, // f16 d + f16 m + 16 nibble bytes
    Q8_0 = 8, // f16 d + 32 int8
    Q4_K = 12,
    Q6_K = 14,
    BF16 = 30,
}

impl DType {
    /// Size in bytes of one block.
    pub fn size_of_block(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::Q4_0 => 18,
            DType::Q4_1 => 20,
            DType::Q8_0 => 34,
            DType::Q4_K => 144, // d, dmin, 12 packed scales, 128 nibble bytes
            DType::Q6_K => 210, // 128 ql, 64 qh, 16 scales, d
        }
    }

    /// Number of weights per block.
    pub fn block_size(&self) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::BF16 => 1,
            DType::Q4_0 | DType::Q4_1 | DType::Q8_0 => 32,
            DType::Q4_K | DType::Q6_K => 256,
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Byte size of a tensor with `elements` weights.
    pub fn storage_bytes(&self, elements: u64) -> u64 {
        elements.div_ceil(self.block_size() as u64) * self.size_of_block() as u64
    }

    pub fn from_gguf_type_id(id: u32) -> Option<DType> {
        match id {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::Q4_0),
            3 => Some(DType::Q4_1),
            8 => Some(DType::Q8_0),
            12 => Some(DType::Q4_K),
            14 => Some(DType::Q6_K),
            30 => Some(DType::BF16),
            _ => None,
        }
    }

    pub fn gguf_type_id(&self) -> u32 {
        *self as u32
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::Q4_0 => "q4_0",
            DType::Q4_1 => "q4_1",
            DType::Q8_0 => "q8_0",
            DType::Q4_K => "q4_k",
            DType::Q6_K => "q6_k",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ids_round_trip() {
        for dt in [
            DType::F32,
            DType::F16,
            DType::BF16,
            DType::Q4_0,
            DType::Q4_1,
            DType::Q8_0,
            DType::Q4_K,
            DType::Q6_K,
        ] {
            assert_eq!(DType::from_gguf_type_id(dt.gguf_type_id()), Some(dt));
        }
        assert_eq!(DType::from_gguf_type_id(99), None);
    }

    #[test]
    fn storage_rounds_up_to_blocks() {
        assert_eq!(DType::F32.storage_bytes(10), 40);
        assert_eq!(DType::Q8_0.storage_bytes(32), 34);
        assert_eq!(DType::Q8_0.storage_bytes(33), 68);
        assert_eq!(DType::Q4_K.storage_bytes(256), 144);
    }
}
