use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar element types a graph slot or device buffer can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    BF16,
    F32,
    I32,
    I64,
}

impl DType {
    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::I64 => "i64",
        }
    }

    /// Rounds an f32 value to the precision this dtype stores.
    ///
    /// Integer dtypes and `F32` return the value unchanged.
    pub fn round_f32(self, value: f32) -> f32 {
        match self {
            DType::F16 => half::f16::from_f32(value).to_f32(),
            DType::BF16 => half::bf16::from_f32(value).to_f32(),
            DType::F32 | DType::I32 | DType::I64 => value,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::DType;

    #[test]
    fn rounding_matches_storage_precision() {
        let value = 1.0 + 1.0 / 4096.0;
        assert_eq!(DType::F32.round_f32(value), value);
        assert_eq!(DType::F16.round_f32(value), 1.0);
        assert_eq!(DType::BF16.round_f32(3.0), 3.0);
    }

    #[test]
    fn dtype_deserializes_from_lowercase_names() {
        let dtype: DType = serde_json::from_str("\"bf16\"").unwrap();
        assert_eq!(dtype, DType::BF16);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }
}
