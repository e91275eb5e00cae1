use rand::Rng;

use super::{DType, TensorDesc};
use crate::error::{GraphError, Result};

/// Element storage of a [`HostTensor`].
///
/// Floating-point tensors are held as `f32` already rounded to their dtype's
/// precision, so values read back from a device compare exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl HostData {
    pub fn len(&self) -> usize {
        match self {
            HostData::F32(values) => values.len(),
            HostData::I32(values) => values.len(),
            HostData::I64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row-major tensor in host memory used to move data across the device boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dims: Vec<usize>,
    dtype: DType,
    data: HostData,
}

fn check_len(dims: &[usize], len: usize) -> Result<()> {
    let expected: usize = dims.iter().product();
    if expected != len {
        return Err(GraphError::shape(format!(
            "host tensor of shape {dims:?} needs {expected} elements, got {len}"
        )));
    }
    Ok(())
}

impl HostTensor {
    /// Builds a floating-point tensor, rounding every value to `dtype`.
    pub fn from_f32(dims: &[usize], dtype: DType, mut values: Vec<f32>) -> Result<Self> {
        if !dtype.is_float() {
            return Err(GraphError::shape(format!("{dtype} is not a floating-point dtype")));
        }
        check_len(dims, values.len())?;
        if dtype != DType::F32 {
            for value in &mut values {
                *value = dtype.round_f32(*value);
            }
        }
        Ok(Self {
            dims: dims.to_vec(),
            dtype,
            data: HostData::F32(values),
        })
    }

    pub fn f16(dims: &[usize], values: Vec<f32>) -> Result<Self> {
        Self::from_f32(dims, DType::F16, values)
    }

    pub fn from_i32(dims: &[usize], values: Vec<i32>) -> Result<Self> {
        check_len(dims, values.len())?;
        Ok(Self {
            dims: dims.to_vec(),
            dtype: DType::I32,
            data: HostData::I32(values),
        })
    }

    pub fn from_i64(dims: &[usize], values: Vec<i64>) -> Result<Self> {
        check_len(dims, values.len())?;
        Ok(Self {
            dims: dims.to_vec(),
            dtype: DType::I64,
            data: HostData::I64(values),
        })
    }

    pub fn zeros(dims: &[usize], dtype: DType) -> Self {
        let len = dims.iter().product();
        let data = match dtype {
            DType::F16 | DType::BF16 | DType::F32 => HostData::F32(vec![0.0; len]),
            DType::I32 => HostData::I32(vec![0; len]),
            DType::I64 => HostData::I64(vec![0; len]),
        };
        Self {
            dims: dims.to_vec(),
            dtype,
            data,
        }
    }

    /// Uniform values in `[-scale, scale)`, rounded to `dtype`.
    pub fn random<R: Rng + ?Sized>(dims: &[usize], dtype: DType, scale: f32, rng: &mut R) -> Result<Self> {
        let len = dims.iter().product();
        let values = (0..len).map(|_| rng.gen_range(-scale..scale)).collect();
        Self::from_f32(dims, dtype, values)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row-major descriptor of this tensor.
    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.dims.as_slice(), self.dtype)
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            HostData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            HostData::I32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            HostData::I64(values) => Some(values),
            _ => None,
        }
    }

    /// Every element widened to `f32`, regardless of dtype.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            HostData::F32(values) => values.clone(),
            HostData::I32(values) => values.iter().map(|v| *v as f32).collect(),
            HostData::I64(values) => values.iter().map(|v| *v as f32).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn f16_tensors_round_on_construction() {
        let tensor = HostTensor::f16(&[2], vec![1.0 + 1.0 / 4096.0, 0.5]).unwrap();
        assert_eq!(tensor.as_f32().unwrap(), &[1.0, 0.5]);
        assert_eq!(tensor.desc().to_string(), "f16[2]@nd");
    }

    #[test]
    fn element_count_must_match_shape() {
        assert!(matches!(
            HostTensor::from_i32(&[2, 2], vec![1, 2, 3]),
            Err(GraphError::Shape(_))
        ));
        assert!(HostTensor::from_f32(&[1], DType::I32, vec![1.0]).is_err());
    }

    #[test]
    fn random_values_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let tensor = HostTensor::random(&[8, 8], DType::F16, 0.5, &mut rng).unwrap();
        assert!(tensor.as_f32().unwrap().iter().all(|v| v.abs() <= 0.5));
    }
}
