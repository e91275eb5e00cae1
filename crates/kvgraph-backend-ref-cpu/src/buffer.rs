use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use half::{bf16, f16};
use kvgraph::backend::{BackendError, BackendResult};
use kvgraph::tensor::{layout, DType, HostData, HostTensor, Layout, MatrixIndexer, TensorDesc};

/// Physical element storage of a [`CpuBuffer`], including tile padding.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl Storage {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F16 => Storage::F16(vec![f16::ZERO; len]),
            DType::BF16 => Storage::BF16(vec![bf16::ZERO; len]),
            DType::F32 => Storage::F32(vec![0.0; len]),
            DType::I32 => Storage::I32(vec![0; len]),
            DType::I64 => Storage::I64(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::F16(values) => values.len(),
            Storage::BF16(values) => values.len(),
            Storage::F32(values) => values.len(),
            Storage::I32(values) => values.len(),
            Storage::I64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` widened to f32.
    #[inline]
    pub fn get_f32(&self, index: usize) -> f32 {
        match self {
            Storage::F16(values) => values[index].to_f32(),
            Storage::BF16(values) => values[index].to_f32(),
            Storage::F32(values) => values[index],
            Storage::I32(values) => values[index] as f32,
            Storage::I64(values) => values[index] as f32,
        }
    }

    /// Stores `value`, rounding to the element type.
    #[inline]
    pub fn set_f32(&mut self, index: usize, value: f32) {
        match self {
            Storage::F16(values) => values[index] = f16::from_f32(value),
            Storage::BF16(values) => values[index] = bf16::from_f32(value),
            Storage::F32(values) => values[index] = value,
            Storage::I32(values) => values[index] = value as i32,
            Storage::I64(values) => values[index] = value as i64,
        }
    }

    /// Copies one element between storages of the same type.
    #[inline]
    fn copy_element(&mut self, dst: usize, src: &Storage, src_index: usize) -> BackendResult<()> {
        match (self, src) {
            (Storage::F16(d), Storage::F16(s)) => d[dst] = s[src_index],
            (Storage::BF16(d), Storage::BF16(s)) => d[dst] = s[src_index],
            (Storage::F32(d), Storage::F32(s)) => d[dst] = s[src_index],
            (Storage::I32(d), Storage::I32(s)) => d[dst] = s[src_index],
            (Storage::I64(d), Storage::I64(s)) => d[dst] = s[src_index],
            _ => return Err(BackendError::shape("element copy between different dtypes")),
        }
        Ok(())
    }
}

/// Handle to a buffer in simulated device memory. Clones share storage.
#[derive(Clone)]
pub struct CpuBuffer {
    id: u64,
    desc: TensorDesc,
    dims: Vec<usize>,
    storage: Arc<RwLock<Storage>>,
}

impl fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuBuffer#{}({})", self.id, self.desc)
    }
}

impl CpuBuffer {
    pub(crate) fn zeroed(id: u64, desc: &TensorDesc) -> BackendResult<Self> {
        let dims = desc.require_static()?;
        let len = layout::storage_len(&dims, desc.layout)?;
        Ok(Self {
            id,
            desc: desc.clone(),
            dims,
            storage: Arc::new(RwLock::new(Storage::zeros(desc.dtype, len))),
        })
    }

    pub(crate) fn from_host(id: u64, tensor: &HostTensor, layout: Layout) -> BackendResult<Self> {
        let desc = tensor.desc().with_layout(layout);
        let buffer = Self::zeroed(id, &desc)?;
        match tensor.data() {
            HostData::F32(values) => buffer.write_logical_f32(values)?,
            HostData::I32(values) => {
                let physical = layout::to_physical(tensor.dims(), layout, values)?;
                *buffer.write()? = Storage::I32(physical);
            }
            HostData::I64(values) => {
                let physical = layout::to_physical(tensor.dims(), layout, values)?;
                *buffer.write()? = Storage::I64(physical);
            }
        }
        Ok(buffer)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn layout(&self) -> Layout {
        self.desc.layout
    }

    pub fn same_storage(&self, other: &CpuBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn indexer(&self) -> BackendResult<MatrixIndexer> {
        Ok(MatrixIndexer::new(&self.dims, self.desc.layout)?)
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub(crate) fn read(&self) -> BackendResult<RwLockReadGuard<'_, Storage>> {
        self.storage
            .read()
            .map_err(|_| BackendError::execution(format!("{self:?} is poisoned")))
    }

    pub(crate) fn write(&self) -> BackendResult<RwLockWriteGuard<'_, Storage>> {
        self.storage
            .write()
            .map_err(|_| BackendError::execution(format!("{self:?} is poisoned")))
    }

    /// Row-major values widened to f32.
    pub fn read_logical_f32(&self) -> BackendResult<Vec<f32>> {
        let indexer = self.indexer()?;
        let storage = self.read()?;
        Ok((0..self.element_count())
            .map(|index| storage.get_f32(indexer.offset_of_linear(index)))
            .collect())
    }

    /// Row-major integer values; fails for floating-point buffers.
    pub fn read_logical_i64(&self) -> BackendResult<Vec<i64>> {
        let indexer = self.indexer()?;
        let storage = self.read()?;
        let values = (0..self.element_count()).map(|index| indexer.offset_of_linear(index));
        match &*storage {
            Storage::I32(data) => Ok(values.map(|offset| i64::from(data[offset])).collect()),
            Storage::I64(data) => Ok(values.map(|offset| data[offset]).collect()),
            _ => Err(BackendError::shape(format!(
                "{self:?} does not hold integer indices"
            ))),
        }
    }

    /// Writes row-major values, rounding to the buffer's dtype.
    pub fn write_logical_f32(&self, values: &[f32]) -> BackendResult<()> {
        if values.len() != self.element_count() {
            return Err(BackendError::shape(format!(
                "{} values for {self:?}",
                values.len()
            )));
        }
        let indexer = self.indexer()?;
        let mut storage = self.write()?;
        for (index, value) in values.iter().enumerate() {
            storage.set_f32(indexer.offset_of_linear(index), *value);
        }
        Ok(())
    }

    pub(crate) fn to_host(&self) -> BackendResult<HostTensor> {
        let tensor = match self.dtype() {
            DType::F16 | DType::BF16 | DType::F32 => {
                HostTensor::from_f32(&self.dims, self.dtype(), self.read_logical_f32()?)
            }
            DType::I32 => {
                let values = self.read_logical_i64()?;
                HostTensor::from_i32(&self.dims, values.into_iter().map(|v| v as i32).collect())
            }
            DType::I64 => HostTensor::from_i64(&self.dims, self.read_logical_i64()?),
        };
        Ok(tensor?)
    }

    /// Copies the logical contents of `src` into `self`, rearranging between layouts.
    pub(crate) fn copy_from(&self, src: &CpuBuffer) -> BackendResult<()> {
        if src.dims != self.dims || src.dtype() != self.dtype() {
            return Err(BackendError::shape(format!(
                "cannot convert {src:?} into {self:?}"
            )));
        }
        if self.same_storage(src) {
            return Ok(());
        }
        let (from, to) = (src.indexer()?, self.indexer()?);
        let source = src.read()?;
        let mut target = self.write()?;
        for index in 0..self.element_count() {
            target.copy_element(to.offset_of_linear(index), &source, from.offset_of_linear(index))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiled_upload_reads_back_in_logical_order() {
        let values: Vec<f32> = (0..2 * 3 * 16).map(|v| v as f32).collect();
        let tensor = HostTensor::f16(&[2, 3, 16], values.clone()).unwrap();
        let buffer = CpuBuffer::from_host(1, &tensor, Layout::FractalNz).unwrap();
        assert_eq!(buffer.read().unwrap().len(), 2 * 16 * 16);
        assert_eq!(buffer.read_logical_f32().unwrap(), values);
        // row 1, col 0 of the first page sits one tile row in
        assert_eq!(buffer.read().unwrap().get_f32(16), 16.0);
    }

    #[test]
    fn copy_between_layouts_preserves_values() {
        let tensor = HostTensor::f16(&[4, 32], (0..128).map(|v| v as f32).collect()).unwrap();
        let nd = CpuBuffer::from_host(1, &tensor, Layout::Nd).unwrap();
        let nz = CpuBuffer::zeroed(2, &tensor.desc().with_layout(Layout::FractalNz)).unwrap();
        nz.copy_from(&nd).unwrap();
        assert_eq!(nz.to_host().unwrap(), tensor);
    }

    #[test]
    fn integer_buffers_round_trip() {
        let tensor = HostTensor::from_i32(&[2, 2], vec![3, -1, 7, 0]).unwrap();
        let buffer = CpuBuffer::from_host(3, &tensor, Layout::Nd).unwrap();
        assert_eq!(buffer.to_host().unwrap(), tensor);
        assert_eq!(buffer.read_logical_i64().unwrap(), vec![3, -1, 7, 0]);
    }
}
