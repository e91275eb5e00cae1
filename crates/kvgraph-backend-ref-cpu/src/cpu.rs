use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kvgraph::backend::{BackendError, BackendResult, KernelPlan, OpBackend};
use kvgraph::ops::{contract, Op};
use kvgraph::tensor::{HostTensor, Layout, TensorDesc};

use crate::buffer::CpuBuffer;
use crate::stream::{Command, Stream};

/// Hook that may take over a launch before the reference kernel runs.
///
/// Runs on the stream worker. Returning `None` falls through to the
/// reference kernel.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        op: &Op,
        inputs: &[CpuBuffer],
        outputs: &[CpuBuffer],
    ) -> Option<BackendResult<()>>;
}

#[derive(Debug, Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _op: &Op,
        _inputs: &[CpuBuffer],
        _outputs: &[CpuBuffer],
    ) -> Option<BackendResult<()>> {
        None
    }
}

/// Software-simulated device with one asynchronous command stream.
pub struct GenericCpuBackend<I: CpuKernelInterceptor + 'static> {
    interceptor: Arc<I>,
    stream: Stream,
    next_id: AtomicU64,
}

pub type CpuBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor + 'static> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> BackendResult<Self> {
        Self::with_arc(Arc::new(interceptor))
    }

    pub fn with_arc(interceptor: Arc<I>) -> BackendResult<Self> {
        Ok(Self {
            stream: Stream::spawn(Arc::clone(&interceptor))?,
            interceptor,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> BackendResult<Self> {
        Self::with_interceptor(NoopInterceptor)
    }
}

/// Checks a launch against the operator contract before it is queued.
fn check_launch(op: &Op, inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let descs: Vec<TensorDesc> = inputs.iter().map(|b| b.desc().clone()).collect();
    let expected = contract::infer(op, &descs)?;
    if outputs.len() != expected.len() {
        return Err(BackendError::shape(format!(
            "{} yields {} outputs, {} buffers given",
            op.name(),
            expected.len(),
            outputs.len()
        )));
    }
    for (index, (buffer, desc)) in outputs.iter().zip(&expected).enumerate() {
        let resolved_ok = buffer.dtype() == desc.dtype
            && buffer.layout() == desc.layout
            && desc.shape.compatible(&buffer.desc().shape);
        if !resolved_ok {
            return Err(BackendError::shape(format!(
                "{} output {index} must be {desc}, got {buffer:?}",
                op.name()
            )));
        }
    }
    for (output, input) in op.in_place() {
        if !outputs[*output].same_storage(&inputs[*input]) {
            return Err(BackendError::shape(format!(
                "{} writes output {output} in place of input {input}; they must be the same buffer",
                op.name()
            )));
        }
    }
    Ok(())
}

impl<I: CpuKernelInterceptor + 'static> OpBackend for GenericCpuBackend<I> {
    type Buffer = CpuBuffer;

    fn backend_name(&self) -> &str {
        "ref-cpu"
    }

    fn allocate(&self, desc: &TensorDesc) -> BackendResult<CpuBuffer> {
        CpuBuffer::zeroed(self.next_id(), desc)
    }

    fn upload(&self, tensor: &HostTensor, layout: Layout) -> BackendResult<CpuBuffer> {
        CpuBuffer::from_host(self.next_id(), tensor, layout)
    }

    fn download(&self, buffer: &CpuBuffer) -> BackendResult<HostTensor> {
        buffer.to_host()
    }

    fn describe(&self, buffer: &CpuBuffer) -> TensorDesc {
        buffer.desc().clone()
    }

    fn same_buffer(&self, a: &CpuBuffer, b: &CpuBuffer) -> bool {
        a.same_storage(b)
    }

    fn convert_layout(&self, src: &CpuBuffer, dst: &CpuBuffer) -> BackendResult<()> {
        if src.dims() != dst.dims() || src.dtype() != dst.dtype() {
            return Err(BackendError::shape(format!(
                "cannot convert {src:?} into {dst:?}"
            )));
        }
        dst.indexer()?;
        self.stream.submit(Command::Convert {
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    fn prepare(
        &self,
        op: &Op,
        inputs: &[TensorDesc],
        outputs: &[TensorDesc],
    ) -> BackendResult<KernelPlan> {
        contract::infer(op, inputs)?;
        let dtype = inputs
            .first()
            .map(|desc| desc.dtype)
            .ok_or_else(|| BackendError::unsupported(op.name(), "operator without inputs"))?;
        // f32 accumulators for every output element, when the extent is known
        let accumulates = matches!(
            op,
            Op::Normalize(_)
                | Op::GatedActivation
                | Op::DenseMatmul
                | Op::GroupedMatmul
                | Op::PagedAttention(_)
        );
        let workspace_bytes = if accumulates {
            outputs
                .iter()
                .filter_map(TensorDesc::element_count)
                .sum::<usize>()
                * std::mem::size_of::<f32>()
        } else {
            0
        };
        Ok(KernelPlan {
            kernel: format!("ref_cpu.{}.{}", op.name(), dtype),
            workspace_bytes,
        })
    }

    fn enqueue(&self, op: &Op, inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
        check_launch(op, inputs, outputs)?;
        self.stream.submit(Command::Launch {
            op: op.clone(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        })
    }

    fn synchronize(&self) -> BackendResult<()> {
        self.stream.fence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvgraph::tensor::DType;

    struct FailOn(&'static str);

    impl CpuKernelInterceptor for FailOn {
        fn try_execute(
            &self,
            op: &Op,
            _inputs: &[CpuBuffer],
            _outputs: &[CpuBuffer],
        ) -> Option<BackendResult<()>> {
            (op.name() == self.0).then(|| Err(BackendError::execution(format!("injected failure in {}", op.name()))))
        }
    }

    #[test]
    fn failures_are_sticky_until_the_next_fence() {
        let backend = GenericCpuBackend::with_interceptor(FailOn("gated_activation")).unwrap();
        let x = HostTensor::from_f32(&[2, 4], DType::F32, vec![1.0; 8]).unwrap();
        let x = backend.upload(&x, Layout::Nd).unwrap();
        let y = backend.allocate(&TensorDesc::new([2, 2], DType::F32)).unwrap();
        let copy = backend.allocate(&TensorDesc::new([2, 4], DType::F32)).unwrap();

        backend.enqueue(&Op::GatedActivation, &[x.clone()], &[y]).unwrap();
        backend.convert_layout(&x, &copy).unwrap();
        let err = backend.synchronize().unwrap_err();
        assert!(matches!(err, BackendError::Execution(_)));
        assert_eq!(copy.read_logical_f32().unwrap(), vec![0.0; 8]);

        backend.synchronize().unwrap();
        backend.convert_layout(&x, &copy).unwrap();
        backend.synchronize().unwrap();
        assert_eq!(copy.read_logical_f32().unwrap(), vec![1.0; 8]);
    }

    #[test]
    fn enqueue_checks_outputs_and_in_place_pairs() {
        let backend = CpuBackend::new().unwrap();
        let x = backend.allocate(&TensorDesc::new([2, 4], DType::F16)).unwrap();
        let wrong = backend.allocate(&TensorDesc::new([2, 4], DType::F16)).unwrap();
        assert!(matches!(
            backend.enqueue(&Op::GatedActivation, &[x], &[wrong]),
            Err(BackendError::Shape(_))
        ));

        let cache_desc = TensorDesc::new([1, 16, 16], DType::F16).with_layout(Layout::FractalNz);
        let cache = backend.allocate(&cache_desc).unwrap();
        let copy = backend.allocate(&cache_desc).unwrap();
        let rows = backend.allocate(&TensorDesc::new([1, 1, 16], DType::F16)).unwrap();
        let slots = backend.allocate(&TensorDesc::new([1], DType::I32)).unwrap();
        let inputs = [rows.clone(), rows, cache.clone(), cache.clone(), slots];
        assert!(backend
            .enqueue(&Op::ReshapeAndCache, &inputs, &[cache.clone(), cache.clone()])
            .is_ok());
        assert!(matches!(
            backend.enqueue(&Op::ReshapeAndCache, &inputs, &[copy, cache]),
            Err(BackendError::Shape(_))
        ));
        backend.synchronize().unwrap();
    }

    #[test]
    fn prepare_names_kernels_and_sizes_accumulators() {
        let backend = CpuBackend::new().unwrap();
        let x = TensorDesc::new([2, 16], DType::F16);
        let w = TensorDesc::new([8, 16], DType::F16);
        let out = TensorDesc::new([2, 8], DType::F16);
        let plan = backend.prepare(&Op::DenseMatmul, &[x.clone(), w], &[out]).unwrap();
        assert_eq!(plan.kernel, "ref_cpu.dense_matmul.f16");
        assert_eq!(plan.workspace_bytes, 2 * 8 * 4);

        let bad = TensorDesc::new([8, 15], DType::F16);
        assert!(backend.prepare(&Op::DenseMatmul, &[x, bad], &[]).is_err());
    }
}
