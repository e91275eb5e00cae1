use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kvgraph::backend::{BackendError, BackendResult, KernelPlan, OpBackend};
use kvgraph::ops::{contract, Op};
use kvgraph::{HostTensor, Layout, TensorDesc};

/// Handle with a descriptor and no storage.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBuffer {
    pub id: u64,
    pub desc: TensorDesc,
}

/// Test-only backend that records what the engine asks of it without
/// executing anything.
#[derive(Default)]
pub struct RecordingBackend {
    next_id: AtomicU64,
    prepared: Mutex<Vec<String>>,
    enqueued: Mutex<Vec<&'static str>>,
    conversions: Mutex<Vec<(Layout, Layout)>>,
    workspace_per_kernel: usize,
}

impl RecordingBackend {
    /// Every prepared kernel reports `bytes` of scratch.
    pub fn with_workspace(bytes: usize) -> Self {
        Self {
            workspace_per_kernel: bytes,
            ..Self::default()
        }
    }

    pub fn prepared(&self) -> Vec<String> {
        self.prepared.lock().expect("backend mutex poisoned").clone()
    }

    pub fn enqueued(&self) -> Vec<&'static str> {
        self.enqueued.lock().expect("backend mutex poisoned").clone()
    }

    pub fn conversions(&self) -> Vec<(Layout, Layout)> {
        self.conversions.lock().expect("backend mutex poisoned").clone()
    }

    fn handle(&self, desc: TensorDesc) -> RecordedBuffer {
        RecordedBuffer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            desc,
        }
    }
}

impl OpBackend for RecordingBackend {
    type Buffer = RecordedBuffer;

    fn backend_name(&self) -> &str {
        "recording"
    }

    fn allocate(&self, desc: &TensorDesc) -> BackendResult<RecordedBuffer> {
        desc.storage_len()?;
        Ok(self.handle(desc.clone()))
    }

    fn upload(&self, tensor: &HostTensor, layout: Layout) -> BackendResult<RecordedBuffer> {
        let desc = tensor.desc().with_layout(layout);
        desc.storage_len()?;
        Ok(self.handle(desc))
    }

    fn download(&self, _buffer: &RecordedBuffer) -> BackendResult<HostTensor> {
        Err(BackendError::unsupported("download", "recording backend holds no data"))
    }

    fn describe(&self, buffer: &RecordedBuffer) -> TensorDesc {
        buffer.desc.clone()
    }

    fn same_buffer(&self, a: &RecordedBuffer, b: &RecordedBuffer) -> bool {
        a.id == b.id
    }

    fn convert_layout(&self, src: &RecordedBuffer, dst: &RecordedBuffer) -> BackendResult<()> {
        self.conversions
            .lock()
            .expect("backend mutex poisoned")
            .push((src.desc.layout, dst.desc.layout));
        Ok(())
    }

    fn prepare(&self, op: &Op, inputs: &[TensorDesc], _outputs: &[TensorDesc]) -> BackendResult<KernelPlan> {
        contract::infer(op, inputs)?;
        let kernel = format!("recording.{}", op.name());
        self.prepared
            .lock()
            .expect("backend mutex poisoned")
            .push(kernel.clone());
        Ok(KernelPlan {
            kernel,
            workspace_bytes: self.workspace_per_kernel,
        })
    }

    fn enqueue(&self, op: &Op, _inputs: &[RecordedBuffer], _outputs: &[RecordedBuffer]) -> BackendResult<()> {
        self.enqueued
            .lock()
            .expect("backend mutex poisoned")
            .push(op.name());
        Ok(())
    }

    fn synchronize(&self) -> BackendResult<()> {
        Ok(())
    }
}
