use std::sync::Arc;

use kvgraph_backend_ref_cpu::CpuBackend;

fn backend() -> Arc<CpuBackend> {
    Arc::new(CpuBackend::new().expect("reference backend starts"))
}

kvgraph_backend_tests::define_backend_tests!(ref_cpu, crate::backend);
