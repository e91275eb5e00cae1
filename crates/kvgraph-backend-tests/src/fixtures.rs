//! Decode-step inputs and model weights shared by the suites.

use anyhow::ensure;
use kvgraph::graph::recipes::{build_model_with_head, ModelHead};
use kvgraph::kv::{BlockTable, KvCacheGeometry, PagePool, SlotMapping};
use kvgraph::{DType, Graph, GraphConfig, HostTensor, Layout, OpBackend};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One decode step for a batch of requests with random context lengths.
///
/// Pages are handed out block by block across the batch, so a request's pages
/// are interleaved with the other requests' pages.
#[derive(Debug, Clone)]
pub struct DecodeStep {
    pub table: BlockTable,
    pub context_lens: Vec<i32>,
    pub slot_mapping: SlotMapping,
    pub token_ids: Vec<i32>,
}

impl DecodeStep {
    pub fn random<R: Rng + ?Sized>(
        geometry: &KvCacheGeometry,
        batch: usize,
        vocab: usize,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let max_len = (geometry.num_pages / batch) * geometry.page_size;
        ensure!(max_len > 0, "{} pages cannot serve a batch of {batch}", geometry.num_pages);
        let lens: Vec<usize> = (0..batch).map(|_| rng.gen_range(1..=max_len)).collect();

        let mut pool = PagePool::new(geometry.num_pages);
        let mut table = BlockTable::new(batch, geometry.page_size);
        let blocks = max_len / geometry.page_size;
        for block in 1..=blocks {
            for (request, len) in lens.iter().enumerate() {
                let upto = (*len).min(block * geometry.page_size);
                table.reserve(&mut pool, request, upto)?;
            }
        }

        let positions: Vec<usize> = lens.iter().map(|len| len - 1).collect();
        let slot_mapping = SlotMapping::from_positions(&table, &positions)?;
        Ok(Self {
            table,
            context_lens: lens.iter().map(|len| *len as i32).collect(),
            slot_mapping,
            token_ids: (0..batch).map(|_| rng.gen_range(0..vocab as i32)).collect(),
        })
    }

    pub fn batch(&self) -> usize {
        self.context_lens.len()
    }

    /// `[slot_mapping, block_tables, context_lens]` as host tensors.
    pub fn index_tensors(&self) -> anyhow::Result<[HostTensor; 3]> {
        Ok([
            self.slot_mapping.to_tensor()?,
            self.table.to_tensor()?,
            HostTensor::from_i32(&[self.batch()], self.context_lens.clone())?,
        ])
    }
}

/// Uploads one random tensor per graph weight, in binding order.
///
/// Symbolic dims take `vocab`. Matrices are scaled by `1/sqrt(fan_in)` so
/// activations stay inside the f16 range.
pub fn random_weights<B: OpBackend, R: Rng + ?Sized>(
    backend: &B,
    graph: &Graph,
    vocab: usize,
    rng: &mut R,
) -> anyhow::Result<Vec<B::Buffer>> {
    graph
        .weights()
        .iter()
        .map(|id| {
            let desc = &graph.values()[id.index()].desc;
            let dims: Vec<usize> = desc
                .dims()
                .iter()
                .map(|dim| dim.as_static().unwrap_or(vocab))
                .collect();
            let scale = match dims.as_slice() {
                [.., fan_in] if dims.len() > 1 => 1.0 / (*fan_in as f32).sqrt(),
                _ => 1.0,
            };
            let host = HostTensor::random(&dims, desc.dtype, scale, rng)?;
            Ok(backend.upload(&host, desc.layout)?)
        })
        .collect()
}

/// Allocates one buffer per graph output; outputs must be fully static.
pub fn allocate_outputs<B: OpBackend>(backend: &B, graph: &Graph) -> anyhow::Result<Vec<B::Buffer>> {
    graph
        .outputs()
        .iter()
        .map(|id| Ok(backend.allocate(&graph.values()[id.index()].desc)?))
        .collect()
}

/// A full decode-step model with random weights, random cache contents and
/// one random step, bound on `B`.
pub struct ModelFixture<B: OpBackend> {
    pub graph: Graph,
    pub geometry: KvCacheGeometry,
    pub step: DecodeStep,
    pub caches: Vec<B::Buffer>,
    pub initial_caches: Vec<HostTensor>,
    pub inputs: Vec<B::Buffer>,
    pub weights: Vec<B::Buffer>,
}

impl<B: OpBackend> ModelFixture<B> {
    pub fn new(
        backend: &B,
        config: &GraphConfig,
        head: ModelHead,
        num_pages: usize,
        page_size: usize,
        vocab: usize,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let graph = build_model_with_head(config, head)?;
        let geometry = KvCacheGeometry::new(num_pages, page_size, config.num_kv_heads, config.head_dim());
        let mut rng = StdRng::seed_from_u64(seed);
        let step = DecodeStep::random(&geometry, config.batch_size, vocab, &mut rng)?;

        let token_ids = HostTensor::from_i32(&[step.batch()], step.token_ids.clone())?;
        let mut inputs = vec![backend.upload(&token_ids, Layout::Nd)?];
        let mut caches = Vec::with_capacity(2 * config.num_layers);
        let mut initial_caches = Vec::with_capacity(2 * config.num_layers);
        let cache_dims = [num_pages, page_size, geometry.row_width()];
        for _ in 0..2 * config.num_layers {
            let host = HostTensor::random(&cache_dims, DType::F16, 1.0, &mut rng)?;
            let buffer = backend.upload(&host, Layout::FractalNz)?;
            inputs.push(buffer.clone());
            caches.push(buffer);
            initial_caches.push(host);
        }
        if config.num_layers > 0 {
            for tensor in step.index_tensors()? {
                inputs.push(backend.upload(&tensor, Layout::Nd)?);
            }
        }
        ensure!(
            inputs.len() == graph.inputs().len(),
            "fixture binds {} inputs, graph declares {}",
            inputs.len(),
            graph.inputs().len()
        );
        let weights = random_weights(backend, &graph, vocab, &mut rng)?;
        Ok(Self {
            graph,
            geometry,
            step,
            caches,
            initial_caches,
            inputs,
            weights,
        })
    }

    /// Graph inputs followed by weights, as `Session::run_async` binds them.
    pub fn session_inputs(&self) -> Vec<B::Buffer> {
        let mut all = self.inputs.clone();
        all.extend(self.weights.iter().cloned());
        all
    }

    pub fn input_layouts(&self) -> Vec<Layout> {
        self.graph
            .inputs()
            .iter()
            .map(|id| self.graph.values()[id.index()].desc.layout)
            .collect()
    }
}

/// Cache slots whose row differs between two downloads of the same cache.
pub fn changed_slots(before: &HostTensor, after: &HostTensor) -> anyhow::Result<Vec<usize>> {
    ensure!(before.dims() == after.dims(), "cache shapes differ");
    let width = before.dims().last().copied().unwrap_or(0);
    ensure!(width > 0, "cache rows are empty");
    let (before, after) = (before.to_f32_vec(), after.to_f32_vec());
    Ok(before
        .chunks(width)
        .zip(after.chunks(width))
        .enumerate()
        .filter(|(_, (a, b))| a.iter().zip(*b).any(|(x, y)| x.to_bits() != y.to_bits()))
        .map(|(slot, _)| slot)
        .collect())
}
