//! Conformance suite shared by kvgraph backends.
//!
//! Each body is generic over [`kvgraph::OpBackend`]; a backend crate
//! instantiates all of them with [`define_backend_tests!`].

pub mod fixtures;
pub mod ops;
pub mod recording_backend;
pub mod runtime;

use anyhow::ensure;
use kvgraph::GraphConfig;

/// A small config exercising grouped-query attention: batch 3, hidden 64,
/// 4 query heads over 2 kv heads of 16, 2 layers.
pub fn small_config() -> GraphConfig {
    GraphConfig::default()
        .with_batch_size(3)
        .with_hidden_size(64)
        .with_heads(4, 2)
        .with_intermediate_size(96)
        .with_num_layers(2)
}

/// Elementwise `|a - e| <= atol + rtol * |e|`.
pub fn assert_close(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> anyhow::Result<()> {
    ensure!(
        actual.len() == expected.len(),
        "length mismatch: {} vs {}",
        actual.len(),
        expected.len()
    );
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        ensure!(
            (a - e).abs() <= atol + rtol * e.abs(),
            "element {index}: got {a}, expected {e}"
        );
    }
    Ok(())
}

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::{ops, runtime};

            macro_rules! backend_test {
                ($name:ident, $body:path) => {
                    #[test]
                    fn $name() -> ::anyhow::Result<()> {
                        let backend = ($backend_ctor)();
                        $body(&backend)
                    }
                };
            }

            backend_test!(ops_gated_activation_matches_closed_form, ops::gated_activation_matches_closed_form);
            backend_test!(ops_gated_activation_single_pair_is_exact, ops::gated_activation_single_pair_is_exact);
            backend_test!(ops_normalize_with_residual_returns_sum, ops::normalize_with_residual_returns_sum);
            backend_test!(ops_grouped_matmul_matches_dense_per_group, ops::grouped_matmul_matches_dense_per_group);
            backend_test!(ops_grouped_matmul_rejects_bad_boundaries, ops::grouped_matmul_rejects_bad_boundaries);
            backend_test!(ops_paged_attention_matches_dense_attention, ops::paged_attention_matches_dense_attention);
            backend_test!(ops_reshape_and_cache_skips_padding, ops::reshape_and_cache_skips_padding);
            backend_test!(ops_index_faults_are_range_errors, ops::index_faults_are_range_errors);
            backend_test!(ops_empty_context_attends_to_nothing, ops::empty_context_attends_to_nothing);
            backend_test!(ops_layout_conversion_round_trips, ops::layout_conversion_round_trips);
            backend_test!(ops_argmax_picks_first_maximum, ops::argmax_picks_first_maximum);
            backend_test!(ops_mismatched_operands_are_shape_errors, ops::mismatched_operands_are_shape_errors);
            backend_test!(runtime_session_runs_are_bit_identical, runtime::session_runs_are_bit_identical);
            backend_test!(runtime_session_pins_first_binding, runtime::session_pins_first_binding);
            backend_test!(runtime_context_stages_row_major_caches, runtime::context_stages_row_major_caches);
            backend_test!(runtime_context_rejects_misdeclared_layouts, runtime::context_rejects_misdeclared_layouts);
            backend_test!(runtime_model_without_layers_is_embedding_then_norm, runtime::model_without_layers_is_embedding_then_norm);
            backend_test!(runtime_weights_bind_after_inputs, runtime::weights_bind_after_inputs);
            backend_test!(runtime_attn_qk_norm_matches_eager_ops, runtime::attn_qk_norm_matches_eager_ops);

            #[test]
            fn runtime_reduced_decode_step() -> ::anyhow::Result<()> {
                let backend = ($backend_ctor)();
                runtime::decode_step_touches_only_addressed_slots(&backend, &$crate::small_config(), 8, 16, 40)
            }

            #[test]
            #[ignore = "full-size decode step; slow on software backends"]
            fn runtime_full_size_decode_step() -> ::anyhow::Result<()> {
                let backend = ($backend_ctor)();
                let config = ::kvgraph::GraphConfig::default();
                runtime::decode_step_touches_only_addressed_slots(&backend, &config, 64, 128, 1024)
            }
        }
    };
}
