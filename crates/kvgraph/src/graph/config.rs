use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Model shape a recipe builds a graph for.
///
/// Recipes read only the fields they need, so a config for `build_embedding`
/// may leave the attention fields at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub batch_size: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
    pub rms_norm_eps: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            hidden_size: 4096,
            num_heads: 32,
            num_kv_heads: 8,
            intermediate_size: 12288,
            num_layers: 2,
            rms_norm_eps: 1e-6,
        }
    }
}

fn positive(field: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(GraphError::shape(format!("{field} must be positive")));
    }
    Ok(())
}

impl GraphConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| GraphError::shape(format!("invalid graph config: {err}")))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_heads(mut self, num_heads: usize, num_kv_heads: usize) -> Self {
        self.num_heads = num_heads;
        self.num_kv_heads = num_kv_heads;
        self
    }

    pub fn with_intermediate_size(mut self, intermediate_size: usize) -> Self {
        self.intermediate_size = intermediate_size;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_rms_norm_eps(mut self, eps: f32) -> Self {
        self.rms_norm_eps = eps;
        self
    }

    /// Zero when `num_heads` is unset.
    pub fn head_dim(&self) -> usize {
        self.hidden_size.checked_div(self.num_heads).unwrap_or(0)
    }

    pub fn q_size(&self) -> usize {
        self.num_heads * self.head_dim()
    }

    pub fn kv_size(&self) -> usize {
        self.num_kv_heads * self.head_dim()
    }

    /// Query heads sharing each kv head; zero when `num_kv_heads` is unset.
    pub fn queries_per_kv(&self) -> usize {
        self.num_heads.checked_div(self.num_kv_heads).unwrap_or(0)
    }

    /// Checks every field, as needed by `build_model`.
    pub fn validate(&self) -> Result<()> {
        self.validate_attention()?;
        positive("intermediate_size", self.intermediate_size)?;
        self.validate_eps()
    }

    pub(crate) fn validate_dense(&self) -> Result<()> {
        positive("batch_size", self.batch_size)?;
        positive("hidden_size", self.hidden_size)
    }

    pub(crate) fn validate_eps(&self) -> Result<()> {
        if !(self.rms_norm_eps.is_finite() && self.rms_norm_eps >= 0.0) {
            return Err(GraphError::shape(format!(
                "rms_norm_eps must be finite and non-negative, got {}",
                self.rms_norm_eps
            )));
        }
        Ok(())
    }

    pub(crate) fn validate_mlp(&self) -> Result<()> {
        self.validate_dense()?;
        positive("intermediate_size", self.intermediate_size)
    }

    pub(crate) fn validate_attention(&self) -> Result<()> {
        self.validate_dense()?;
        positive("num_heads", self.num_heads)?;
        positive("num_kv_heads", self.num_kv_heads)?;
        if self.hidden_size % self.num_heads != 0 {
            return Err(GraphError::shape(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.queries_per_kv() * self.num_kv_heads != self.num_heads {
            return Err(GraphError::shape(format!(
                "num_heads {} is not divisible by num_kv_heads {}",
                self.num_heads, self.num_kv_heads
            )));
        }
        self.validate_eps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_benchmark_shape() {
        let config = GraphConfig::default();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.kv_size(), 1024);
        assert_eq!(config.queries_per_kv(), 4);
    }

    #[test]
    fn divisibility_is_enforced() {
        let err = GraphConfig::default().with_heads(30, 8).validate().unwrap_err();
        assert!(matches!(err, GraphError::Shape(_)));
        let err = GraphConfig::default().with_heads(32, 6).validate().unwrap_err();
        assert!(err.to_string().contains("num_kv_heads"));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = GraphConfig::from_json_str(r#"{"batch_size": 4, "num_layers": 0}"#).unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.num_layers, 0);
        assert_eq!(config.hidden_size, 4096);
        assert!(GraphConfig::from_json_str("{\"batch_size\": -1}").is_err());
    }

    #[test]
    fn unset_heads_do_not_divide_by_zero() {
        let config = GraphConfig::default().with_heads(0, 0);
        assert_eq!(config.head_dim(), 0);
        assert!(config.validate_dense().is_ok());
        assert!(config.validate_attention().is_err());
    }
}
