use std::collections::BTreeMap;

use crate::ensure_shape;
use crate::error::{GraphError, Result};
use crate::tensor::{Dim, DimSymbol, Shape, TensorDesc};

/// Values of the symbolic extents seen while binding one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DimBindings {
    symbols: BTreeMap<DimSymbol, usize>,
}

impl DimBindings {
    /// Matches a slot's expected shape against a bound buffer's dims, fixing
    /// any symbol seen for the first time.
    pub(crate) fn unify(&mut self, slot: &str, expected: &Shape, actual: &[usize]) -> Result<()> {
        ensure_shape!(
            expected.rank() == actual.len(),
            "slot {slot} expects rank {} {expected}, bound buffer has dims {actual:?}",
            expected.rank()
        );
        for (axis, (dim, extent)) in expected.dims().iter().zip(actual).enumerate() {
            match dim {
                Dim::Static(value) => ensure_shape!(
                    value == extent,
                    "slot {slot} axis {axis} expects {value}, bound buffer has {extent}"
                ),
                Dim::Dynamic(symbol) => match self.symbols.get(symbol) {
                    Some(bound) => ensure_shape!(
                        bound == extent,
                        "slot {slot} axis {axis} binds ?{} to {extent}, but it is already {bound}",
                        symbol.as_str()
                    ),
                    None => {
                        self.symbols.insert(symbol.clone(), *extent);
                    }
                },
            }
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, shape: &Shape) -> Result<Vec<usize>> {
        shape
            .dims()
            .iter()
            .map(|dim| match dim {
                Dim::Static(value) => Ok(*value),
                Dim::Dynamic(symbol) => self.symbols.get(symbol).copied().ok_or_else(|| {
                    GraphError::shape(format!(
                        "extent ?{} is not fixed by any bound buffer",
                        symbol.as_str()
                    ))
                }),
            })
            .collect()
    }

    /// Static descriptor of a slot under these bindings.
    pub(crate) fn resolve_desc(&self, desc: &TensorDesc) -> Result<TensorDesc> {
        let dims = self.resolve(&desc.shape)?;
        Ok(TensorDesc::new(dims.as_slice(), desc.dtype).with_layout(desc.layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_bind_once() {
        let cache = Shape::new(vec![Dim::sym("pages"), Dim::sym("page_size"), Dim::Static(32)]);
        let mut bindings = DimBindings::default();
        bindings.unify("key_cache", &cache, &[4, 16, 32]).unwrap();
        bindings.unify("value_cache", &cache, &[4, 16, 32]).unwrap();
        let err = bindings
            .unify("other_cache", &cache, &[8, 16, 32])
            .unwrap_err();
        assert!(err.to_string().contains("?pages"));
        assert_eq!(bindings.resolve(&cache).unwrap(), vec![4, 16, 32]);
    }

    #[test]
    fn static_and_rank_mismatches_are_shape_errors() {
        let mut bindings = DimBindings::default();
        let shape = Shape::from([2, 8]);
        assert!(matches!(
            bindings.unify("x", &shape, &[2, 9]),
            Err(GraphError::Shape(_))
        ));
        assert!(matches!(
            bindings.unify("x", &shape, &[16]),
            Err(GraphError::Shape(_))
        ));
        let unresolved = Shape::new(vec![Dim::sym("vocab")]);
        assert!(bindings.resolve(&unresolved).is_err());
    }
}
