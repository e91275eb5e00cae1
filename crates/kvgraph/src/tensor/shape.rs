use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Names a symbolic extent such as `vocab` or `pages`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// A single axis extent of a graph slot.
///
/// Bound buffers are always static; graph slots may leave an extent symbolic
/// until the first binding fixes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dim {
    pub fn sym(name: &str) -> Self {
        Dim::Dynamic(DimSymbol::new(name))
    }

    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dim::Static(value) => Some(*value),
            Dim::Dynamic(_) => None,
        }
    }

    /// Two extents may describe the same axis unless both are static and differ.
    pub fn compatible(&self, other: &Dim) -> bool {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) => a == b,
            _ => true,
        }
    }
}

impl From<usize> for Dim {
    fn from(value: usize) -> Self {
        Dim::Static(value)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(value) => write!(f, "{value}"),
            Dim::Dynamic(symbol) => write!(f, "?{}", symbol.as_str()),
        }
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dim>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dim>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dim::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<&Dim> {
        self.dims.get(axis)
    }

    pub fn last(&self) -> Option<&Dim> {
        self.dims.last()
    }

    pub fn into_dims(self) -> Vec<Dim> {
        self.dims
    }

    /// Returns a copy with the last axis replaced.
    pub fn with_last(&self, dim: Dim) -> Self {
        let mut dims = self.dims.clone();
        if let Some(last) = dims.last_mut() {
            *last = dim;
        }
        Self { dims }
    }

    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|dim| matches!(dim, Dim::Static(_)))
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(Dim::as_static).collect()
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(dim.as_static()?)?;
        }
        Some(count)
    }

    /// Rank matches and every axis pair is [`Dim::compatible`].
    pub fn compatible(&self, other: &Shape) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(a, b)| a.compatible(b))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &DimSymbol> {
        self.dims.iter().filter_map(|dim| match dim {
            Dim::Dynamic(symbol) => Some(symbol),
            Dim::Static(_) => None,
        })
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_static(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::from_static(&dims)
    }
}

impl From<Vec<Dim>> for Shape {
    fn from(dims: Vec<Dim>) -> Self {
        Shape::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_dims_are_compatible_with_anything() {
        let slot = Shape::new(vec![Dim::sym("pages"), Dim::Static(128), Dim::Static(1024)]);
        let bound = Shape::from([64, 128, 1024]);
        assert!(slot.compatible(&bound));
        assert!(!slot.compatible(&Shape::from([64, 64, 1024])));
        assert!(!slot.compatible(&Shape::from([64, 128])));
    }

    #[test]
    fn element_count_requires_static_dims() {
        assert_eq!(Shape::from([2, 3, 4]).element_count(), Some(24));
        assert_eq!(Shape::new(vec![Dim::sym("vocab"), Dim::Static(8)]).element_count(), None);
        assert_eq!(Shape::from([0, 7]).element_count(), Some(0));
    }

    #[test]
    fn display_marks_symbols() {
        let shape = Shape::new(vec![Dim::Static(32), Dim::sym("vocab")]);
        assert_eq!(shape.to_string(), "[32, ?vocab]");
    }
}
