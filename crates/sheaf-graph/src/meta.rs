//! Tensor metadata attached to graph nodes.

use std::fmt;

/// N-dimensional shape descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a shape from dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Create a shape from a slice of dimension sizes.
    pub fn from_slice(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    /// Scalar shape (0 dimensions, 1 element).
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    /// Flat 1-D shape holding `numel` elements.
    pub fn flat(numel: usize) -> Self {
        Self { dims: vec![numel] }
    }

    /// Number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Dimension sizes.
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements (product of dimensions).
    #[inline]
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Element type of a tensor value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit float (training default).
    #[default]
    F32,
    /// 64-bit float.
    F64,
    /// bfloat16.
    Bf16,
}

impl DType {
    /// Width of one element in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
            Self::Bf16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F64 => write!(f, "f64"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

/// Memory layout of a tensor value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Layout {
    /// Row-major contiguous.
    #[default]
    Contiguous,
    /// Arbitrary strides (views into larger storage).
    Strided,
}

/// Shape/dtype/layout of the value a node produces.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorMeta {
    pub shape: Shape,
    pub dtype: DType,
    pub layout: Layout,
}

impl TensorMeta {
    /// Contiguous metadata with the given shape and dtype.
    pub fn new(shape: Shape, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            layout: Layout::Contiguous,
        }
    }

    /// Contiguous f32 metadata (the common case for gradients).
    pub fn f32(shape: Shape) -> Self {
        Self::new(shape, DType::F32)
    }

    /// Flat 1-D f32 metadata, used for staging buffers.
    pub fn flat_f32(numel: usize) -> Self {
        Self::new(Shape::flat(numel), DType::F32)
    }

    /// Total element count.
    #[inline]
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Total byte size (`numel` times the element width).
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_numel() {
        assert_eq!(Shape::from_slice(&[10, 20]).numel(), 200);
        assert_eq!(Shape::flat(8).numel(), 8);
        assert_eq!(Shape::scalar().numel(), 1);
        assert_eq!(Shape::scalar().ndim(), 0);
    }

    #[test]
    fn meta_size_bytes() {
        let m = TensorMeta::f32(Shape::from_slice(&[4, 4]));
        assert_eq!(m.numel(), 16);
        assert_eq!(m.size_bytes(), 64);

        let m = TensorMeta::new(Shape::flat(16), DType::Bf16);
        assert_eq!(m.size_bytes(), 32);
    }
}
