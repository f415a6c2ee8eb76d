//! Primitive attributes: fused post-operations
//!
//! Post-ops are applied to a primitive's destination in order, after the
//! main computation. `Sum` accumulates into the prior contents of the
//! destination, which is why the convolution pipeline has to reorder the
//! destination *into* scratch before computing when a sum is present.

use crate::memory_desc::MemoryDesc;

/// Element-wise algorithm
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EltwiseAlg {
    /// `x > 0 ? x : alpha * x`
    Relu,
    /// `alpha * x + beta`
    Linear,
}

impl EltwiseAlg {
    pub fn apply(self, x: f32, alpha: f32, beta: f32) -> f32 {
        match self {
            EltwiseAlg::Relu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            EltwiseAlg::Linear => alpha * x + beta,
        }
    }
}

/// Binary algorithm combining the destination with a second operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryAlg {
    Add,
    Mul,
}

impl BinaryAlg {
    pub fn apply(self, x: f32, y: f32) -> f32 {
        match self {
            BinaryAlg::Add => x + y,
            BinaryAlg::Mul => x * y,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// `dst = scale * dst_prior + dst`
    Sum { scale: f32 },
    Eltwise { alg: EltwiseAlg, alpha: f32, beta: f32 },
    /// Second operand is bound as [`crate::Arg::PostOpSrc1`] with this
    /// post-op's index; its dims broadcast against the destination.
    Binary { alg: BinaryAlg, src1: MemoryDesc },
}

/// Ordered chain of post-ops
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOps {
    ops: Vec<PostOp>,
}

impl PostOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_sum(&mut self, scale: f32) -> &mut Self {
        self.ops.push(PostOp::Sum { scale });
        self
    }

    pub fn append_eltwise(&mut self, alg: EltwiseAlg, alpha: f32, beta: f32) -> &mut Self {
        self.ops.push(PostOp::Eltwise { alg, alpha, beta });
        self
    }

    pub fn append_binary(&mut self, alg: BinaryAlg, src1: MemoryDesc) -> &mut Self {
        self.ops.push(PostOp::Binary { alg, src1 });
        self
    }

    pub fn push(&mut self, op: PostOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PostOp> {
        self.ops.iter()
    }

    /// Index of the first sum post-op.
    pub fn find_sum(&self) -> Option<usize> {
        self.ops.iter().position(|op| matches!(op, PostOp::Sum { .. }))
    }

    /// Second operand descriptor of the binary post-op at `index`.
    pub fn binary_src1(&self, index: usize) -> Option<&MemoryDesc> {
        match self.ops.get(index) {
            Some(PostOp::Binary { src1, .. }) => Some(src1),
            _ => None,
        }
    }

    pub fn has_binary(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, PostOp::Binary { .. }))
    }
}

impl<'a> IntoIterator for &'a PostOps {
    type Item = &'a PostOp;
    type IntoIter = std::slice::Iter<'a, PostOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

/// Attributes attached to a primitive descriptor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimitiveAttr {
    pub post_ops: PostOps,
}

impl PrimitiveAttr {
    pub fn new(post_ops: PostOps) -> Self {
        Self { post_ops }
    }

    pub fn has_default_values(&self) -> bool {
        self.post_ops.is_empty()
    }
}
