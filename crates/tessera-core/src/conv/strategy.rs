use crate::attr::{PostOp, PrimitiveAttr};
use crate::config::EngineConfig;
use crate::conv::reduction::MatmulReduction;
use crate::op_desc::ConvDesc;
use std::fmt;

/// How a channel-major convolution is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Reorder activations to channel-last and delegate to a convolution
    Reformat,
    /// Reinterpret the tensors and delegate to a matmul
    MatmulReduced,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Reformat => f.write_str("reformat"),
            Strategy::MatmulReduced => f.write_str("matmul"),
        }
    }
}

/// Pick the strategy for a request. Evaluated once, at creation.
///
/// The matmul path requires a 1x1/unit-stride/unpadded convolution, the
/// `matmul_reduction` switch, a propagation kind with a matmul formulation
/// (backward-weights has none) and post-ops the matmul can take over after
/// the fused bias. Binary post-ops are broadcast against channel-major dst
/// dims and stay on the reformat path.
pub fn select_strategy(conv: &ConvDesc, attr: &PrimitiveAttr, config: &EngineConfig) -> Strategy {
    let forwardable = attr
        .post_ops
        .iter()
        .all(|op| matches!(op, PostOp::Sum { .. } | PostOp::Eltwise { .. }));

    let eligible = config.matmul_reduction
        && !conv.prop_kind().is_bwd_weights()
        && forwardable
        && MatmulReduction::new(conv).is_gemm();

    if eligible {
        Strategy::MatmulReduced
    } else {
        Strategy::Reformat
    }
}
