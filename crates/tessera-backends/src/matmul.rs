//! Reference batched matmul with broadcasting and post-ops.
//!
//! `dst[b, m, n] = sum_k src[b, m, k] * weights[b, k, n] (+ bias)`, with
//! leading dims of size 1 repeated across the batch. Output rows are
//! computed in parallel with rayon.

use crate::post_ops::{check_post_ops, write_output, BroadcastMap};
use crate::tensor::{check_f32, load, resolve_any};
use rayon::prelude::*;
use std::sync::Arc;
use tessera_core::memory_desc::row_major_strides;
use tessera_core::scratchpad::{Key, ScratchpadRegistry};
use tessera_core::{
    Arg, Engine, Error, ExecCtx, MatmulDesc, MemoryDesc, OpDesc, Primitive, PrimitiveAttr, PrimitiveDesc, Result,
};
use tessera_tracing::perf_span;

pub const REF_MATMUL_ID: &str = "ref:matmul";

#[derive(Debug)]
pub struct RefMatmulPd {
    op: OpDesc,
    attr: PrimitiveAttr,
    registry: ScratchpadRegistry,
}

impl RefMatmulPd {
    pub fn create(op: &OpDesc, attr: &PrimitiveAttr, _engine: &Engine) -> Result<Arc<Self>> {
        let matmul = op
            .as_matmul()
            .ok_or_else(|| Error::invalid(format!("expected a matmul, got {}", op.kind())))?;
        check_f32(matmul.src(), "src")?;
        check_f32(matmul.weights(), "weights")?;
        check_f32(matmul.dst(), "dst")?;
        if let Some(bias) = matmul.bias() {
            check_f32(bias, "bias")?;
        }
        check_post_ops(&attr.post_ops, matmul.dst().dims())?;

        let resolved = MatmulDesc::new(
            resolve_any(matmul.src()),
            resolve_any(matmul.weights()),
            matmul.bias().map(resolve_any),
            resolve_any(matmul.dst()),
        )?;

        let mut registry = ScratchpadRegistry::new();
        registry
            .registrar()
            .book(Key::MatmulAccumulator, resolved.dst().nelems(), resolved.dst().data_type().size())?;

        Ok(Arc::new(Self {
            op: OpDesc::Matmul(resolved),
            attr: attr.clone(),
            registry,
        }))
    }

    fn desc(&self) -> Result<&MatmulDesc> {
        self.op
            .as_matmul()
            .ok_or_else(|| Error::runtime("matmul descriptor lost its operation"))
    }
}

impl PrimitiveDesc for RefMatmulPd {
    fn name(&self) -> &'static str {
        REF_MATMUL_ID
    }

    fn op_desc(&self) -> &OpDesc {
        &self.op
    }

    fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    fn arg_md(&self, arg: Arg) -> Option<&MemoryDesc> {
        let matmul = self.op.as_matmul()?;
        match arg {
            Arg::Src => Some(matmul.src()),
            Arg::Weights => Some(matmul.weights()),
            Arg::Bias => matmul.bias(),
            Arg::Dst => Some(matmul.dst()),
            Arg::PostOpSrc1(index) => self.attr.post_ops.binary_src1(index),
            _ => None,
        }
    }

    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.registry
    }

    fn create_primitive(self: Arc<Self>, _engine: &Engine) -> Result<Arc<dyn Primitive>> {
        Ok(Arc::new(RefMatmul { pd: self }))
    }
}

pub struct RefMatmul {
    pd: Arc<RefMatmulPd>,
}

/// Element offsets of each dst batch in the two (possibly broadcast) inputs.
fn batch_offsets(src_dims: &[usize], weights_dims: &[usize], dst_dims: &[usize]) -> Vec<(usize, usize)> {
    let nb = dst_dims.len() - 2;
    let src_strides = row_major_strides(src_dims);
    let weights_strides = row_major_strides(weights_dims);
    let batch: usize = dst_dims[..nb].iter().product();

    (0..batch)
        .map(|mut b| {
            let (mut s, mut w) = (0, 0);
            for d in (0..nb).rev() {
                let coord = b % dst_dims[d];
                b /= dst_dims[d];
                if src_dims[d] != 1 {
                    s += coord * src_strides[d];
                }
                if weights_dims[d] != 1 {
                    w += coord * weights_strides[d];
                }
            }
            (s, w)
        })
        .collect()
}

impl Primitive for RefMatmul {
    fn pd(&self) -> &dyn PrimitiveDesc {
        self.pd.as_ref()
    }

    fn execute(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let desc = self.pd.desc()?;
        let src = ctx.input(Arg::Src)?;
        let weights = ctx.input(Arg::Weights)?;
        let dst = ctx.output(Arg::Dst)?;

        let nd = desc.dst().ndims();
        let (m, k, n) = (desc.src().dims()[nd - 2], desc.src().dims()[nd - 1], desc.dst().dims()[nd - 1]);
        let _span = perf_span!("ref_matmul", m = m, k = k, n = n);

        let a = load(src)?;
        let b = load(weights)?;
        let offsets = batch_offsets(desc.src().dims(), desc.weights().dims(), desc.dst().dims());

        let mut values = vec![0.0f32; desc.dst().nelems()];
        if n > 0 {
            values.par_chunks_mut(n).enumerate().for_each(|(row, out)| {
                let (a_off, b_off) = offsets[row / m];
                let a_row = &a[a_off + (row % m) * k..][..k];
                for (kk, &a_val) in a_row.iter().enumerate() {
                    let b_row = &b[b_off + kk * n..][..n];
                    for (o, &b_val) in out.iter_mut().zip(b_row) {
                        *o += a_val * b_val;
                    }
                }
            });
        }

        if let Some(bias_md) = desc.bias() {
            let bias = load(ctx.input(Arg::Bias)?)?;
            let map = BroadcastMap::new(bias_md.dims(), desc.dst().dims());
            for (i, value) in values.iter_mut().enumerate() {
                *value += bias[map.source(i)];
            }
        }

        write_output(ctx, Key::MatmulAccumulator, &self.pd.attr.post_ops, dst, &values)
    }
}
