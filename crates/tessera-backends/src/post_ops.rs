//! Post-op application shared by the reference kernels

use crate::tensor::{check_f32, load, store};
use tessera_core::memory_desc::row_major_strides;
use tessera_core::scratchpad::Key;
use tessera_core::{Arg, DataType, Error, ExecCtx, Memory, MemoryDesc, PostOp, PostOps, Result};

/// Reject post-op chains a kernel writing `dst_dims` cannot apply.
pub(crate) fn check_post_ops(post_ops: &PostOps, dst_dims: &[usize]) -> Result<()> {
    for (index, op) in post_ops.iter().enumerate() {
        if let PostOp::Binary { src1, .. } = op {
            check_f32(src1, "binary post-op operand")?;
            let broadcasts = src1.ndims() == dst_dims.len()
                && src1.dims().iter().zip(dst_dims).all(|(&s, &d)| s == d || s == 1);
            if !broadcasts || src1.is_any() {
                return Err(Error::UnsupportedAttr(format!(
                    "post-op {index}: operand {src1} does not broadcast to {dst_dims:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Apply `post_ops` in order to `values`, the logical row-major result for
/// `dst`. A sum reads the destination's prior contents, so it must be
/// called before `dst` is overwritten.
pub(crate) fn apply_post_ops(post_ops: &PostOps, ctx: &ExecCtx<'_>, dst: &Memory, values: &mut [f32]) -> Result<()> {
    if post_ops.is_empty() {
        return Ok(());
    }
    let prior = match post_ops.find_sum() {
        Some(_) => Some(load(dst)?),
        None => None,
    };
    let dst_dims = dst.desc().dims();

    for (index, op) in post_ops.iter().enumerate() {
        match op {
            PostOp::Sum { scale } => {
                if let Some(prior) = &prior {
                    for (value, &old) in values.iter_mut().zip(prior) {
                        *value += scale * old;
                    }
                }
            }
            PostOp::Eltwise { alg, alpha, beta } => {
                for value in values.iter_mut() {
                    *value = alg.apply(*value, *alpha, *beta);
                }
            }
            PostOp::Binary { alg, .. } => {
                let src1 = ctx.input(Arg::PostOpSrc1(index))?;
                let operand = load(src1)?;
                let map = BroadcastMap::new(src1.desc().dims(), dst_dims);
                for (i, value) in values.iter_mut().enumerate() {
                    *value = alg.apply(*value, operand[map.source(i)]);
                }
            }
        }
    }
    Ok(())
}

/// Stage a kernel result in its accumulator region, apply `post_ops` and
/// store it into `dst`.
pub(crate) fn write_output(
    ctx: &ExecCtx<'_>,
    accumulator: Key,
    post_ops: &PostOps,
    dst: &Memory,
    values: &[f32],
) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let staging = Memory::new(
        MemoryDesc::plain(dst.desc().dims().to_vec(), DataType::F32)?,
        ctx.scratchpad().get(accumulator)?,
    )?;
    staging.write(values)?;
    let mut staged = staging.read::<f32>()?;
    apply_post_ops(post_ops, ctx, dst, &mut staged)?;
    store(dst, &staged)
}

/// Maps a logical destination position to the broadcast operand position.
pub(crate) struct BroadcastMap {
    dst_strides: Vec<usize>,
    src_strides: Vec<usize>,
    src_dims: Vec<usize>,
}

impl BroadcastMap {
    pub(crate) fn new(src_dims: &[usize], dst_dims: &[usize]) -> Self {
        Self {
            dst_strides: row_major_strides(dst_dims),
            src_strides: row_major_strides(src_dims),
            src_dims: src_dims.to_vec(),
        }
    }

    pub(crate) fn source(&self, mut dst_pos: usize) -> usize {
        let mut src_pos = 0;
        for d in 0..self.dst_strides.len() {
            let coord = dst_pos / self.dst_strides[d];
            dst_pos %= self.dst_strides[d];
            if self.src_dims[d] != 1 {
                src_pos += coord * self.src_strides[d];
            }
        }
        src_pos
    }
}
