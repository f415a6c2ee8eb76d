//! Reinterpreting 1x1 convolution tensors as matmul operands
//!
//! A convolution with unit kernel, unit strides and no padding is a batched
//! matrix multiplication over the flattened spatial dims:
//!
//! ```text
//! src      {n, c, sp...}     <-> {n, [g], c/g, prod(sp)}
//! weights  {[g], o, i, 1...} <-> {1, [g], o, i}
//! bias     {oc}              ->  {1, [g], oc/g, 1}
//! ```
//!
//! The group axis appears only for grouped convolutions. Every function here
//! is a pure descriptor transform; the bytes are never touched.

use crate::error::{Error, Result};
use crate::memory_desc::MemoryDesc;
use crate::op_desc::ConvDesc;
use crate::types::MAX_NDIMS;

/// Shape helper bound to one convolution request
#[derive(Debug, Clone, Copy)]
pub struct MatmulReduction<'a> {
    conv: &'a ConvDesc,
}

impl<'a> MatmulReduction<'a> {
    pub fn new(conv: &'a ConvDesc) -> Self {
        Self { conv }
    }

    /// 1x1 kernel, no padding on either side, unit strides.
    pub fn is_gemm(&self) -> bool {
        let geometry = self.conv.geometry();
        self.conv.kernel().iter().all(|&k| k == 1)
            && geometry.padding_l.iter().all(|&p| p == 0)
            && geometry.padding_r.iter().all(|&p| p == 0)
            && geometry.strides.iter().all(|&s| s == 1)
    }

    fn matmul_ndims(&self) -> usize {
        1 + usize::from(self.conv.with_groups()) + 2
    }

    fn conv_ndims(&self) -> usize {
        usize::from(self.conv.with_groups()) + self.conv.ndims()
    }

    /// Activation `{n, c, sp...}` to `{n, [g], c/g, prod(sp)}`, or back to
    /// the request's original src (`is_dst == false`) or dst dims.
    pub fn reshape_activations(&self, md: &MemoryDesc, to_matmul: bool, is_dst: bool) -> Result<MemoryDesc> {
        let dims = if to_matmul {
            let g = self.conv.groups();
            let mut dims = Vec::with_capacity(self.matmul_ndims());
            dims.push(self.conv.mb());
            if self.conv.with_groups() {
                dims.push(g);
            }
            dims.push(md.dims()[1] / g);
            dims.push(md.dims()[2..].iter().product());
            dims
        } else if is_dst {
            self.conv.dst().dims().to_vec()
        } else {
            self.conv.src().dims().to_vec()
        };
        check_rank(&dims)?;
        md.reshape(&dims)
    }

    /// Weights `{[g], o, i, 1...}` to `{1, [g], o, i}`, or back with unit
    /// kernel extents restored.
    pub fn reshape_weights(&self, md: &MemoryDesc, to_matmul: bool) -> Result<MemoryDesc> {
        let ndims_ch = 2 + usize::from(self.conv.with_groups());
        let dims = if to_matmul {
            let mut dims = Vec::with_capacity(self.matmul_ndims());
            dims.push(1);
            dims.extend_from_slice(&md.dims()[..ndims_ch]);
            dims
        } else {
            let mut dims = md.dims()[1..=ndims_ch].to_vec();
            dims.resize(self.conv_ndims(), 1);
            dims
        };
        check_rank(&dims)?;
        md.reshape(&dims)
    }

    /// Bias `{oc}` to `{1, [g], oc/g, 1}`.
    pub fn reshape_bias(&self, md: &MemoryDesc) -> Result<MemoryDesc> {
        let g = self.conv.groups();
        let mut dims = Vec::with_capacity(self.matmul_ndims());
        dims.push(1);
        if self.conv.with_groups() {
            dims.push(g);
        }
        dims.push(md.dims()[0] / g);
        dims.push(1);
        md.reshape(&dims)
    }
}

/// Swap the last two dims (and their strides).
pub fn transpose_last_two(md: &MemoryDesc) -> Result<MemoryDesc> {
    let ndims = md.ndims();
    if ndims < 2 {
        return Err(Error::invalid(format!("cannot transpose a {ndims}D tensor")));
    }
    let mut perm: Vec<usize> = (0..ndims).collect();
    perm.swap(ndims - 2, ndims - 1);
    md.permute_axes(&perm)
}

fn check_rank(dims: &[usize]) -> Result<()> {
    if dims.len() > MAX_NDIMS {
        return Err(Error::invalid(format!(
            "reshape to rank {} exceeds the maximum of {MAX_NDIMS}",
            dims.len()
        )));
    }
    Ok(())
}
