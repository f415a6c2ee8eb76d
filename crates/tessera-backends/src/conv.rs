//! Reference direct convolution over channel-last activations.
//!
//! Handles forward (with post-ops), backward-data and backward-weights for
//! 1-3 spatial dims, grouped or not. Only channel-last (`nwc`, `nhwc`,
//! `ndhwc`) activations are accepted, which makes it the compute fallback a
//! channel-major composite negotiates after reordering.

use crate::post_ops::{check_post_ops, write_output};
use crate::tensor::{check_f32, load, resolve_any, store};
use rayon::prelude::*;
use std::sync::Arc;
use tessera_core::scratchpad::{Key, ScratchpadRegistry};
use tessera_core::{
    AlgKind, Arg, ConvDesc, Engine, Error, ExecCtx, FormatTag, MemoryDesc, OpDesc, Primitive, PrimitiveAttr,
    PrimitiveDesc, PropKind, Result,
};
use tessera_tracing::perf_span;

pub const REF_NSPC_CONV_ID: &str = "ref:nspc_conv";

#[derive(Debug)]
pub struct RefNspcConvolutionPd {
    op: OpDesc,
    conv: ConvDesc,
    attr: PrimitiveAttr,
    registry: ScratchpadRegistry,
}

impl RefNspcConvolutionPd {
    #[tracing::instrument(skip_all, fields(implementation = REF_NSPC_CONV_ID))]
    pub fn create(op: &OpDesc, attr: &PrimitiveAttr, _engine: &Engine) -> Result<Arc<Self>> {
        let conv = op
            .as_conv()
            .ok_or_else(|| Error::invalid(format!("expected a convolution, got {}", op.kind())))?;
        let conv = match conv.alg_kind() {
            AlgKind::Auto => conv.with_alg_kind(AlgKind::Direct),
            AlgKind::Direct => conv.clone(),
            other => return Err(Error::UnsupportedAlgorithm(format!("{other:?}"))),
        };

        let tag = FormatTag::nspc(conv.ndims())?;
        for (arg, md) in [(conv.src_arg(), conv.src()), (conv.dst_arg(), conv.dst())] {
            if !md.matches_tag(tag) {
                return Err(Error::unsupported_tag(format!("{arg} must be {tag}, got {md}")));
            }
        }
        for md in [Some(conv.src()), Some(conv.weights()), conv.bias(), Some(conv.dst())]
            .into_iter()
            .flatten()
        {
            check_f32(md, "convolution operand")?;
        }
        if conv.prop_kind().is_fwd() {
            check_post_ops(&attr.post_ops, conv.dst().dims())?;
        } else if !attr.has_default_values() {
            return Err(Error::UnsupportedAttr("post-ops apply to forward propagation only".into()));
        }

        let conv = conv.with_weights(resolve_any(conv.weights()), conv.bias().map(resolve_any))?;

        let output = match conv.prop_kind() {
            PropKind::BackwardData => conv.src(),
            PropKind::BackwardWeights => conv.weights(),
            _ => conv.dst(),
        };
        let mut registry = ScratchpadRegistry::new();
        registry
            .registrar()
            .book(Key::ConvAccumulator, output.nelems(), output.data_type().size())?;

        Ok(Arc::new(Self {
            op: OpDesc::Convolution(conv.clone()),
            conv,
            attr: attr.clone(),
            registry,
        }))
    }
}

impl PrimitiveDesc for RefNspcConvolutionPd {
    fn name(&self) -> &'static str {
        REF_NSPC_CONV_ID
    }

    fn op_desc(&self) -> &OpDesc {
        &self.op
    }

    fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    fn arg_md(&self, arg: Arg) -> Option<&MemoryDesc> {
        match arg {
            Arg::PostOpSrc1(index) => self.attr.post_ops.binary_src1(index),
            _ => self.conv.arg_md(arg),
        }
    }

    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.registry
    }

    fn create_primitive(self: Arc<Self>, _engine: &Engine) -> Result<Arc<dyn Primitive>> {
        let shape = ConvShape::new(&self.conv);
        Ok(Arc::new(RefNspcConvolution { pd: self, shape }))
    }
}

/// Convolution geometry with spatial dims padded to three (depth, height,
/// width); missing leading dims have extent 1.
#[derive(Debug, Clone)]
struct ConvShape {
    g: usize,
    mb: usize,
    icg: usize,
    ocg: usize,
    isp: [usize; 3],
    osp: [usize; 3],
    ksp: [usize; 3],
    strides: [usize; 3],
    dilates: [usize; 3],
    pad_l: [usize; 3],
}

impl ConvShape {
    fn new(conv: &ConvDesc) -> Self {
        let geometry = conv.geometry();
        let lift = |values: &[usize], fill: usize| {
            let mut out = [fill; 3];
            out[3 - values.len()..].copy_from_slice(values);
            out
        };
        let g = conv.groups();
        Self {
            g,
            mb: conv.mb(),
            icg: conv.ic() / g,
            ocg: conv.oc() / g,
            isp: lift(conv.src_spatial(), 1),
            osp: lift(conv.dst_spatial(), 1),
            ksp: lift(conv.kernel(), 1),
            strides: lift(geometry.strides.as_slice(), 1),
            dilates: lift(geometry.dilates.as_slice(), 0),
            pad_l: lift(geometry.padding_l.as_slice(), 0),
        }
    }

    fn ic(&self) -> usize {
        self.g * self.icg
    }

    fn oc(&self) -> usize {
        self.g * self.ocg
    }

    fn isp_size(&self) -> usize {
        self.isp.iter().product()
    }

    fn osp_size(&self) -> usize {
        self.osp.iter().product()
    }

    fn ksp_size(&self) -> usize {
        self.ksp.iter().product()
    }

    /// Flat input position read by output position `o` through kernel tap
    /// `k`, or `None` when it falls into padding.
    fn input_pos(&self, o: [usize; 3], k: [usize; 3]) -> Option<usize> {
        let mut flat = 0;
        for d in 0..3 {
            let pos = (o[d] * self.strides[d] + k[d] * (self.dilates[d] + 1)) as isize - self.pad_l[d] as isize;
            if pos < 0 || pos as usize >= self.isp[d] {
                return None;
            }
            flat = flat * self.isp[d] + pos as usize;
        }
        Some(flat)
    }

    /// Every `(output, kernel tap, input)` triple of flat spatial positions.
    fn taps(&self) -> Vec<(usize, usize, usize)> {
        let mut taps = Vec::new();
        for (o_flat, o) in grid(self.osp).enumerate() {
            for (k_flat, k) in grid(self.ksp).enumerate() {
                if let Some(i_flat) = self.input_pos(o, k) {
                    taps.push((o_flat, k_flat, i_flat));
                }
            }
        }
        taps
    }
}

/// Row-major iteration over a 3-D extent.
fn grid(extent: [usize; 3]) -> impl Iterator<Item = [usize; 3]> {
    let [d, h, w] = extent;
    (0..d).flat_map(move |a| (0..h).flat_map(move |b| (0..w).map(move |c| [a, b, c])))
}

pub struct RefNspcConvolution {
    pd: Arc<RefNspcConvolutionPd>,
    shape: ConvShape,
}

impl RefNspcConvolution {
    fn forward(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let s = &self.shape;
        let src = load(ctx.input(Arg::Src)?)?;
        let weights = load(ctx.input(Arg::Weights)?)?;
        let bias = match self.pd.conv.bias() {
            Some(_) => Some(load(ctx.input(Arg::Bias)?)?),
            None => None,
        };
        let dst = ctx.output(Arg::Dst)?;
        let taps = s.taps();
        let (isp, osp, ksp) = (s.isp_size(), s.osp_size(), s.ksp_size());

        let mut values = vec![0.0f32; s.mb * s.oc() * osp];
        if osp > 0 {
            // one chunk per (n, oc) output plane
            values.par_chunks_mut(osp).enumerate().for_each(|(plane, out)| {
                let (n, oc) = (plane / s.oc(), plane % s.oc());
                let (g, o) = (oc / s.ocg, oc % s.ocg);
                for i in 0..s.icg {
                    let ic = g * s.icg + i;
                    let src_plane = &src[(n * s.ic() + ic) * isp..][..isp];
                    let w = &weights[((g * s.ocg + o) * s.icg + i) * ksp..][..ksp];
                    for &(o_flat, k_flat, i_flat) in &taps {
                        out[o_flat] += src_plane[i_flat] * w[k_flat];
                    }
                }
                if let Some(bias) = &bias {
                    out.iter_mut().for_each(|v| *v += bias[oc]);
                }
            });
        }

        write_output(ctx, Key::ConvAccumulator, &self.pd.attr.post_ops, dst, &values)
    }

    fn backward_data(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let s = &self.shape;
        let diff_dst = load(ctx.input(Arg::DiffDst)?)?;
        let weights = load(ctx.input(Arg::Weights)?)?;
        let diff_src = ctx.output(Arg::DiffSrc)?;
        let taps = s.taps();
        let (isp, osp, ksp) = (s.isp_size(), s.osp_size(), s.ksp_size());

        let mut values = vec![0.0f32; s.mb * s.ic() * isp];
        if isp > 0 {
            // one chunk per (n, ic) input plane
            values.par_chunks_mut(isp).enumerate().for_each(|(plane, out)| {
                let (n, ic) = (plane / s.ic(), plane % s.ic());
                let (g, i) = (ic / s.icg, ic % s.icg);
                for o in 0..s.ocg {
                    let oc = g * s.ocg + o;
                    let dd = &diff_dst[(n * s.oc() + oc) * osp..][..osp];
                    let w = &weights[((g * s.ocg + o) * s.icg + i) * ksp..][..ksp];
                    for &(o_flat, k_flat, i_flat) in &taps {
                        out[i_flat] += dd[o_flat] * w[k_flat];
                    }
                }
            });
        }

        write_output(ctx, Key::ConvAccumulator, &self.pd.attr.post_ops, diff_src, &values)
    }

    fn backward_weights(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let s = &self.shape;
        let src = load(ctx.input(Arg::Src)?)?;
        let diff_dst = load(ctx.input(Arg::DiffDst)?)?;
        let diff_weights = ctx.output(Arg::DiffWeights)?;
        let taps = s.taps();
        let (isp, osp, ksp) = (s.isp_size(), s.osp_size(), s.ksp_size());

        let mut values = vec![0.0f32; s.oc() * s.icg * ksp];
        if ksp > 0 {
            // one chunk per (g, o, i) kernel
            values.par_chunks_mut(ksp).enumerate().for_each(|(kernel, out)| {
                let (oc, i) = (kernel / s.icg, kernel % s.icg);
                let ic = (oc / s.ocg) * s.icg + i;
                for n in 0..s.mb {
                    let dd = &diff_dst[(n * s.oc() + oc) * osp..][..osp];
                    let src_plane = &src[(n * s.ic() + ic) * isp..][..isp];
                    for &(o_flat, k_flat, i_flat) in &taps {
                        out[k_flat] += dd[o_flat] * src_plane[i_flat];
                    }
                }
            });
        }
        write_output(ctx, Key::ConvAccumulator, &self.pd.attr.post_ops, diff_weights, &values)?;

        if self.pd.conv.bias().is_some() {
            let diff_bias: Vec<f32> = (0..s.oc())
                .map(|oc| {
                    (0..s.mb)
                        .map(|n| diff_dst[(n * s.oc() + oc) * osp..][..osp].iter().sum::<f32>())
                        .sum()
                })
                .collect();
            store(ctx.output(Arg::DiffBias)?, &diff_bias)?;
        }
        Ok(())
    }
}

impl Primitive for RefNspcConvolution {
    fn pd(&self) -> &dyn PrimitiveDesc {
        self.pd.as_ref()
    }

    fn execute(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let prop_kind = self.pd.conv.prop_kind();
        let _span = perf_span!("ref_nspc_conv", prop_kind = tracing::field::display(prop_kind));
        match prop_kind {
            PropKind::ForwardTraining | PropKind::ForwardInference => self.forward(ctx),
            PropKind::BackwardData => self.backward_data(ctx),
            PropKind::BackwardWeights => self.backward_weights(ctx),
        }
    }
}
