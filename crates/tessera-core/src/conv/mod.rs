//! Channel-major ("ncsp") convolution composites
//!
//! Optimized convolution kernels want channel-last activations. The
//! composites in this module accept channel-major requests and either
//!
//! * reorder the activations to channel-last scratch buffers and delegate to
//!   whichever channel-last convolution the engine negotiates, or
//! * for 1x1/unit-stride/unpadded convolutions, reinterpret the tensors as
//!   matmul operands and delegate to a matmul, with no data movement.
//!
//! One composite exists per propagation kind. Each registers under its own
//! implementation id and excludes that id when negotiating its compute
//! sub-primitive, so a composite never selects itself.

pub mod reduction;
pub mod strategy;

mod bwd_data;
mod bwd_weights;
mod fwd;

pub use bwd_data::{NcspConvolutionBwdData, NcspConvolutionBwdDataPd};
pub use bwd_weights::{NcspConvolutionBwdWeights, NcspConvolutionBwdWeightsPd};
pub use fwd::{NcspConvolutionFwd, NcspConvolutionFwdPd};

use crate::attr::PrimitiveAttr;
use crate::engine::{Engine, ImplListItem};
use crate::error::{Error, Result};
use crate::memory_desc::{FormatTag, MemoryDesc};
use crate::op_desc::{ConvDesc, OpDesc, ReorderDesc};
use crate::primitive::{ExecArgs, ExecCtx, MemoryArg, Primitive, PrimitiveDesc};
use crate::scratchpad::{Key, Nested};
use crate::storage::Memory;
use crate::types::{AlgKind, Arg, CpuIsa, DataType};
use std::sync::Arc;
use tessera_tracing::perf_span;

pub const NCSP_FWD_ID: &str = "ncsp:fwd";
pub const NCSP_BWD_DATA_ID: &str = "ncsp:bwd_data";
pub const NCSP_BWD_WEIGHTS_ID: &str = "ncsp:bwd_weights";

/// Lowest instruction set the composites run on.
pub const NCSP_MIN_ISA: CpuIsa = CpuIsa::Avx512Core;

/// Implementation list entry for the forward composite.
pub fn ncsp_fwd_impl() -> ImplListItem {
    ImplListItem::new(NCSP_FWD_ID, |op, attr, engine| {
        Ok(NcspConvolutionFwdPd::create(op, attr, engine)? as Arc<dyn PrimitiveDesc>)
    })
}

/// Implementation list entry for the backward-data composite.
pub fn ncsp_bwd_data_impl() -> ImplListItem {
    ImplListItem::new(NCSP_BWD_DATA_ID, |op, attr, engine| {
        Ok(NcspConvolutionBwdDataPd::create(op, attr, engine)? as Arc<dyn PrimitiveDesc>)
    })
}

/// Implementation list entry for the backward-weights composite.
pub fn ncsp_bwd_weights_impl() -> ImplListItem {
    ImplListItem::new(NCSP_BWD_WEIGHTS_ID, |op, attr, engine| {
        Ok(NcspConvolutionBwdWeightsPd::create(op, attr, engine)? as Arc<dyn PrimitiveDesc>)
    })
}

fn as_conv(op: &OpDesc) -> Result<&ConvDesc> {
    op.as_conv()
        .ok_or_else(|| Error::invalid(format!("expected a convolution, got {}", op.kind())))
}

fn check_default_attr(attr: &PrimitiveAttr) -> Result<()> {
    if attr.has_default_values() {
        Ok(())
    } else {
        Err(Error::UnsupportedAttr("post-ops are not supported for backward propagation".into()))
    }
}

fn check_not_empty(conv: &ConvDesc) -> Result<()> {
    let empty = [Some(conv.src()), Some(conv.weights()), conv.bias(), Some(conv.dst())]
        .into_iter()
        .flatten()
        .any(MemoryDesc::has_zero_dim);
    if empty {
        return Err(Error::EmptyTensor(format!(
            "src {:?}, weights {:?}, dst {:?}",
            conv.src().dims(),
            conv.weights().dims(),
            conv.dst().dims()
        )));
    }
    Ok(())
}

/// Resolve `Auto` to `Direct`; other algorithms are not handled here.
fn set_default_alg_kind(conv: &ConvDesc) -> Result<ConvDesc> {
    match conv.alg_kind() {
        AlgKind::Auto => Ok(conv.with_alg_kind(AlgKind::Direct)),
        AlgKind::Direct => Ok(conv.clone()),
        other => Err(Error::UnsupportedAlgorithm(format!("{other:?}"))),
    }
}

fn check_ncsp(md: &MemoryDesc, arg: Arg) -> Result<()> {
    let tag = FormatTag::ncsp(md.ndims())?;
    if md.matches_tag(tag) {
        Ok(())
    } else {
        Err(Error::unsupported_tag(format!("{arg} must be {tag}, got {md}")))
    }
}

fn check_f32(mds: &[(Arg, Option<&MemoryDesc>)]) -> Result<()> {
    for (arg, md) in mds {
        if let Some(md) = md {
            if md.data_type() != DataType::F32 {
                return Err(Error::unsupported_data_type(format!("{arg} is {}, only f32 is supported", md.data_type())));
            }
        }
    }
    Ok(())
}

fn check_isa(engine: &Engine) -> Result<()> {
    if engine.mayiuse(NCSP_MIN_ISA) {
        Ok(())
    } else {
        Err(Error::unsupported_isa(NCSP_MIN_ISA, engine.isa()))
    }
}

/// Channel-last descriptors for the request's two activations.
fn nspc_activations(conv: &ConvDesc) -> Result<(MemoryDesc, MemoryDesc)> {
    let tag = FormatTag::nspc(conv.ndims())?;
    Ok((conv.src().retag(tag)?, conv.dst().retag(tag)?))
}

/// Negotiate the channel-last convolution, skipping the composite's own
/// entry in the implementation list.
fn negotiate_nspc(
    engine: &Engine,
    nspc_conv: ConvDesc,
    attr: &PrimitiveAttr,
    self_id: &str,
) -> Result<Arc<dyn PrimitiveDesc>> {
    let op = OpDesc::Convolution(nspc_conv);
    let skip = ImplListItem::find(engine.implementation_list(&op), self_id);
    let mut candidates = engine.iter(&op, attr, skip)?;
    let pd = candidates
        .next()
        .ok_or_else(|| Error::NoViableImplementation(op.to_string()))?;
    tracing::debug!(composite = self_id, selected = pd.name(), "nested_convolution_selected");
    Ok(pd)
}

fn create_reorder(engine: &Engine, src: &MemoryDesc, dst: &MemoryDesc) -> Result<Arc<dyn PrimitiveDesc>> {
    let op = OpDesc::Reorder(ReorderDesc::new(src.clone(), dst.clone())?);
    engine.create_primitive_desc(&op, &PrimitiveAttr::default())
}

/// Descriptor the sub-primitive resolved for `arg`.
fn resolved_md(pd: &dyn PrimitiveDesc, arg: Arg) -> Result<MemoryDesc> {
    pd.arg_md(arg)
        .cloned()
        .ok_or_else(|| Error::invalid(format!("{} does not report a descriptor for {arg}", pd.name())))
}

fn instantiate(pd: &Arc<dyn PrimitiveDesc>, engine: &Engine) -> Result<Arc<dyn Primitive>> {
    Arc::clone(pd).create_primitive(engine)
}

/// Bind a scratchpad region to a descriptor.
fn scratch_memory(ctx: &ExecCtx<'_>, key: Key, md: &MemoryDesc) -> Result<Memory> {
    Memory::new(md.clone(), ctx.scratchpad().get(key)?)
}

/// Run one pipeline step under its own nested scratchpad grantor.
fn execute_nested(
    ctx: &ExecCtx<'_>,
    prim: &Arc<dyn Primitive>,
    slot: Nested,
    args: ExecArgs,
    composite: &'static str,
    step: &'static str,
) -> Result<()> {
    let grantor = ctx.scratchpad().nested(Key::Nested(slot))?;
    tracing::trace!(composite, step, primitive = prim.pd().name(), "pipeline_step");
    let _span = perf_span!(step, composite = composite);
    prim.execute(&ExecCtx::new(args, grantor))
}

/// Run a reorder `input -> output` as one pipeline step.
fn reorder_activations(
    ctx: &ExecCtx<'_>,
    prim: &Arc<dyn Primitive>,
    slot: Nested,
    input: MemoryArg,
    output: MemoryArg,
    composite: &'static str,
    step: &'static str,
) -> Result<()> {
    let mut args = ExecArgs::new();
    args.insert(Arg::Src, input);
    args.insert(Arg::Dst, output);
    execute_nested(ctx, prim, slot, args, composite, step)
}

/// Descriptor lookup shared by the composites.
fn conv_arg_md<'a>(conv: &'a ConvDesc, attr: &'a PrimitiveAttr, arg: Arg) -> Option<&'a MemoryDesc> {
    match arg {
        Arg::PostOpSrc1(index) => attr.post_ops.binary_src1(index),
        _ => conv.arg_md(arg),
    }
}
