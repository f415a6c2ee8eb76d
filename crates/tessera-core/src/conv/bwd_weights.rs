use super::*;
use crate::scratchpad::ScratchpadRegistry;
use std::time::Instant;
use tessera_tracing::performance::{record_execution, record_scratchpad};

/// Backward-weights channel-major convolution descriptor.
///
/// There is no matmul shortcut here; the activations are always reordered
/// to channel-last scratch buffers.
#[derive(Debug)]
pub struct NcspConvolutionBwdWeightsPd {
    op: OpDesc,
    conv: ConvDesc,
    attr: PrimitiveAttr,
    nspc_src: MemoryDesc,
    nspc_diff_dst: MemoryDesc,
    conv_pd: Arc<dyn PrimitiveDesc>,
    src_reorder_pd: Arc<dyn PrimitiveDesc>,
    diff_dst_reorder_pd: Arc<dyn PrimitiveDesc>,
    registry: ScratchpadRegistry,
}

impl NcspConvolutionBwdWeightsPd {
    #[tracing::instrument(skip_all, fields(implementation = NCSP_BWD_WEIGHTS_ID))]
    pub fn create(op: &OpDesc, attr: &PrimitiveAttr, engine: &Engine) -> Result<Arc<Self>> {
        let conv = as_conv(op)?;
        check_default_attr(attr)?;
        check_not_empty(conv)?;
        let conv = set_default_alg_kind(conv)?;
        if !conv.prop_kind().is_bwd_weights() {
            return Err(Error::UnsupportedPropKind(conv.prop_kind().to_string()));
        }
        check_ncsp(conv.src(), Arg::Src)?;
        check_ncsp(conv.dst(), Arg::DiffDst)?;
        check_f32(&[
            (Arg::Src, Some(conv.src())),
            (Arg::DiffDst, Some(conv.dst())),
            (Arg::DiffWeights, Some(conv.weights())),
            (Arg::DiffBias, conv.bias()),
        ])?;
        check_isa(engine)?;

        let (nspc_src, nspc_diff_dst) = nspc_activations(&conv)?;
        let nspc_conv = conv.with_activations(nspc_src.clone(), nspc_diff_dst.clone())?;
        let conv_pd = negotiate_nspc(engine, nspc_conv, attr, NCSP_BWD_WEIGHTS_ID)?;

        let diff_weights = resolved_md(conv_pd.as_ref(), Arg::DiffWeights)?;
        let diff_bias = match conv.bias() {
            Some(_) => Some(resolved_md(conv_pd.as_ref(), Arg::DiffBias)?),
            None => None,
        };
        let conv = conv.with_weights(diff_weights, diff_bias)?;

        let src_reorder_pd = create_reorder(engine, conv.src(), &nspc_src)?;
        let diff_dst_reorder_pd = create_reorder(engine, conv.dst(), &nspc_diff_dst)?;

        let mut registry = ScratchpadRegistry::new();
        let mut scratchpad = registry.registrar();
        let (src, diff_dst) = (conv.src(), conv.dst());
        scratchpad.book(Key::ConvNcspDiffDst, diff_dst.nelems(), diff_dst.data_type().size())?;
        scratchpad.book(Key::ConvNcspSrc, src.nelems(), src.data_type().size())?;
        scratchpad.book_nested(Key::Nested(Nested::Compute), conv_pd.scratchpad_registry())?;
        scratchpad.book_nested(Key::Nested(Nested::SrcReorder), src_reorder_pd.scratchpad_registry())?;
        scratchpad.book_nested(
            Key::Nested(Nested::DiffDstReorder),
            diff_dst_reorder_pd.scratchpad_registry(),
        )?;
        record_scratchpad(NCSP_BWD_WEIGHTS_ID, registry.size(), registry.len());

        Ok(Arc::new(Self {
            op: OpDesc::Convolution(conv.clone()),
            conv,
            attr: attr.clone(),
            nspc_src,
            nspc_diff_dst,
            conv_pd,
            src_reorder_pd,
            diff_dst_reorder_pd,
            registry,
        }))
    }

    /// Name of the channel-last convolution the composite delegates to.
    pub fn compute_impl(&self) -> &'static str {
        self.conv_pd.name()
    }
}

impl PrimitiveDesc for NcspConvolutionBwdWeightsPd {
    fn name(&self) -> &'static str {
        NCSP_BWD_WEIGHTS_ID
    }

    fn op_desc(&self) -> &OpDesc {
        &self.op
    }

    fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    fn arg_md(&self, arg: Arg) -> Option<&MemoryDesc> {
        conv_arg_md(&self.conv, &self.attr, arg)
    }

    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.registry
    }

    fn create_primitive(self: Arc<Self>, engine: &Engine) -> Result<Arc<dyn Primitive>> {
        let conv = instantiate(&self.conv_pd, engine)?;
        let src_reorder = instantiate(&self.src_reorder_pd, engine)?;
        let diff_dst_reorder = instantiate(&self.diff_dst_reorder_pd, engine)?;
        Ok(Arc::new(NcspConvolutionBwdWeights {
            pd: self,
            conv,
            src_reorder,
            diff_dst_reorder,
        }))
    }
}

/// Backward-weights channel-major convolution
pub struct NcspConvolutionBwdWeights {
    pd: Arc<NcspConvolutionBwdWeightsPd>,
    conv: Arc<dyn Primitive>,
    src_reorder: Arc<dyn Primitive>,
    diff_dst_reorder: Arc<dyn Primitive>,
}

impl Primitive for NcspConvolutionBwdWeights {
    fn pd(&self) -> &dyn PrimitiveDesc {
        self.pd.as_ref()
    }

    fn execute(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let start = Instant::now();
        let nspc_src = scratch_memory(ctx, Key::ConvNcspSrc, &self.pd.nspc_src)?;
        let nspc_diff_dst = scratch_memory(ctx, Key::ConvNcspDiffDst, &self.pd.nspc_diff_dst)?;

        reorder_activations(
            ctx,
            &self.diff_dst_reorder,
            Nested::DiffDstReorder,
            ctx.arg(Arg::DiffDst)?.clone(),
            MemoryArg::output(nspc_diff_dst.clone()),
            NCSP_BWD_WEIGHTS_ID,
            "diff_dst_reorder",
        )?;
        reorder_activations(
            ctx,
            &self.src_reorder,
            Nested::SrcReorder,
            ctx.arg(Arg::Src)?.clone(),
            MemoryArg::output(nspc_src.clone()),
            NCSP_BWD_WEIGHTS_ID,
            "src_reorder",
        )?;

        let mut conv_args = ExecArgs::new();
        conv_args.insert(Arg::DiffDst, MemoryArg::input(nspc_diff_dst));
        conv_args.insert(Arg::Src, MemoryArg::input(nspc_src));
        conv_args.insert(Arg::DiffWeights, ctx.arg(Arg::DiffWeights)?.clone());
        if self.pd.conv.bias().is_some() {
            conv_args.insert(Arg::DiffBias, ctx.arg(Arg::DiffBias)?.clone());
        }
        execute_nested(ctx, &self.conv, Nested::Compute, conv_args, NCSP_BWD_WEIGHTS_ID, "compute")?;

        record_execution(NCSP_BWD_WEIGHTS_ID, 3, start.elapsed().as_micros() as u64);
        Ok(())
    }
}
