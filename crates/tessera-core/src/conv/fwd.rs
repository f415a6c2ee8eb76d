use super::reduction::MatmulReduction;
use super::strategy::{select_strategy, Strategy};
use super::*;
use crate::attr::{BinaryAlg, PostOps};
use crate::op_desc::MatmulDesc;
use crate::scratchpad::ScratchpadRegistry;
use std::time::Instant;
use tessera_tracing::performance::{record_execution, record_scratchpad};

/// Forward channel-major convolution descriptor
#[derive(Debug)]
pub struct NcspConvolutionFwdPd {
    op: OpDesc,
    conv: ConvDesc,
    attr: PrimitiveAttr,
    plan: FwdPlan,
    registry: ScratchpadRegistry,
}

#[derive(Debug)]
enum FwdPlan {
    Reformat {
        nspc_src: MemoryDesc,
        nspc_dst: MemoryDesc,
        conv_pd: Arc<dyn PrimitiveDesc>,
        src_reorder_pd: Arc<dyn PrimitiveDesc>,
        dst_pre_reorder_pd: Option<Arc<dyn PrimitiveDesc>>,
        dst_post_reorder_pd: Arc<dyn PrimitiveDesc>,
    },
    Matmul {
        /// Conv weights seen as matmul A
        matmul_src: MemoryDesc,
        /// Conv src seen as matmul B
        matmul_weights: MemoryDesc,
        matmul_bias: Option<MemoryDesc>,
        matmul_dst: MemoryDesc,
        matmul_pd: Arc<dyn PrimitiveDesc>,
    },
}

impl NcspConvolutionFwdPd {
    #[tracing::instrument(skip_all, fields(implementation = NCSP_FWD_ID))]
    pub fn create(op: &OpDesc, attr: &PrimitiveAttr, engine: &Engine) -> Result<Arc<Self>> {
        let conv = as_conv(op)?;
        check_not_empty(conv)?;
        let conv = set_default_alg_kind(conv)?;
        if !conv.prop_kind().is_fwd() {
            return Err(Error::UnsupportedPropKind(conv.prop_kind().to_string()));
        }
        check_ncsp(conv.src(), Arg::Src)?;
        check_ncsp(conv.dst(), Arg::Dst)?;
        check_f32(&[
            (Arg::Src, Some(conv.src())),
            (Arg::Dst, Some(conv.dst())),
            (Arg::Weights, Some(conv.weights())),
            (Arg::Bias, conv.bias()),
        ])?;
        check_isa(engine)?;

        let strategy = select_strategy(&conv, attr, engine.config());
        tracing::debug!(%strategy, "strategy_selected");
        let (conv, plan) = match strategy {
            Strategy::Reformat => Self::init_convolution(conv, attr, engine)?,
            Strategy::MatmulReduced => Self::init_matmul(conv, attr, engine)?,
        };
        let registry = Self::init_scratchpad(&conv, &plan)?;
        record_scratchpad(NCSP_FWD_ID, registry.size(), registry.len());

        Ok(Arc::new(Self {
            op: OpDesc::Convolution(conv.clone()),
            conv,
            attr: attr.clone(),
            plan,
            registry,
        }))
    }

    fn init_convolution(conv: ConvDesc, attr: &PrimitiveAttr, engine: &Engine) -> Result<(ConvDesc, FwdPlan)> {
        let (nspc_src, nspc_dst) = nspc_activations(&conv)?;
        let nspc_conv = conv.with_activations(nspc_src.clone(), nspc_dst.clone())?;
        let conv_pd = negotiate_nspc(engine, nspc_conv, attr, NCSP_FWD_ID)?;

        let weights = if conv.weights().is_any() {
            resolved_md(conv_pd.as_ref(), Arg::Weights)?
        } else {
            conv.weights().clone()
        };
        let bias = match conv.bias() {
            Some(bias) if bias.is_any() => Some(resolved_md(conv_pd.as_ref(), Arg::Bias)?),
            other => other.cloned(),
        };
        let conv = conv.with_weights(weights, bias)?;

        let src_reorder_pd = create_reorder(engine, conv.src(), &nspc_src)?;
        let dst_pre_reorder_pd = match attr.post_ops.find_sum() {
            Some(_) => Some(create_reorder(engine, conv.dst(), &nspc_dst)?),
            None => None,
        };
        let dst_post_reorder_pd = create_reorder(engine, &nspc_dst, conv.dst())?;

        let plan = FwdPlan::Reformat {
            nspc_src,
            nspc_dst,
            conv_pd,
            src_reorder_pd,
            dst_pre_reorder_pd,
            dst_post_reorder_pd,
        };
        Ok((conv, plan))
    }

    fn init_matmul(conv: ConvDesc, attr: &PrimitiveAttr, engine: &Engine) -> Result<(ConvDesc, FwdPlan)> {
        let bias = conv.bias().map(|bias| if bias.is_any() { bias.to_plain() } else { bias.clone() });
        let conv = conv.with_weights(conv.weights().clone(), bias)?;
        let reduction = MatmulReduction::new(&conv);

        // Weights become A and src becomes B, which keeps src and dst
        // channel-major: dst{n, [g], o, sp} = wei{1, [g], o, i} x src{n, [g], i, sp}.
        let matmul_dst = reduction.reshape_activations(conv.dst(), true, true)?;
        let matmul_weights = reduction.reshape_activations(conv.src(), true, false)?;
        let matmul_src = reduction.reshape_weights(conv.weights(), true)?;
        let matmul_bias = conv.bias().map(|bias| reduction.reshape_bias(bias)).transpose()?;

        let mut post_ops = PostOps::new();
        if let Some(bias) = &matmul_bias {
            post_ops.append_binary(BinaryAlg::Add, bias.clone());
        }
        for op in &attr.post_ops {
            post_ops.push(op.clone());
        }
        let matmul_attr = PrimitiveAttr::new(post_ops);

        let matmul_op = OpDesc::Matmul(MatmulDesc::new(
            matmul_src,
            matmul_weights.clone(),
            None,
            matmul_dst.clone(),
        )?);
        let matmul_pd = engine.create_primitive_desc(&matmul_op, &matmul_attr)?;
        let matmul_src = resolved_md(matmul_pd.as_ref(), Arg::Src)?;

        let conv = if conv.weights().is_any() {
            let weights = reduction.reshape_weights(&matmul_src, false)?;
            conv.with_weights(weights, conv.bias().cloned())?
        } else {
            conv
        };

        let plan = FwdPlan::Matmul {
            matmul_src,
            matmul_weights,
            matmul_bias,
            matmul_dst,
            matmul_pd,
        };
        Ok((conv, plan))
    }

    fn init_scratchpad(conv: &ConvDesc, plan: &FwdPlan) -> Result<ScratchpadRegistry> {
        let mut registry = ScratchpadRegistry::new();
        let mut scratchpad = registry.registrar();
        match plan {
            FwdPlan::Matmul { matmul_pd, .. } => {
                scratchpad.book_nested(Key::Nested(Nested::Compute), matmul_pd.scratchpad_registry())?;
            }
            FwdPlan::Reformat {
                conv_pd,
                src_reorder_pd,
                dst_pre_reorder_pd,
                dst_post_reorder_pd,
                ..
            } => {
                let (src, dst) = (conv.src(), conv.dst());
                scratchpad.book(Key::ConvNcspDst, dst.nelems(), dst.data_type().size())?;
                scratchpad.book(Key::ConvNcspSrc, src.nelems(), src.data_type().size())?;
                scratchpad.book_nested(Key::Nested(Nested::Compute), conv_pd.scratchpad_registry())?;
                scratchpad.book_nested(Key::Nested(Nested::SrcReorder), src_reorder_pd.scratchpad_registry())?;
                if let Some(pd) = dst_pre_reorder_pd {
                    scratchpad.book_nested(Key::Nested(Nested::DstPreReorder), pd.scratchpad_registry())?;
                }
                scratchpad.book_nested(
                    Key::Nested(Nested::DstPostReorder),
                    dst_post_reorder_pd.scratchpad_registry(),
                )?;
            }
        }
        Ok(registry)
    }

    pub fn strategy(&self) -> Strategy {
        match self.plan {
            FwdPlan::Reformat { .. } => Strategy::Reformat,
            FwdPlan::Matmul { .. } => Strategy::MatmulReduced,
        }
    }

    /// Name of the compute sub-primitive the composite delegates to.
    pub fn compute_impl(&self) -> &'static str {
        match &self.plan {
            FwdPlan::Reformat { conv_pd, .. } => conv_pd.name(),
            FwdPlan::Matmul { matmul_pd, .. } => matmul_pd.name(),
        }
    }
}

impl PrimitiveDesc for NcspConvolutionFwdPd {
    fn name(&self) -> &'static str {
        NCSP_FWD_ID
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
        let stages = match &self.plan {
            FwdPlan::Reformat {
                nspc_src,
                nspc_dst,
                conv_pd,
                src_reorder_pd,
                dst_pre_reorder_pd,
                dst_post_reorder_pd,
            } => FwdStages::Reformat(ReformatStages {
                nspc_src: nspc_src.clone(),
                nspc_dst: nspc_dst.clone(),
                conv: instantiate(conv_pd, engine)?,
                src_reorder: instantiate(src_reorder_pd, engine)?,
                dst_pre_reorder: dst_pre_reorder_pd
                    .as_ref()
                    .map(|pd| instantiate(pd, engine))
                    .transpose()?,
                dst_post_reorder: instantiate(dst_post_reorder_pd, engine)?,
            }),
            FwdPlan::Matmul {
                matmul_src,
                matmul_weights,
                matmul_bias,
                matmul_dst,
                matmul_pd,
            } => FwdStages::Matmul(MatmulStage {
                matmul_src: matmul_src.clone(),
                matmul_weights: matmul_weights.clone(),
                matmul_bias: matmul_bias.clone(),
                matmul_dst: matmul_dst.clone(),
                matmul: instantiate(matmul_pd, engine)?,
            }),
        };
        Ok(Arc::new(NcspConvolutionFwd { pd: self, stages }))
    }
}

struct ReformatStages {
    nspc_src: MemoryDesc,
    nspc_dst: MemoryDesc,
    conv: Arc<dyn Primitive>,
    src_reorder: Arc<dyn Primitive>,
    dst_pre_reorder: Option<Arc<dyn Primitive>>,
    dst_post_reorder: Arc<dyn Primitive>,
}

struct MatmulStage {
    matmul_src: MemoryDesc,
    matmul_weights: MemoryDesc,
    matmul_bias: Option<MemoryDesc>,
    matmul_dst: MemoryDesc,
    matmul: Arc<dyn Primitive>,
}

enum FwdStages {
    Reformat(ReformatStages),
    Matmul(MatmulStage),
}

/// Forward channel-major convolution
pub struct NcspConvolutionFwd {
    pd: Arc<NcspConvolutionFwdPd>,
    stages: FwdStages,
}

impl NcspConvolutionFwd {
    fn execute_convolution(&self, ctx: &ExecCtx<'_>, stages: &ReformatStages) -> Result<usize> {
        let nspc_src = scratch_memory(ctx, Key::ConvNcspSrc, &stages.nspc_src)?;
        let nspc_dst = scratch_memory(ctx, Key::ConvNcspDst, &stages.nspc_dst)?;
        let mut steps = 0;

        reorder_activations(
            ctx,
            &stages.src_reorder,
            Nested::SrcReorder,
            ctx.arg(Arg::Src)?.clone(),
            MemoryArg::output(nspc_src.clone()),
            NCSP_FWD_ID,
            "src_reorder",
        )?;
        steps += 1;

        // The sum post-op reads the prior dst, so it has to be in scratch too.
        if let Some(dst_pre_reorder) = &stages.dst_pre_reorder {
            reorder_activations(
                ctx,
                dst_pre_reorder,
                Nested::DstPreReorder,
                ctx.arg(Arg::Dst)?.clone(),
                MemoryArg::output(nspc_dst.clone()),
                NCSP_FWD_ID,
                "dst_pre_reorder",
            )?;
            steps += 1;
        }

        let mut conv_args = ctx.args().clone();
        conv_args.insert(Arg::Src, MemoryArg::input(nspc_src));
        conv_args.insert(Arg::Dst, MemoryArg::output(nspc_dst.clone()));
        execute_nested(ctx, &stages.conv, Nested::Compute, conv_args, NCSP_FWD_ID, "compute")?;
        steps += 1;

        reorder_activations(
            ctx,
            &stages.dst_post_reorder,
            Nested::DstPostReorder,
            MemoryArg::input(nspc_dst),
            ctx.arg(Arg::Dst)?.clone(),
            NCSP_FWD_ID,
            "dst_post_reorder",
        )?;
        steps += 1;

        Ok(steps)
    }

    fn execute_matmul(&self, ctx: &ExecCtx<'_>, stage: &MatmulStage) -> Result<usize> {
        let src = ctx.input(Arg::Src)?;
        let weights = ctx.input(Arg::Weights)?;
        let dst = ctx.output(Arg::Dst)?;

        let mut args = ExecArgs::new()
            .input(Arg::Src, weights.reinterpret(stage.matmul_src.clone())?)
            .input(Arg::Weights, src.reinterpret(stage.matmul_weights.clone())?)
            .output(Arg::Dst, dst.reinterpret(stage.matmul_dst.clone())?);
        if let Some(matmul_bias) = &stage.matmul_bias {
            let bias = ctx.input(Arg::Bias)?;
            args = args.input(Arg::PostOpSrc1(0), bias.reinterpret(matmul_bias.clone())?);
        }

        execute_nested(ctx, &stage.matmul, Nested::Compute, args, NCSP_FWD_ID, "matmul")?;
        Ok(1)
    }
}

impl Primitive for NcspConvolutionFwd {
    fn pd(&self) -> &dyn PrimitiveDesc {
        self.pd.as_ref()
    }

    fn execute(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let start = Instant::now();
        let steps = match &self.stages {
            FwdStages::Matmul(stage) => self.execute_matmul(ctx, stage)?,
            FwdStages::Reformat(stages) => self.execute_convolution(ctx, stages)?,
        };
        record_execution(NCSP_FWD_ID, steps, start.elapsed().as_micros() as u64);
        Ok(())
    }
}
