use super::reduction::{transpose_last_two, MatmulReduction};
use super::strategy::{select_strategy, Strategy};
use super::*;
use crate::op_desc::MatmulDesc;
use crate::scratchpad::ScratchpadRegistry;
use std::time::Instant;
use tessera_tracing::performance::{record_execution, record_scratchpad};

/// Backward-data channel-major convolution descriptor
#[derive(Debug)]
pub struct NcspConvolutionBwdDataPd {
    op: OpDesc,
    conv: ConvDesc,
    attr: PrimitiveAttr,
    plan: BwdDataPlan,
    registry: ScratchpadRegistry,
}

#[derive(Debug)]
enum BwdDataPlan {
    Reformat {
        nspc_diff_src: MemoryDesc,
        nspc_diff_dst: MemoryDesc,
        conv_pd: Arc<dyn PrimitiveDesc>,
        diff_src_reorder_pd: Arc<dyn PrimitiveDesc>,
        diff_dst_reorder_pd: Arc<dyn PrimitiveDesc>,
    },
    Matmul {
        /// Transposed weights `{1, [g], i, o}`
        matmul_src: MemoryDesc,
        /// diff_dst `{n, [g], o, sp}`
        matmul_weights: MemoryDesc,
        /// diff_src `{n, [g], i, sp}`
        matmul_dst: MemoryDesc,
        matmul_pd: Arc<dyn PrimitiveDesc>,
    },
}

impl NcspConvolutionBwdDataPd {
    #[tracing::instrument(skip_all, fields(implementation = NCSP_BWD_DATA_ID))]
    pub fn create(op: &OpDesc, attr: &PrimitiveAttr, engine: &Engine) -> Result<Arc<Self>> {
        let conv = as_conv(op)?;
        check_default_attr(attr)?;
        check_not_empty(conv)?;
        let conv = set_default_alg_kind(conv)?;
        if !conv.prop_kind().is_bwd_data() {
            return Err(Error::UnsupportedPropKind(conv.prop_kind().to_string()));
        }
        check_ncsp(conv.src(), Arg::DiffSrc)?;
        check_ncsp(conv.dst(), Arg::DiffDst)?;
        check_f32(&[
            (Arg::DiffSrc, Some(conv.src())),
            (Arg::DiffDst, Some(conv.dst())),
            (Arg::Weights, Some(conv.weights())),
        ])?;
        check_isa(engine)?;

        let strategy = select_strategy(&conv, attr, engine.config());
        tracing::debug!(%strategy, "strategy_selected");
        let (conv, plan) = match strategy {
            Strategy::Reformat => Self::init_convolution(conv, attr, engine)?,
            Strategy::MatmulReduced => Self::init_matmul(conv, engine)?,
        };
        let registry = Self::init_scratchpad(&conv, &plan)?;
        record_scratchpad(NCSP_BWD_DATA_ID, registry.size(), registry.len());

        Ok(Arc::new(Self {
            op: OpDesc::Convolution(conv.clone()),
            conv,
            attr: attr.clone(),
            plan,
            registry,
        }))
    }

    fn init_convolution(conv: ConvDesc, attr: &PrimitiveAttr, engine: &Engine) -> Result<(ConvDesc, BwdDataPlan)> {
        let (nspc_diff_src, nspc_diff_dst) = nspc_activations(&conv)?;
        let nspc_conv = conv.with_activations(nspc_diff_src.clone(), nspc_diff_dst.clone())?;
        let conv_pd = negotiate_nspc(engine, nspc_conv, attr, NCSP_BWD_DATA_ID)?;

        let weights = resolved_md(conv_pd.as_ref(), Arg::Weights)?;
        let conv = conv.with_weights(weights, None)?;

        let diff_src_reorder_pd = create_reorder(engine, &nspc_diff_src, conv.src())?;
        let diff_dst_reorder_pd = create_reorder(engine, conv.dst(), &nspc_diff_dst)?;

        let plan = BwdDataPlan::Reformat {
            nspc_diff_src,
            nspc_diff_dst,
            conv_pd,
            diff_src_reorder_pd,
            diff_dst_reorder_pd,
        };
        Ok((conv, plan))
    }

    fn init_matmul(conv: ConvDesc, engine: &Engine) -> Result<(ConvDesc, BwdDataPlan)> {
        let weights = if conv.weights().is_any() {
            conv.weights().to_plain()
        } else {
            conv.weights().clone()
        };
        let conv = conv.with_weights(weights, None)?;
        let reduction = MatmulReduction::new(&conv);

        // diff_src{n, [g], i, sp} = wei^T{1, [g], i, o} x diff_dst{n, [g], o, sp}
        let matmul_weights = reduction.reshape_activations(conv.dst(), true, true)?;
        let reshaped_weights = reduction.reshape_weights(conv.weights(), true)?;
        let matmul_src = transpose_last_two(&reshaped_weights)?;
        let matmul_dst = reduction.reshape_activations(conv.src(), true, false)?;

        let matmul_op = OpDesc::Matmul(MatmulDesc::new(
            matmul_src.clone(),
            matmul_weights.clone(),
            None,
            matmul_dst.clone(),
        )?);
        let matmul_pd = engine.create_primitive_desc(&matmul_op, &PrimitiveAttr::default())?;

        let plan = BwdDataPlan::Matmul {
            matmul_src,
            matmul_weights,
            matmul_dst,
            matmul_pd,
        };
        Ok((conv, plan))
    }

    fn init_scratchpad(conv: &ConvDesc, plan: &BwdDataPlan) -> Result<ScratchpadRegistry> {
        let mut registry = ScratchpadRegistry::new();
        let mut scratchpad = registry.registrar();
        match plan {
            BwdDataPlan::Matmul { matmul_pd, .. } => {
                scratchpad.book_nested(Key::Nested(Nested::Compute), matmul_pd.scratchpad_registry())?;
            }
            BwdDataPlan::Reformat {
                conv_pd,
                diff_src_reorder_pd,
                diff_dst_reorder_pd,
                ..
            } => {
                let (diff_src, diff_dst) = (conv.src(), conv.dst());
                scratchpad.book(Key::ConvNcspDiffDst, diff_dst.nelems(), diff_dst.data_type().size())?;
                scratchpad.book(Key::ConvNcspDiffSrc, diff_src.nelems(), diff_src.data_type().size())?;
                scratchpad.book_nested(Key::Nested(Nested::Compute), conv_pd.scratchpad_registry())?;
                scratchpad.book_nested(
                    Key::Nested(Nested::DiffSrcReorder),
                    diff_src_reorder_pd.scratchpad_registry(),
                )?;
                scratchpad.book_nested(
                    Key::Nested(Nested::DiffDstReorder),
                    diff_dst_reorder_pd.scratchpad_registry(),
                )?;
            }
        }
        Ok(registry)
    }

    pub fn strategy(&self) -> Strategy {
        match self.plan {
            BwdDataPlan::Reformat { .. } => Strategy::Reformat,
            BwdDataPlan::Matmul { .. } => Strategy::MatmulReduced,
        }
    }

    /// Matmul operand descriptors `(a, b, c)` when the matmul path was taken.
    pub fn matmul_operands(&self) -> Option<(&MemoryDesc, &MemoryDesc, &MemoryDesc)> {
        match &self.plan {
            BwdDataPlan::Matmul {
                matmul_src,
                matmul_weights,
                matmul_dst,
                ..
            } => Some((matmul_src, matmul_weights, matmul_dst)),
            BwdDataPlan::Reformat { .. } => None,
        }
    }
}

impl PrimitiveDesc for NcspConvolutionBwdDataPd {
    fn name(&self) -> &'static str {
        NCSP_BWD_DATA_ID
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
            BwdDataPlan::Reformat {
                nspc_diff_src,
                nspc_diff_dst,
                conv_pd,
                diff_src_reorder_pd,
                diff_dst_reorder_pd,
            } => BwdDataStages::Reformat(ReformatStages {
                nspc_diff_src: nspc_diff_src.clone(),
                nspc_diff_dst: nspc_diff_dst.clone(),
                conv: instantiate(conv_pd, engine)?,
                diff_src_reorder: instantiate(diff_src_reorder_pd, engine)?,
                diff_dst_reorder: instantiate(diff_dst_reorder_pd, engine)?,
            }),
            BwdDataPlan::Matmul {
                matmul_src,
                matmul_weights,
                matmul_dst,
                matmul_pd,
            } => BwdDataStages::Matmul(MatmulStage {
                matmul_src: matmul_src.clone(),
                matmul_weights: matmul_weights.clone(),
                matmul_dst: matmul_dst.clone(),
                matmul: instantiate(matmul_pd, engine)?,
            }),
        };
        Ok(Arc::new(NcspConvolutionBwdData { pd: self, stages }))
    }
}

struct ReformatStages {
    nspc_diff_src: MemoryDesc,
    nspc_diff_dst: MemoryDesc,
    conv: Arc<dyn Primitive>,
    diff_src_reorder: Arc<dyn Primitive>,
    diff_dst_reorder: Arc<dyn Primitive>,
}

struct MatmulStage {
    matmul_src: MemoryDesc,
    matmul_weights: MemoryDesc,
    matmul_dst: MemoryDesc,
    matmul: Arc<dyn Primitive>,
}

enum BwdDataStages {
    Reformat(ReformatStages),
    Matmul(MatmulStage),
}

/// Backward-data channel-major convolution
pub struct NcspConvolutionBwdData {
    pd: Arc<NcspConvolutionBwdDataPd>,
    stages: BwdDataStages,
}

impl NcspConvolutionBwdData {
    fn execute_convolution(&self, ctx: &ExecCtx<'_>, stages: &ReformatStages) -> Result<usize> {
        let nspc_diff_src = scratch_memory(ctx, Key::ConvNcspDiffSrc, &stages.nspc_diff_src)?;
        let nspc_diff_dst = scratch_memory(ctx, Key::ConvNcspDiffDst, &stages.nspc_diff_dst)?;

        reorder_activations(
            ctx,
            &stages.diff_dst_reorder,
            Nested::DiffDstReorder,
            ctx.arg(Arg::DiffDst)?.clone(),
            MemoryArg::output(nspc_diff_dst.clone()),
            NCSP_BWD_DATA_ID,
            "diff_dst_reorder",
        )?;

        let mut conv_args = ExecArgs::new();
        conv_args.insert(Arg::DiffDst, MemoryArg::input(nspc_diff_dst));
        conv_args.insert(Arg::DiffSrc, MemoryArg::output(nspc_diff_src.clone()));
        conv_args.insert(Arg::Weights, ctx.arg(Arg::Weights)?.clone());
        execute_nested(ctx, &stages.conv, Nested::Compute, conv_args, NCSP_BWD_DATA_ID, "compute")?;

        reorder_activations(
            ctx,
            &stages.diff_src_reorder,
            Nested::DiffSrcReorder,
            MemoryArg::input(nspc_diff_src),
            ctx.arg(Arg::DiffSrc)?.clone(),
            NCSP_BWD_DATA_ID,
            "diff_src_reorder",
        )?;
        Ok(3)
    }

    fn execute_matmul(&self, ctx: &ExecCtx<'_>, stage: &MatmulStage) -> Result<usize> {
        let weights = ctx.input(Arg::Weights)?;
        let diff_dst = ctx.input(Arg::DiffDst)?;
        let diff_src = ctx.output(Arg::DiffSrc)?;

        let args = ExecArgs::new()
            .input(Arg::Src, weights.reinterpret(stage.matmul_src.clone())?)
            .input(Arg::Weights, diff_dst.reinterpret(stage.matmul_weights.clone())?)
            .output(Arg::Dst, diff_src.reinterpret(stage.matmul_dst.clone())?);

        execute_nested(ctx, &stage.matmul, Nested::Compute, args, NCSP_BWD_DATA_ID, "matmul")?;
        Ok(1)
    }
}

impl Primitive for NcspConvolutionBwdData {
    fn pd(&self) -> &dyn PrimitiveDesc {
        self.pd.as_ref()
    }

    fn execute(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let start = Instant::now();
        let steps = match &self.stages {
            BwdDataStages::Matmul(stage) => self.execute_matmul(ctx, stage)?,
            BwdDataStages::Reformat(stages) => self.execute_convolution(ctx, stages)?,
        };
        record_execution(NCSP_BWD_DATA_ID, steps, start.elapsed().as_micros() as u64);
        Ok(())
    }
}
