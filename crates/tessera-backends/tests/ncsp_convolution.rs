//! End-to-end checks of the channel-major convolution composites against a
//! naive NCHW convolution.

use tessera_backends::{cpu_engine, REF_MATMUL_ID, REF_NSPC_CONV_ID};
use tessera_core::scratchpad::{Key, Nested};
use tessera_core::{
    AlgKind, Arg, BinaryAlg, ConvDesc, ConvGeometry, CpuIsa, DataType, EltwiseAlg, Engine, EngineConfig, Error,
    ExecArgs, FormatTag, Memory, MemoryDesc, NcspConvolutionBwdDataPd, NcspConvolutionBwdWeightsPd,
    NcspConvolutionFwdPd, OpDesc, PostOps, Primitive, PrimitiveAttr, PrimitiveDesc, PropKind, Result, Strategy,
};

/// 2-D grouped convolution problem, square strides and padding.
#[derive(Clone, Copy)]
struct Problem {
    mb: usize,
    g: usize,
    icg: usize,
    ocg: usize,
    ih: usize,
    iw: usize,
    kh: usize,
    kw: usize,
    stride: usize,
    pad: usize,
}

impl Problem {
    fn ic(&self) -> usize {
        self.g * self.icg
    }

    fn oc(&self) -> usize {
        self.g * self.ocg
    }

    fn oh(&self) -> usize {
        (self.ih + 2 * self.pad - self.kh) / self.stride + 1
    }

    fn ow(&self) -> usize {
        (self.iw + 2 * self.pad - self.kw) / self.stride + 1
    }

    fn src_dims(&self) -> Vec<usize> {
        vec![self.mb, self.ic(), self.ih, self.iw]
    }

    fn dst_dims(&self) -> Vec<usize> {
        vec![self.mb, self.oc(), self.oh(), self.ow()]
    }

    fn weights_dims(&self) -> Vec<usize> {
        if self.g > 1 {
            vec![self.g, self.ocg, self.icg, self.kh, self.kw]
        } else {
            vec![self.oc(), self.ic(), self.kh, self.kw]
        }
    }

    fn geometry(&self) -> ConvGeometry {
        ConvGeometry::unit(2)
            .with_strides(vec![self.stride; 2])
            .with_padding(vec![self.pad; 2], vec![self.pad; 2])
    }

    /// Calls `f(n, oc, ic, oy, ox, iy, ix, weight_index)` for every tap that
    /// reads inside the input.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize, usize, usize, usize, usize, usize)) {
        for n in 0..self.mb {
            for oc in 0..self.oc() {
                let g = oc / self.ocg;
                for i in 0..self.icg {
                    let ic = g * self.icg + i;
                    for oy in 0..self.oh() {
                        for ox in 0..self.ow() {
                            for ky in 0..self.kh {
                                for kx in 0..self.kw {
                                    let iy = (oy * self.stride + ky) as isize - self.pad as isize;
                                    let ix = (ox * self.stride + kx) as isize - self.pad as isize;
                                    if iy < 0 || ix < 0 || iy as usize >= self.ih || ix as usize >= self.iw {
                                        continue;
                                    }
                                    let w = ((oc * self.icg + i) * self.kh + ky) * self.kw + kx;
                                    f(n, oc, ic, oy, ox, iy as usize, ix as usize, w);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn src_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.ic() + c) * self.ih + y) * self.iw + x
    }

    fn dst_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.oc() + c) * self.oh() + y) * self.ow() + x
    }

    fn forward(&self, src: &[f32], weights: &[f32], bias: Option<&[f32]>) -> Vec<f32> {
        let mut dst = vec![0.0; self.dst_dims().iter().product()];
        self.for_each_tap(|n, oc, ic, oy, ox, iy, ix, w| {
            dst[self.dst_index(n, oc, oy, ox)] += src[self.src_index(n, ic, iy, ix)] * weights[w];
        });
        if let Some(bias) = bias {
            for (i, value) in dst.iter_mut().enumerate() {
                *value += bias[(i / (self.oh() * self.ow())) % self.oc()];
            }
        }
        dst
    }

    fn backward_data(&self, diff_dst: &[f32], weights: &[f32]) -> Vec<f32> {
        let mut diff_src = vec![0.0; self.src_dims().iter().product()];
        self.for_each_tap(|n, oc, ic, oy, ox, iy, ix, w| {
            diff_src[self.src_index(n, ic, iy, ix)] += diff_dst[self.dst_index(n, oc, oy, ox)] * weights[w];
        });
        diff_src
    }

    fn backward_weights(&self, src: &[f32], diff_dst: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let mut diff_weights = vec![0.0; self.weights_dims().iter().product()];
        self.for_each_tap(|n, oc, ic, oy, ox, iy, ix, w| {
            diff_weights[w] += diff_dst[self.dst_index(n, oc, oy, ox)] * src[self.src_index(n, ic, iy, ix)];
        });
        let plane = self.oh() * self.ow();
        let mut diff_bias = vec![0.0; self.oc()];
        for (i, value) in diff_dst.iter().enumerate() {
            diff_bias[(i / plane) % self.oc()] += value;
        }
        (diff_weights, diff_bias)
    }
}

fn engine(matmul_reduction: bool) -> Engine {
    cpu_engine(
        EngineConfig::default()
            .with_isa(CpuIsa::Avx512Core)
            .with_matmul_reduction(matmul_reduction),
    )
}

/// Small quarter-step values so every partial sum is exact in f32.
fn data(len: usize, seed: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 7 + seed * 13) % 17) as f32 / 4.0 - 2.0).collect()
}

fn nchw(dims: Vec<usize>) -> Result<MemoryDesc> {
    MemoryDesc::with_tag(dims, DataType::F32, FormatTag::Nchw)
}

fn plain(dims: Vec<usize>) -> Result<MemoryDesc> {
    MemoryDesc::plain(dims, DataType::F32)
}

/// `ncw` view of 4-D `{n, c, 1, w}` dims.
fn ncw(dims: &[usize]) -> Result<MemoryDesc> {
    MemoryDesc::with_tag(vec![dims[0], dims[1], dims[3]], DataType::F32, FormatTag::Ncw)
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-4, "element {i}: got {a}, expected {e}");
    }
}

fn forward_op(p: &Problem, with_bias: bool) -> Result<OpDesc> {
    let bias = if with_bias { Some(plain(vec![p.oc()])?) } else { None };
    Ok(OpDesc::Convolution(ConvDesc::forward(
        PropKind::ForwardInference,
        AlgKind::Auto,
        nchw(p.src_dims())?,
        plain(p.weights_dims())?,
        bias,
        nchw(p.dst_dims())?,
        p.geometry(),
    )?))
}

/// Run the forward composite on `p` and return dst.
fn run_forward(
    engine: &Engine,
    p: &Problem,
    attr: &PrimitiveAttr,
    extra: ExecArgs,
    prior: Option<&[f32]>,
) -> Result<(Vec<f32>, Strategy)> {
    let op = forward_op(p, true)?;
    let pd = NcspConvolutionFwdPd::create(&op, attr, engine)?;
    let strategy = pd.strategy();
    let prim = pd.create_primitive(engine)?;

    let src = Memory::from_data(nchw(p.src_dims())?, &data(p.src_dims().iter().product(), 1))?;
    let weights = Memory::from_data(plain(p.weights_dims())?, &data(p.weights_dims().iter().product(), 2))?;
    let bias = Memory::from_data(plain(vec![p.oc()])?, &data(p.oc(), 3))?;
    let dst = Memory::allocate(nchw(p.dst_dims())?)?;
    if let Some(prior) = prior {
        dst.write(prior)?;
    }

    let mut args = ExecArgs::new()
        .input(Arg::Src, src)
        .input(Arg::Weights, weights)
        .input(Arg::Bias, bias)
        .output(Arg::Dst, dst.clone());
    for (arg, bound) in extra.iter() {
        args.insert(*arg, bound.clone());
    }
    prim.run(args, None)?;
    Ok((dst.read::<f32>()?, strategy))
}

fn expected_forward(p: &Problem) -> Vec<f32> {
    p.forward(
        &data(p.src_dims().iter().product(), 1),
        &data(p.weights_dims().iter().product(), 2),
        Some(&data(p.oc(), 3)),
    )
}

const STRIDED_3X3: Problem = Problem {
    mb: 2,
    g: 1,
    icg: 3,
    ocg: 4,
    ih: 5,
    iw: 6,
    kh: 3,
    kw: 3,
    stride: 2,
    pad: 1,
};

const GROUPED_1X1: Problem = Problem {
    mb: 2,
    g: 2,
    icg: 3,
    ocg: 2,
    ih: 3,
    iw: 4,
    kh: 1,
    kw: 1,
    stride: 1,
    pad: 0,
};

#[test]
fn forward_reformat_matches_naive() -> Result<()> {
    let engine = engine(true);
    let (dst, strategy) = run_forward(&engine, &STRIDED_3X3, &PrimitiveAttr::default(), ExecArgs::new(), None)?;
    assert_eq!(strategy, Strategy::Reformat);
    assert_close(&dst, &expected_forward(&STRIDED_3X3));
    Ok(())
}

#[test]
fn forward_matmul_matches_naive_and_reformat() -> Result<()> {
    let (via_matmul, strategy) =
        run_forward(&engine(true), &GROUPED_1X1, &PrimitiveAttr::default(), ExecArgs::new(), None)?;
    assert_eq!(strategy, Strategy::MatmulReduced);
    assert_close(&via_matmul, &expected_forward(&GROUPED_1X1));

    let (via_reformat, strategy) =
        run_forward(&engine(false), &GROUPED_1X1, &PrimitiveAttr::default(), ExecArgs::new(), None)?;
    assert_eq!(strategy, Strategy::Reformat);
    assert_close(&via_reformat, &via_matmul);
    Ok(())
}

#[test]
fn forward_compute_implementation_follows_strategy() -> Result<()> {
    let engine = engine(true);
    let attr = PrimitiveAttr::default();
    let reformat = NcspConvolutionFwdPd::create(&forward_op(&STRIDED_3X3, false)?, &attr, &engine)?;
    assert_eq!(reformat.compute_impl(), REF_NSPC_CONV_ID);
    let matmul = NcspConvolutionFwdPd::create(&forward_op(&GROUPED_1X1, false)?, &attr, &engine)?;
    assert_eq!(matmul.compute_impl(), REF_MATMUL_ID);
    Ok(())
}

#[test]
fn forward_sum_and_relu_post_ops() -> Result<()> {
    let mut post_ops = PostOps::new();
    post_ops.append_sum(0.5).append_eltwise(EltwiseAlg::Relu, 0.0, 0.0);
    let attr = PrimitiveAttr::new(post_ops);

    for (problem, matmul_reduction) in [(GROUPED_1X1, true), (GROUPED_1X1, false), (STRIDED_3X3, true)] {
        let nelems: usize = problem.dst_dims().iter().product();
        let prior = data(nelems, 9);
        let (dst, _) = run_forward(
            &engine(matmul_reduction),
            &problem,
            &attr,
            ExecArgs::new(),
            Some(&prior),
        )?;
        let expected: Vec<f32> = expected_forward(&problem)
            .iter()
            .zip(&prior)
            .map(|(v, old)| (v + 0.5 * old).max(0.0))
            .collect();
        assert_close(&dst, &expected);
    }
    Ok(())
}

#[test]
fn forward_binary_post_op_uses_reformat() -> Result<()> {
    let p = GROUPED_1X1;
    let scale_md = plain(vec![1, p.oc(), 1, 1])?;
    let mut post_ops = PostOps::new();
    post_ops.append_binary(BinaryAlg::Mul, scale_md.clone());
    let attr = PrimitiveAttr::new(post_ops);

    let scales = data(p.oc(), 5);
    let extra = ExecArgs::new().input(Arg::PostOpSrc1(0), Memory::from_data(scale_md, &scales)?);
    let (dst, strategy) = run_forward(&engine(true), &p, &attr, extra, None)?;
    assert_eq!(strategy, Strategy::Reformat);

    let plane = p.oh() * p.ow();
    let expected: Vec<f32> = expected_forward(&p)
        .iter()
        .enumerate()
        .map(|(i, v)| v * scales[(i / plane) % p.oc()])
        .collect();
    assert_close(&dst, &expected);
    Ok(())
}

#[test]
fn forward_one_spatial_dim() -> Result<()> {
    // ncw is nchw with a unit height
    let p = Problem {
        ih: 1,
        kh: 1,
        pad: 0,
        ..STRIDED_3X3
    };
    let engine = engine(true);
    let weights_dims = vec![p.oc(), p.ic(), p.kw];
    let op = OpDesc::Convolution(ConvDesc::forward(
        PropKind::ForwardTraining,
        AlgKind::Direct,
        ncw(&p.src_dims())?,
        MemoryDesc::any(weights_dims.clone(), DataType::F32)?,
        None,
        ncw(&p.dst_dims())?,
        ConvGeometry::unit(1).with_strides(vec![p.stride]),
    )?);
    let pd = NcspConvolutionFwdPd::create(&op, &PrimitiveAttr::default(), &engine)?;
    let weights_md = pd
        .arg_md(Arg::Weights)
        .cloned()
        .ok_or_else(|| Error::runtime("weights unresolved"))?;
    assert!(!weights_md.is_any());

    let src_data = data(p.src_dims().iter().product(), 1);
    let weights_data = data(weights_dims.iter().product(), 2);
    let dst = Memory::allocate(ncw(&p.dst_dims())?)?;
    let args = ExecArgs::new()
        .input(Arg::Src, Memory::from_data(ncw(&p.src_dims())?, &src_data)?)
        .input(Arg::Weights, Memory::from_data(weights_md, &weights_data)?)
        .output(Arg::Dst, dst.clone());
    pd.create_primitive(&engine)?.run(args, None)?;

    assert_close(&dst.read::<f32>()?, &p.forward(&src_data, &weights_data, None));
    Ok(())
}

fn run_backward_data(engine: &Engine, p: &Problem) -> Result<(Vec<f32>, Strategy)> {
    let op = OpDesc::Convolution(ConvDesc::backward_data(
        AlgKind::Auto,
        nchw(p.src_dims())?,
        plain(p.weights_dims())?,
        nchw(p.dst_dims())?,
        p.geometry(),
    )?);
    let pd = NcspConvolutionBwdDataPd::create(&op, &PrimitiveAttr::default(), engine)?;
    let strategy = pd.strategy();
    let prim = pd.create_primitive(engine)?;

    let diff_src = Memory::allocate(nchw(p.src_dims())?)?;
    let args = ExecArgs::new()
        .input(
            Arg::DiffDst,
            Memory::from_data(nchw(p.dst_dims())?, &data(p.dst_dims().iter().product(), 4))?,
        )
        .input(
            Arg::Weights,
            Memory::from_data(plain(p.weights_dims())?, &data(p.weights_dims().iter().product(), 2))?,
        )
        .output(Arg::DiffSrc, diff_src.clone());
    prim.run(args, None)?;
    Ok((diff_src.read::<f32>()?, strategy))
}

#[test]
fn backward_data_matches_naive() -> Result<()> {
    for (problem, matmul_reduction, strategy) in [
        (GROUPED_1X1, true, Strategy::MatmulReduced),
        (GROUPED_1X1, false, Strategy::Reformat),
        (STRIDED_3X3, true, Strategy::Reformat),
    ] {
        let (diff_src, chosen) = run_backward_data(&engine(matmul_reduction), &problem)?;
        assert_eq!(chosen, strategy);
        let expected = problem.backward_data(
            &data(problem.dst_dims().iter().product(), 4),
            &data(problem.weights_dims().iter().product(), 2),
        );
        assert_close(&diff_src, &expected);
    }
    Ok(())
}

#[test]
fn backward_data_matmul_transposes_weights() -> Result<()> {
    let p = GROUPED_1X1;
    let op = OpDesc::Convolution(ConvDesc::backward_data(
        AlgKind::Direct,
        nchw(p.src_dims())?,
        MemoryDesc::any(p.weights_dims(), DataType::F32)?,
        nchw(p.dst_dims())?,
        p.geometry(),
    )?);
    let pd = NcspConvolutionBwdDataPd::create(&op, &PrimitiveAttr::default(), &engine(true))?;
    let (a, b, c) = pd.matmul_operands().ok_or_else(|| Error::runtime("matmul path not taken"))?;
    // weights {g, o, i, 1, 1} seen as {1, g, i, o}
    assert_eq!(a.dims(), &[1, p.g, p.icg, p.ocg]);
    assert_eq!(a.strides(), Some(&[p.g * p.ocg * p.icg, p.ocg * p.icg, 1, p.icg][..]));
    assert_eq!(b.dims(), &[p.mb, p.g, p.ocg, p.ih * p.iw]);
    assert_eq!(c.dims(), &[p.mb, p.g, p.icg, p.ih * p.iw]);
    // Any weights become plain
    let weights = pd.arg_md(Arg::Weights).ok_or_else(|| Error::runtime("no weights"))?;
    assert_eq!(weights, &weights.to_plain());
    Ok(())
}

#[test]
fn backward_weights_matches_naive() -> Result<()> {
    let engine = engine(true);
    for problem in [STRIDED_3X3, GROUPED_1X1] {
        let p = &problem;
        let op = OpDesc::Convolution(ConvDesc::backward_weights(
            AlgKind::Auto,
            nchw(p.src_dims())?,
            MemoryDesc::any(p.weights_dims(), DataType::F32)?,
            Some(MemoryDesc::any(vec![p.oc()], DataType::F32)?),
            nchw(p.dst_dims())?,
            p.geometry(),
        )?);
        let pd = NcspConvolutionBwdWeightsPd::create(&op, &PrimitiveAttr::default(), &engine)?;
        assert_eq!(pd.compute_impl(), REF_NSPC_CONV_ID);
        let weights_md = pd
            .arg_md(Arg::DiffWeights)
            .cloned()
            .ok_or_else(|| Error::runtime("diff_weights unresolved"))?;
        let bias_md = pd
            .arg_md(Arg::DiffBias)
            .cloned()
            .ok_or_else(|| Error::runtime("diff_bias unresolved"))?;

        let src_data = data(p.src_dims().iter().product(), 1);
        let diff_dst_data = data(p.dst_dims().iter().product(), 4);
        let diff_weights = Memory::allocate(weights_md)?;
        let diff_bias = Memory::allocate(bias_md)?;
        let args = ExecArgs::new()
            .input(Arg::Src, Memory::from_data(nchw(p.src_dims())?, &src_data)?)
            .input(Arg::DiffDst, Memory::from_data(nchw(p.dst_dims())?, &diff_dst_data)?)
            .output(Arg::DiffWeights, diff_weights.clone())
            .output(Arg::DiffBias, diff_bias.clone());
        pd.create_primitive(&engine)?.run(args, None)?;

        let (expected_weights, expected_bias) = p.backward_weights(&src_data, &diff_dst_data);
        assert_close(&diff_weights.read::<f32>()?, &expected_weights);
        assert_close(&diff_bias.read::<f32>()?, &expected_bias);
    }
    Ok(())
}

#[test]
fn forward_scratchpad_layout() -> Result<()> {
    let p = Problem {
        mb: 2,
        g: 1,
        icg: 8,
        ocg: 8,
        ih: 4,
        iw: 4,
        kh: 3,
        kw: 3,
        stride: 1,
        pad: 1,
    };
    let pd = NcspConvolutionFwdPd::create(&forward_op(&p, false)?, &PrimitiveAttr::default(), &engine(true))?;
    let registry = pd.scratchpad_registry();
    // reorders need no scratch, so only the compute slot is nested
    assert_eq!(
        registry.keys(),
        vec![Key::ConvNcspDst, Key::ConvNcspSrc, Key::Nested(Nested::Compute)]
    );
    for key in [Key::ConvNcspDst, Key::ConvNcspSrc] {
        assert_eq!(registry.entry(key).map(|e| e.size), Some(2 * 8 * 4 * 4 * 4));
    }
    let compute = registry
        .nested(Key::Nested(Nested::Compute))
        .ok_or_else(|| Error::runtime("compute slot missing"))?;
    assert_eq!(compute.keys(), vec![Key::ConvAccumulator]);
    assert_eq!(registry.size(), 3 * 1024);
    Ok(())
}

#[test]
fn caller_provided_scratchpad_is_used() -> Result<()> {
    let p = STRIDED_3X3;
    let engine = engine(true);
    let pd = NcspConvolutionFwdPd::create(&forward_op(&p, false)?, &PrimitiveAttr::default(), &engine)?;
    let scratchpad = pd.scratchpad_registry().allocate()?;
    let too_small = tessera_core::MemoryStorage::new(pd.scratchpad_registry().size() - 1);
    let prim = pd.create_primitive(&engine)?;

    let src_data = data(p.src_dims().iter().product(), 1);
    let weights_data = data(p.weights_dims().iter().product(), 2);
    let dst = Memory::allocate(nchw(p.dst_dims())?)?;
    let args = ExecArgs::new()
        .input(Arg::Src, Memory::from_data(nchw(p.src_dims())?, &src_data)?)
        .input(Arg::Weights, Memory::from_data(plain(p.weights_dims())?, &weights_data)?)
        .output(Arg::Dst, dst.clone());

    assert!(matches!(
        prim.run(args.clone(), Some(too_small.view())),
        Err(Error::Runtime(_))
    ));
    prim.run(args, Some(scratchpad.view()))?;
    assert_close(&dst.read::<f32>()?, &p.forward(&src_data, &weights_data, None));
    Ok(())
}

#[test]
fn channel_major_request_without_isa_has_no_implementation() -> Result<()> {
    let engine = cpu_engine(EngineConfig::default().with_isa(CpuIsa::Avx2));
    let result = engine.create_primitive_desc(&forward_op(&STRIDED_3X3, false)?, &PrimitiveAttr::default());
    assert!(matches!(result, Err(Error::NoViableImplementation(_))));
    Ok(())
}
