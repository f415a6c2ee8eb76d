//! Channel-major convolution benchmarks
//!
//! Compares the two composite strategies on 1x1 convolutions (matmul
//! reduction vs reorder to channel-last) and times a 3x3 convolution that
//! can only take the reorder path.
//!
//! `TESSERA_TRACING_PROFILE=performance` reports per-step timings.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tessera_backends::cpu_engine;
use tessera_core::{
    AlgKind, Arg, ConvDesc, ConvGeometry, CpuIsa, DataType, EngineConfig, ExecArgs, FormatTag, Memory, MemoryDesc,
    OpDesc, Primitive, PrimitiveAttr, PrimitiveDesc, PropKind,
};
use tessera_tracing::{init_global_tracing, TracingConfig};

fn nchw(dims: Vec<usize>) -> MemoryDesc {
    MemoryDesc::with_tag(dims, DataType::F32, FormatTag::Nchw).expect("valid nchw dims")
}

fn filled(desc: MemoryDesc) -> Memory {
    let values: Vec<f32> = (0..desc.nelems()).map(|i| (i % 13) as f32 * 0.1).collect();
    Memory::from_data(desc, &values).expect("allocation")
}

fn bench_forward(c: &mut Criterion, group_name: &str, kernel: usize, pad: usize) {
    // the second group finds the subscriber already installed
    let _ = init_global_tracing(&TracingConfig::from_env());
    let mut group = c.benchmark_group(group_name);

    for channels in [16, 64] {
        let (mb, spatial) = (2, 14);
        let src_md = nchw(vec![mb, channels, spatial, spatial]);
        let dst_md = nchw(vec![mb, channels, spatial, spatial]);
        let weights_md = MemoryDesc::plain(vec![channels, channels, kernel, kernel], DataType::F32).expect("weights");
        let geometry = ConvGeometry::unit(2).with_padding(vec![pad; 2], vec![pad; 2]);

        for matmul_reduction in [true, false] {
            let engine = cpu_engine(
                EngineConfig::default()
                    .with_isa(CpuIsa::Avx512Core)
                    .with_matmul_reduction(matmul_reduction),
            );
            let op = OpDesc::Convolution(
                ConvDesc::forward(
                    PropKind::ForwardInference,
                    AlgKind::Auto,
                    src_md.clone(),
                    weights_md.clone(),
                    None,
                    dst_md.clone(),
                    geometry.clone(),
                )
                .expect("valid convolution"),
            );
            let pd = engine
                .create_primitive_desc(&op, &PrimitiveAttr::default())
                .expect("negotiation");
            let scratchpad = pd.scratchpad_registry().allocate().expect("scratchpad");
            let prim = pd.create_primitive(&engine).expect("primitive");

            let args = ExecArgs::new()
                .input(Arg::Src, filled(src_md.clone()))
                .input(Arg::Weights, filled(weights_md.clone()))
                .output(Arg::Dst, Memory::allocate(dst_md.clone()).expect("dst"));

            let label = if matmul_reduction { "matmul_allowed" } else { "reorder_only" };
            group.bench_with_input(BenchmarkId::new(label, channels), &channels, |b, _| {
                b.iter(|| {
                    prim.run(args.clone(), Some(scratchpad.view())).expect("execution");
                    black_box(&args);
                });
            });
        }
    }

    group.finish();
}

fn benchmark_conv_1x1(c: &mut Criterion) {
    bench_forward(c, "ncsp_conv_1x1", 1, 0);
}

fn benchmark_conv_3x3(c: &mut Criterion) {
    bench_forward(c, "ncsp_conv_3x3", 3, 1);
}

criterion_group!(benches, benchmark_conv_1x1, benchmark_conv_3x3);
criterion_main!(benches);
