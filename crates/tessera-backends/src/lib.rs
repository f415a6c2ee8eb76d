//! # tessera-backends - Reference CPU kernels
//!
//! Straightforward implementations of the primitives the composites in
//! `tessera-core` delegate to, and the default CPU engine that wires
//! everything together.
//!
//! | id              | operator    | notes                                     |
//! |-----------------|-------------|-------------------------------------------|
//! | `ref:reorder`   | reorder     | any strides to any strides, same type     |
//! | `ref:matmul`    | matmul      | f32, batch broadcasting, post-ops, rayon  |
//! | `ref:nspc_conv` | convolution | f32, channel-last, all propagation kinds  |
//!
//! ```rust
//! use tessera_backends::cpu_engine;
//! use tessera_core::{CpuIsa, EngineConfig, OpKind};
//!
//! let engine = cpu_engine(EngineConfig::default().with_isa(CpuIsa::Avx512Core));
//! let ids: Vec<_> = engine.implementations(OpKind::Convolution).iter().map(|i| i.id()).collect();
//! assert_eq!(ids, ["ncsp:fwd", "ncsp:bwd_data", "ncsp:bwd_weights", "ref:nspc_conv"]);
//! ```

pub mod conv;
pub mod matmul;
pub mod reorder;

mod post_ops;
mod tensor;

pub use conv::{RefNspcConvolution, RefNspcConvolutionPd, REF_NSPC_CONV_ID};
pub use matmul::{RefMatmul, RefMatmulPd, REF_MATMUL_ID};
pub use reorder::{RefReorder, RefReorderPd, REF_REORDER_ID};

use std::sync::Arc;
use tessera_core::{ncsp_bwd_data_impl, ncsp_bwd_weights_impl, ncsp_fwd_impl, Engine, EngineConfig, OpKind, PrimitiveDesc};

/// Engine with the channel-major composites ahead of the reference kernels.
pub fn cpu_engine(config: EngineConfig) -> Engine {
    Engine::builder()
        .config(config)
        .register_item(OpKind::Convolution, ncsp_fwd_impl())
        .register_item(OpKind::Convolution, ncsp_bwd_data_impl())
        .register_item(OpKind::Convolution, ncsp_bwd_weights_impl())
        .register(OpKind::Convolution, REF_NSPC_CONV_ID, |op, attr, engine| {
            Ok(RefNspcConvolutionPd::create(op, attr, engine)? as Arc<dyn PrimitiveDesc>)
        })
        .register(OpKind::Matmul, REF_MATMUL_ID, |op, attr, engine| {
            Ok(RefMatmulPd::create(op, attr, engine)? as Arc<dyn PrimitiveDesc>)
        })
        .register(OpKind::Reorder, REF_REORDER_ID, |op, attr, engine| {
            Ok(RefReorderPd::create(op, attr, engine)? as Arc<dyn PrimitiveDesc>)
        })
        .build()
}
