//! # tessera-core - Composite tensor primitives
//!
//! Descriptor negotiation, shape algebra and scratchpad planning for a CPU
//! primitive library, plus the channel-major ("ncsp") convolution
//! composites built on top of them.
//!
//! ## Architecture
//!
//! - **Descriptors**: [`MemoryDesc`] describes a tensor (dims, data type,
//!   layout); [`OpDesc`] describes a requested operation.
//! - **Negotiation**: an [`Engine`] owns ordered implementation lists per
//!   [`OpKind`]. Each candidate either accepts the request, producing a
//!   [`PrimitiveDesc`], or rejects it with an [`Error`].
//! - **Composition**: a primitive descriptor may negotiate sub-primitives of
//!   its own (reorders, a channel-last convolution, a matmul) and folds
//!   their scratchpad needs into its own [`scratchpad::ScratchpadRegistry`].
//! - **Execution**: a [`Primitive`] runs against an [`ExecCtx`] that carries
//!   the bound arguments and a scratchpad [`scratchpad::Grantor`].
//!
//! Concrete compute kernels live in `tessera-backends`; this crate only
//! defines the contracts and the composites.
//!
//! ## Example
//!
//! ```rust
//! use tessera_core::{DataType, FormatTag, MemoryDesc};
//!
//! let src = MemoryDesc::with_tag(vec![2, 8, 4, 4], DataType::F32, FormatTag::Nchw)?;
//! let nhwc = src.retag(FormatTag::Nhwc)?;
//! assert_eq!(nhwc.strides(), Some(&[128, 1, 32, 8][..]));
//!
//! // A 1x1 convolution's src seen as a batched matmul operand
//! let flat = src.reshape(&[2, 8, 16])?;
//! assert_eq!(flat.strides(), Some(&[128, 16, 1][..]));
//! # Ok::<(), tessera_core::Error>(())
//! ```

pub mod attr;
pub mod config;
pub mod conv;
pub mod engine;
pub mod error;
pub mod memory_desc;
pub mod op_desc;
pub mod primitive;
pub mod scratchpad;
pub mod storage;
pub mod types;

// Re-export primary types
pub use attr::{BinaryAlg, EltwiseAlg, PostOp, PostOps, PrimitiveAttr};
pub use config::EngineConfig;
pub use conv::strategy::Strategy;
pub use conv::{
    ncsp_bwd_data_impl, ncsp_bwd_weights_impl, ncsp_fwd_impl, NcspConvolutionBwdData, NcspConvolutionBwdDataPd,
    NcspConvolutionBwdWeights, NcspConvolutionBwdWeightsPd, NcspConvolutionFwd, NcspConvolutionFwdPd,
};
pub use engine::{Engine, EngineBuilder, ImplListItem, PrimitiveDescIterator};
pub use error::{Error, ErrorCategory, Result};
pub use memory_desc::{FormatKind, FormatTag, Layout, MemoryDesc};
pub use op_desc::{ConvDesc, ConvGeometry, MatmulDesc, OpDesc, OpKind, ReorderDesc};
pub use primitive::{ExecArgs, ExecCtx, MemoryArg, Primitive, PrimitiveDesc};
pub use storage::{Memory, MemoryStorage, StorageView};
pub use types::{AlgKind, Arg, CpuIsa, DataType, PropKind, MAX_NDIMS};
