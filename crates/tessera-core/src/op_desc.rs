//! Operation descriptors
//!
//! An operation descriptor is the request handed to the engine: which
//! operator, which tensors, which parameters. It carries no implementation
//! choice. Implementations receive it during negotiation and either accept
//! (producing a primitive descriptor) or reject it.

use crate::error::{Error, Result};
use crate::memory_desc::MemoryDesc;
use crate::types::{AlgKind, Arg, PropKind};
use std::fmt;

/// Spatial parameters of a convolution, one entry per spatial dim.
///
/// Dilation follows the zero-based convention: `0` means a dense kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub strides: Vec<usize>,
    pub dilates: Vec<usize>,
    pub padding_l: Vec<usize>,
    pub padding_r: Vec<usize>,
}

impl ConvGeometry {
    /// Unit strides, no dilation, no padding.
    pub fn unit(spatial_dims: usize) -> Self {
        Self {
            strides: vec![1; spatial_dims],
            dilates: vec![0; spatial_dims],
            padding_l: vec![0; spatial_dims],
            padding_r: vec![0; spatial_dims],
        }
    }

    pub fn with_strides(mut self, strides: Vec<usize>) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_dilates(mut self, dilates: Vec<usize>) -> Self {
        self.dilates = dilates;
        self
    }

    pub fn with_padding(mut self, padding_l: Vec<usize>, padding_r: Vec<usize>) -> Self {
        self.padding_l = padding_l;
        self.padding_r = padding_r;
        self
    }
}

/// Convolution request.
///
/// `src` and `dst` hold the gradient tensors for the backward propagation
/// kinds (`diff_src` for backward-data, `diff_dst` for both backward kinds),
/// and `weights`/`bias` hold `diff_weights`/`diff_bias` for
/// backward-weights. [`ConvDesc::src_arg`] and friends map a field to the
/// execution argument it is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvDesc {
    prop_kind: PropKind,
    alg_kind: AlgKind,
    src: MemoryDesc,
    weights: MemoryDesc,
    bias: Option<MemoryDesc>,
    dst: MemoryDesc,
    geometry: ConvGeometry,
}

impl ConvDesc {
    /// Forward convolution (training or inference).
    pub fn forward(
        prop_kind: PropKind,
        alg_kind: AlgKind,
        src: MemoryDesc,
        weights: MemoryDesc,
        bias: Option<MemoryDesc>,
        dst: MemoryDesc,
        geometry: ConvGeometry,
    ) -> Result<Self> {
        if !prop_kind.is_fwd() {
            return Err(Error::UnsupportedPropKind(format!(
                "{prop_kind} is not a forward propagation kind"
            )));
        }
        Self::init(prop_kind, alg_kind, src, weights, bias, dst, geometry)
    }

    /// Gradient with respect to the source.
    pub fn backward_data(
        alg_kind: AlgKind,
        diff_src: MemoryDesc,
        weights: MemoryDesc,
        diff_dst: MemoryDesc,
        geometry: ConvGeometry,
    ) -> Result<Self> {
        Self::init(PropKind::BackwardData, alg_kind, diff_src, weights, None, diff_dst, geometry)
    }

    /// Gradient with respect to weights and bias.
    pub fn backward_weights(
        alg_kind: AlgKind,
        src: MemoryDesc,
        diff_weights: MemoryDesc,
        diff_bias: Option<MemoryDesc>,
        diff_dst: MemoryDesc,
        geometry: ConvGeometry,
    ) -> Result<Self> {
        Self::init(
            PropKind::BackwardWeights,
            alg_kind,
            src,
            diff_weights,
            diff_bias,
            diff_dst,
            geometry,
        )
    }

    fn init(
        prop_kind: PropKind,
        alg_kind: AlgKind,
        src: MemoryDesc,
        weights: MemoryDesc,
        bias: Option<MemoryDesc>,
        dst: MemoryDesc,
        geometry: ConvGeometry,
    ) -> Result<Self> {
        let desc = Self {
            prop_kind,
            alg_kind,
            src,
            weights,
            bias,
            dst,
            geometry,
        };
        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> Result<()> {
        let ndims = self.src.ndims();
        if !(3..=5).contains(&ndims) {
            return Err(Error::invalid(format!("convolution activations must be 3-5D, got {ndims}D")));
        }
        if self.dst.ndims() != ndims {
            return Err(Error::invalid(format!(
                "src and dst rank differ: {} vs {}",
                ndims,
                self.dst.ndims()
            )));
        }
        let with_groups = match self.weights.ndims() {
            n if n == ndims => false,
            n if n == ndims + 1 => true,
            n => {
                return Err(Error::invalid(format!(
                    "weights rank {n} incompatible with activation rank {ndims}"
                )));
            }
        };

        let sp = ndims - 2;
        let geom = &self.geometry;
        if [geom.strides.len(), geom.dilates.len(), geom.padding_l.len(), geom.padding_r.len()]
            .iter()
            .any(|&len| len != sp)
        {
            return Err(Error::invalid(format!(
                "strides, dilates and paddings must each have {sp} entries"
            )));
        }
        if geom.strides.contains(&0) {
            return Err(Error::invalid("convolution strides must be positive"));
        }

        let wd = self.weights.dims();
        let off = usize::from(with_groups);
        let g = if with_groups { wd[0] } else { 1 };
        let (oc, ic) = (g * wd[off], g * wd[off + 1]);
        let (sd, dd) = (self.src.dims(), self.dst.dims());

        if sd[0] != dd[0] {
            return Err(Error::invalid(format!("batch mismatch: src {} vs dst {}", sd[0], dd[0])));
        }
        if sd[1] != ic {
            return Err(Error::invalid(format!(
                "src channels {} do not match weights input channels {ic}",
                sd[1]
            )));
        }
        if dd[1] != oc {
            return Err(Error::invalid(format!(
                "dst channels {} do not match weights output channels {oc}",
                dd[1]
            )));
        }

        for i in 0..sp {
            let k = wd[off + 2 + i];
            let extent = (k.saturating_sub(1)) * (geom.dilates[i] + 1) + 1;
            let padded = sd[2 + i] + geom.padding_l[i] + geom.padding_r[i];
            let expected = if padded >= extent {
                (padded - extent) / geom.strides[i] + 1
            } else {
                0
            };
            if dd[2 + i] != expected {
                return Err(Error::invalid(format!(
                    "spatial dim {i}: dst extent {} inconsistent with geometry (expected {expected})",
                    dd[2 + i]
                )));
            }
        }

        if let Some(bias) = &self.bias {
            if bias.ndims() != 1 || bias.dims()[0] != oc {
                return Err(Error::invalid(format!("bias must be {{{oc}}}, got {:?}", bias.dims())));
            }
        }
        Ok(())
    }

    pub fn prop_kind(&self) -> PropKind {
        self.prop_kind
    }

    pub fn alg_kind(&self) -> AlgKind {
        self.alg_kind
    }

    /// Source activation (`diff_src` for backward-data).
    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }

    /// Weights (`diff_weights` for backward-weights).
    pub fn weights(&self) -> &MemoryDesc {
        &self.weights
    }

    /// Bias (`diff_bias` for backward-weights).
    pub fn bias(&self) -> Option<&MemoryDesc> {
        self.bias.as_ref()
    }

    /// Destination activation (`diff_dst` for the backward kinds).
    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn src_arg(&self) -> Arg {
        if self.prop_kind.is_bwd_data() {
            Arg::DiffSrc
        } else {
            Arg::Src
        }
    }

    pub fn weights_arg(&self) -> Arg {
        if self.prop_kind.is_bwd_weights() {
            Arg::DiffWeights
        } else {
            Arg::Weights
        }
    }

    pub fn bias_arg(&self) -> Arg {
        if self.prop_kind.is_bwd_weights() {
            Arg::DiffBias
        } else {
            Arg::Bias
        }
    }

    pub fn dst_arg(&self) -> Arg {
        if self.prop_kind.is_fwd() {
            Arg::Dst
        } else {
            Arg::DiffDst
        }
    }

    /// Descriptor bound to an execution argument, for the roles this
    /// propagation kind uses.
    pub fn arg_md(&self, arg: Arg) -> Option<&MemoryDesc> {
        if arg == self.src_arg() {
            Some(&self.src)
        } else if arg == self.weights_arg() {
            Some(&self.weights)
        } else if arg == self.bias_arg() {
            self.bias.as_ref()
        } else if arg == self.dst_arg() {
            Some(&self.dst)
        } else {
            None
        }
    }

    /// Activation rank.
    pub fn ndims(&self) -> usize {
        self.src.ndims()
    }

    pub fn with_groups(&self) -> bool {
        self.weights.ndims() == self.ndims() + 1
    }

    /// Group count, 1 when ungrouped.
    pub fn groups(&self) -> usize {
        if self.with_groups() {
            self.weights.dims()[0]
        } else {
            1
        }
    }

    /// Minibatch size.
    pub fn mb(&self) -> usize {
        self.src.dims()[0]
    }

    pub fn ic(&self) -> usize {
        self.src.dims()[1]
    }

    pub fn oc(&self) -> usize {
        self.dst.dims()[1]
    }

    /// Kernel spatial extents.
    pub fn kernel(&self) -> &[usize] {
        let off = 2 + usize::from(self.with_groups());
        &self.weights.dims()[off..]
    }

    pub fn src_spatial(&self) -> &[usize] {
        &self.src.dims()[2..]
    }

    pub fn dst_spatial(&self) -> &[usize] {
        &self.dst.dims()[2..]
    }

    /// Copy of this request with activations replaced (e.g. retagged).
    pub fn with_activations(&self, src: MemoryDesc, dst: MemoryDesc) -> Result<Self> {
        Self::init(
            self.prop_kind,
            self.alg_kind,
            src,
            self.weights.clone(),
            self.bias.clone(),
            dst,
            self.geometry.clone(),
        )
    }

    /// Copy of this request with weights and bias replaced.
    pub fn with_weights(&self, weights: MemoryDesc, bias: Option<MemoryDesc>) -> Result<Self> {
        Self::init(
            self.prop_kind,
            self.alg_kind,
            self.src.clone(),
            weights,
            bias,
            self.dst.clone(),
            self.geometry.clone(),
        )
    }

    /// Copy of this request with `Auto` resolved to `alg`.
    pub fn with_alg_kind(&self, alg_kind: AlgKind) -> Self {
        Self {
            alg_kind,
            ..self.clone()
        }
    }
}

/// Batched matrix multiplication `dst = src x weights (+ bias)`.
///
/// All tensors have the same rank; the last two dims are the matrix dims
/// and leading dims broadcast (a dim of 1 in src or weights is repeated).
#[derive(Debug, Clone, PartialEq)]
pub struct MatmulDesc {
    src: MemoryDesc,
    weights: MemoryDesc,
    bias: Option<MemoryDesc>,
    dst: MemoryDesc,
}

impl MatmulDesc {
    pub fn new(src: MemoryDesc, weights: MemoryDesc, bias: Option<MemoryDesc>, dst: MemoryDesc) -> Result<Self> {
        let ndims = dst.ndims();
        if ndims < 2 {
            return Err(Error::invalid(format!("matmul tensors must be at least 2D, got {ndims}D")));
        }
        if src.ndims() != ndims || weights.ndims() != ndims {
            return Err(Error::invalid(format!(
                "matmul rank mismatch: src {}D, weights {}D, dst {}D",
                src.ndims(),
                weights.ndims(),
                ndims
            )));
        }

        let (s, w, d) = (src.dims(), weights.dims(), dst.dims());
        let (m, k, n) = (s[ndims - 2], s[ndims - 1], w[ndims - 1]);
        if w[ndims - 2] != k {
            return Err(Error::invalid(format!(
                "matmul inner dims differ: src K={k}, weights K={}",
                w[ndims - 2]
            )));
        }
        if d[ndims - 2] != m || d[ndims - 1] != n {
            return Err(Error::invalid(format!(
                "matmul dst must be {m}x{n}, got {}x{}",
                d[ndims - 2],
                d[ndims - 1]
            )));
        }
        for i in 0..ndims - 2 {
            let ok = |x: usize| x == d[i] || x == 1;
            if !ok(s[i]) || !ok(w[i]) || d[i] != s[i].max(w[i]) {
                return Err(Error::invalid(format!(
                    "matmul batch dim {i} does not broadcast: src {}, weights {}, dst {}",
                    s[i], w[i], d[i]
                )));
            }
        }
        if let Some(bias) = &bias {
            if bias.ndims() != ndims || bias.dims().iter().zip(d).any(|(&b, &x)| b != x && b != 1) {
                return Err(Error::invalid(format!(
                    "matmul bias {:?} does not broadcast to dst {:?}",
                    bias.dims(),
                    d
                )));
            }
        }

        Ok(Self {
            src,
            weights,
            bias,
            dst,
        })
    }

    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }

    pub fn weights(&self) -> &MemoryDesc {
        &self.weights
    }

    pub fn bias(&self) -> Option<&MemoryDesc> {
        self.bias.as_ref()
    }

    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }
}

/// Layout conversion between two descriptors of the same logical tensor
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderDesc {
    src: MemoryDesc,
    dst: MemoryDesc,
}

impl ReorderDesc {
    pub fn new(src: MemoryDesc, dst: MemoryDesc) -> Result<Self> {
        if src.dims() != dst.dims() {
            return Err(Error::invalid(format!(
                "reorder dims differ: {:?} vs {:?}",
                src.dims(),
                dst.dims()
            )));
        }
        Ok(Self { src, dst })
    }

    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }

    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }
}

/// Operator family, used to key implementation lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Convolution,
    Matmul,
    Reorder,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Convolution => f.write_str("convolution"),
            OpKind::Matmul => f.write_str("matmul"),
            OpKind::Reorder => f.write_str("reorder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpDesc {
    Convolution(ConvDesc),
    Matmul(MatmulDesc),
    Reorder(ReorderDesc),
}

impl OpDesc {
    pub fn kind(&self) -> OpKind {
        match self {
            OpDesc::Convolution(_) => OpKind::Convolution,
            OpDesc::Matmul(_) => OpKind::Matmul,
            OpDesc::Reorder(_) => OpKind::Reorder,
        }
    }

    pub fn as_conv(&self) -> Option<&ConvDesc> {
        match self {
            OpDesc::Convolution(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_matmul(&self) -> Option<&MatmulDesc> {
        match self {
            OpDesc::Matmul(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_reorder(&self) -> Option<&ReorderDesc> {
        match self {
            OpDesc::Reorder(desc) => Some(desc),
            _ => None,
        }
    }
}

impl From<ConvDesc> for OpDesc {
    fn from(desc: ConvDesc) -> Self {
        OpDesc::Convolution(desc)
    }
}

impl From<MatmulDesc> for OpDesc {
    fn from(desc: MatmulDesc) -> Self {
        OpDesc::Matmul(desc)
    }
}

impl From<ReorderDesc> for OpDesc {
    fn from(desc: ReorderDesc) -> Self {
        OpDesc::Reorder(desc)
    }
}

impl fmt::Display for OpDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpDesc::Convolution(c) => write!(
                f,
                "convolution[{}] src={} wei={} dst={} g={}",
                c.prop_kind,
                c.src,
                c.weights,
                c.dst,
                c.groups()
            ),
            OpDesc::Matmul(m) => write!(f, "matmul src={} wei={} dst={}", m.src, m.weights, m.dst),
            OpDesc::Reorder(r) => write!(f, "reorder {} -> {}", r.src, r.dst),
        }
    }
}
