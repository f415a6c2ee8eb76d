//! Small closed enumerations shared by descriptors, engines and kernels

use std::fmt;

/// Maximum tensor rank a [`crate::MemoryDesc`] can describe.
///
/// Grouped 3-D convolution weights `{g, o, i, kd, kh, kw}` are the largest
/// tensors the convolution descriptors produce.
pub const MAX_NDIMS: usize = 6;

/// Element data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    Bf16,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Size of one element in bytes
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::F16 | DataType::Bf16 => 2,
            DataType::S8 | DataType::U8 => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::Bf16 => "bf16",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Propagation kind of a primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropKind {
    ForwardTraining,
    ForwardInference,
    BackwardData,
    BackwardWeights,
}

impl PropKind {
    pub fn is_fwd(self) -> bool {
        matches!(self, PropKind::ForwardTraining | PropKind::ForwardInference)
    }

    pub fn is_bwd_data(self) -> bool {
        self == PropKind::BackwardData
    }

    pub fn is_bwd_weights(self) -> bool {
        self == PropKind::BackwardWeights
    }
}

impl fmt::Display for PropKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropKind::ForwardTraining => "forward_training",
            PropKind::ForwardInference => "forward_inference",
            PropKind::BackwardData => "backward_data",
            PropKind::BackwardWeights => "backward_weights",
        };
        f.write_str(name)
    }
}

/// Convolution algorithm kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgKind {
    /// Let the implementation pick; resolved to `Direct` by implementations
    /// that only know the direct algorithm.
    Auto,
    Direct,
    Winograd,
}

/// CPU instruction set level, ordered by capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CpuIsa {
    Generic,
    Sse41,
    Avx2,
    Avx512Core,
    Avx512CoreBf16,
    Avx512CoreAmx,
}

impl CpuIsa {
    /// Best instruction set available on the running machine.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("avx512bf16") && std::is_x86_feature_detected!("avx512bw") {
                return CpuIsa::Avx512CoreBf16;
            }
            if std::is_x86_feature_detected!("avx512f")
                && std::is_x86_feature_detected!("avx512bw")
                && std::is_x86_feature_detected!("avx512vl")
                && std::is_x86_feature_detected!("avx512dq")
            {
                return CpuIsa::Avx512Core;
            }
            if std::is_x86_feature_detected!("avx2") {
                return CpuIsa::Avx2;
            }
            if std::is_x86_feature_detected!("sse4.1") {
                return CpuIsa::Sse41;
            }
        }
        CpuIsa::Generic
    }

    /// Parse the names used by `TESSERA_CPU_ISA`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "generic" | "none" => Some(CpuIsa::Generic),
            "sse41" | "sse4.1" => Some(CpuIsa::Sse41),
            "avx2" => Some(CpuIsa::Avx2),
            "avx512_core" | "avx512core" => Some(CpuIsa::Avx512Core),
            "avx512_core_bf16" => Some(CpuIsa::Avx512CoreBf16),
            "avx512_core_amx" | "amx" => Some(CpuIsa::Avx512CoreAmx),
            _ => None,
        }
    }
}

impl fmt::Display for CpuIsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpuIsa::Generic => "generic",
            CpuIsa::Sse41 => "sse41",
            CpuIsa::Avx2 => "avx2",
            CpuIsa::Avx512Core => "avx512_core",
            CpuIsa::Avx512CoreBf16 => "avx512_core_bf16",
            CpuIsa::Avx512CoreAmx => "avx512_core_amx",
        };
        f.write_str(name)
    }
}

/// Role of a memory argument bound to an execution call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arg {
    Src,
    Weights,
    Bias,
    Dst,
    DiffSrc,
    DiffWeights,
    DiffBias,
    DiffDst,
    /// Second operand of the binary post-op at the given index
    PostOpSrc1(usize),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Src => f.write_str("src"),
            Arg::Weights => f.write_str("weights"),
            Arg::Bias => f.write_str("bias"),
            Arg::Dst => f.write_str("dst"),
            Arg::DiffSrc => f.write_str("diff_src"),
            Arg::DiffWeights => f.write_str("diff_weights"),
            Arg::DiffBias => f.write_str("diff_bias"),
            Arg::DiffDst => f.write_str("diff_dst"),
            Arg::PostOpSrc1(idx) => write!(f, "post_op[{idx}].src1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isa_levels_are_ordered() {
        assert!(CpuIsa::Avx512Core > CpuIsa::Avx2);
        assert!(CpuIsa::Avx512CoreAmx >= CpuIsa::Avx512Core);
        assert!(CpuIsa::Generic < CpuIsa::Sse41);
    }

    #[test]
    fn isa_names_round_trip() {
        for isa in [CpuIsa::Generic, CpuIsa::Avx2, CpuIsa::Avx512Core, CpuIsa::Avx512CoreAmx] {
            assert_eq!(CpuIsa::from_name(&isa.to_string()), Some(isa));
        }
        assert_eq!(CpuIsa::from_name("pentium"), None);
    }

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::Bf16.size(), 2);
        assert_eq!(DataType::U8.size(), 1);
    }
}
